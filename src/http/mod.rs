pub mod health;
pub mod settlement_handler;

pub use settlement_handler::AppState;
