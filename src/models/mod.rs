// Core models
pub mod confirmation;
pub mod match_model;
pub mod rating;

// Re-export commonly used types
pub use confirmation::*;
pub use match_model::*;
pub use rating::*;
