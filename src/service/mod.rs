// Service layer module for MatchPoint
pub mod confirmation_service;
pub mod dispute_service;
pub mod expiry_service;
pub mod rating_calculator;
pub mod retry;
pub mod settlement_service;

pub use confirmation_service::ConfirmationService;
pub use dispute_service::{DiscardOutcome, DisputeService};
pub use expiry_service::{ExpiryService, SweepFailure, SweepReport};
pub use rating_calculator::{Glicko2Params, RatingCalculator};
pub use settlement_service::{ApplyOutcome, SettlementService};
