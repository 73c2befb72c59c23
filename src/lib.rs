//! Bracket Bandit Library
//!
//! Contextual-bandit trade gating/sizing plus bracket-order protection for a
//! futures-style exchange.

pub mod config;
pub mod estimator;
pub mod exchange;
pub mod features;
pub mod guard;
pub mod persistence;
pub mod policy;
pub mod quantize;
pub mod runner;

// Re-export main types for convenience
pub use config::Config;
pub use estimator::{EstimatorState, LinUcb};
pub use exchange::{
    BookTicker, Exchange, ExchangeError, HttpExchange, NewOrder, OpenOrder, OrderKind, OrderSide,
    PositionMode, PositionRisk, WorkingType,
};
pub use features::{FeatureVector, DIM, FEATURE_NAMES};
pub use guard::{BracketGuard, EntryProtection, GuardConfig, ProtectionOrders};
pub use persistence::PolicyStore;
pub use policy::{BanditPolicy, Decision, PolicyConfig, PolicyState, SizeBucket};
pub use quantize::{ceil_to, floor_to, round_trigger, PositionDir, TriggerKind};
pub use runner::Runner;
