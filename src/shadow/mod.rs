//! 👻 Shadow execution: rehearse decision packs against price history

pub mod engine;
pub mod trade;

pub use engine::{ExitReport, OpenReport, ShadowEngineConfig, ShadowExecutionEngine};
pub use trade::{Evaluation, ExitReason, ShadowError, ShadowTrade, TradeStatus};
