//! 🧭 Regime-aware decision and rehearsal engine
//!
//! Market observations become regime classifications, validated and scored signals,
//! signed decision packs, and finally shadow trades rehearsed against price history.

pub mod clock;
pub mod config;
pub mod cycle;
pub mod decision_engine;
pub mod providers;
pub mod regime;
pub mod scoring;
pub mod shadow;
pub mod signing;
pub mod store;
pub mod validation;

pub use config::Config;
