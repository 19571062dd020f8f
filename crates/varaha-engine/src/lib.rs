//! Varaha Engine - signal evaluation and position lifecycle for F&O.
//!
//! The decision core: candles in, orders out. Per tick, for every
//! instrument in the universe, the engine converts raw candles to numeric
//! series, computes one bundle of technical indicators, evaluates the
//! compiled strategy's rules against the merged fact map, and executes the
//! resulting action batch through the broker capability surface. The
//! durable session ledger survives restarts and reconciles itself against
//! broker-reported positions.
//!
//! ## Scheduling model
//!
//! Single-threaded and synchronous: one tick evaluates every instrument in
//! sequence and blocks on whatever broker calls it issues. The ledger
//! never needs locks because only one logical thread touches it.

pub mod config;
pub mod contracts;
pub mod engine;
pub mod execution;
pub mod facts;
pub mod indicators;
pub mod margin;
pub mod rules;
pub mod series;
pub mod state;

pub use config::EngineConfig;
pub use engine::{Engine, TickSummary};
pub use rules::{CompiledStrategy, RuleManager, StrategyDefinition};
pub use state::SessionStore;
