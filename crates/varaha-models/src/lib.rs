//! Varaha Models - core domain types for the F&O decision engine.
//!
//! Everything here is plain data: instruments, candle series, facts,
//! positions, resolved contracts and the structured records the engine
//! emits for reporting sinks. No I/O, no broker coupling.

pub mod candle;
pub mod contract;
pub mod events;
pub mod facts;
pub mod instrument;
pub mod position;

pub use candle::PriceSeries;
pub use contract::{Contract, CreditSpread};
pub use events::{EventSink, ExitRecord, NullSink, ScanRecord, SignalRecord};
pub use facts::{FactMap, FactValue};
pub use instrument::{ExpiryPolicy, Instrument, InstrumentKind, OptionRight, TransactionSide};
pub use position::{Position, PositionStatus, SessionState};
