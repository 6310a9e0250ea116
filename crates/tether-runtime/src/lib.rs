pub mod classifier;
pub mod closed_runs;
pub mod driver;
pub mod engine;
pub mod history;
pub mod refresh;

pub use classifier::{classify, EventClass};
pub use driver::{
    AgentSnapshot, ReconcilerRuntime, RuntimeConfig, RuntimeError, RuntimeHandle, RuntimeUpdate,
};
pub use engine::{
    AgentState, AgentStatus, EngineConfig, EngineEffect, LiveStream, ObservationKind,
    ReconciliationEngine, ResyncReason, TerminalObservation,
};
pub use refresh::{parse_session_summaries, Debouncer, SessionSummary};
