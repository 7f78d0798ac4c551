//! Scheduling layer: strategic resolution, capability routing, the phase
//! oscillator, retry bookkeeping and the orchestrator that composes them.

pub mod orchestrator;
pub mod oscillator;
pub mod resolver;
pub mod retry;
pub mod router;

pub use orchestrator::{
    Orchestrator, OrchestratorEvent, SubmitOutcome, TaskRecord, TaskStatus, TickReport,
    WorkerOutcome,
};
pub use oscillator::{
    phase_scale, CoherenceLogEntry, OscillatorConfig, Phase, PhaseOscillator, PhaseState,
    PhaseStatus, PhaseTransition, TransitionCause,
};
pub use resolver::{
    ActionId, ActionScore, Resolution, ResolutionWeights, ScoringTable, StrategicContext,
    StrategicResolver, TacticalAction,
};
pub use retry::{RetryPolicy, RetryTracker, DEFAULT_MAX_RETRIES};
pub use router::CapabilityRouter;
