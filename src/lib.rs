pub mod candidate;
pub mod client;
pub mod config;
pub mod judge;
pub mod optimizer;
pub mod parsing;
pub mod prompts;
pub mod registry;
pub mod session;
pub mod strategies;

#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;

pub use candidate::{Candidate, CaseDetail, CaseId, EngineKind, HumanOverride, Operator, StrategyExtra};
pub use client::{
    ClientConfig, ClientError, ErrorKind, ExecutionError, InferenceBackend, InferenceResult, Message,
    RemoteClient, Role, StopFlag, Transport, send_async,
};
pub use config::{Config, ConfigError};
pub use judge::{EvaluationResult, Evaluator, HumanOverrideJudge, LlmJudge, evaluate_bench};
pub use optimizer::{
    Optimizer, OptimizerError, OptimizerStatus, RunEvent, RunHandle, StatusSnapshot, StepContext,
    StepResult, StopHandle, Strategy,
};
pub use session::{Phase, RunConfig, Session, SessionError, TestBench, TrajectoryEntry};
pub use strategies::{
    ContextFilterStrategy, EvolutionaryStrategy, Example, InductionStrategy, IterativeStrategy,
};
