// DevOS Orchestrator Library - Autonomous Pipeline Orchestration
// This exposes the core components for testing and integration

pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod executors;
pub mod github;
pub mod gitops;
pub mod handoff;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod scrub;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{config, init_config, OrchestratorConfig};
pub use deploy::{
    DeployPlatform, DeploymentStatus, FailureType, IncidentReport, MonitorStatus, PlatformKind,
    Severity, SmokeTestResults,
};
pub use error::OrchestratorError;
pub use events::{Event, EventBus, PipelineStateChanged, ProgressEvent, SessionEvent};
pub use executors::{
    AgentArtifacts, AgentExecutor, AgentResult, DevArtifacts, DevExecutor, DevOpsArtifacts,
    DevOpsExecutor, ExecutorDeps, FailureKind, PlannerArtifacts, PlannerExecutor, QaArtifacts,
    QaExecutor, QaReport, TestResults, Verdict,
};
pub use github::{GitHubGateway, GitHubOps, MergeStrategy, PrInfo};
pub use gitops::{GitGateway, GitError};
pub use handoff::{HandoffCoordinator, HandoffDecision, HandoffRecord, HandoffStatus};
pub use orchestrator::{Dispatcher, Orchestrator};
pub use pipeline::{
    transition_allowed, PipelineContext, PipelineState, PipelineStateHistory,
    PipelineStateMachine, ResumeAction,
};
pub use queue::{Job, JobQueue, JobStatus, JobType, NewJob, QueueStats};
pub use scrub::scrub;
pub use server::{ApiContext, MembershipVerifier, StaticTokenVerifier};
pub use store::{EphemeralStore, FileHandoffStore, FileJobStore, FilePipelineStore};
pub use supervisor::{
    AgentType, CliSession, ProcessSupervisor, SessionExit, SessionHealthMonitor, SessionStatus,
    SpawnParams,
};
pub use telemetry::{
    create_pipeline_span, generate_correlation_id, init_telemetry, shutdown_telemetry,
};
