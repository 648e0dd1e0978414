pub mod browser;
pub mod config;
pub mod executor;
pub mod nodes;
pub mod queue;
pub mod recovery;
pub mod selector;
pub mod storage;
pub mod workflow;

pub use browser::{
    BrowserContext, BrowserPool, BrowserPoolConfig, PoolError, PooledContextGuard, ResponseInfo,
    StealthLevel,
};
pub use config::EngineConfig;
pub use executor::{
    Engine, ExecutionSettings, SettingsHandle, SettingsSnapshot, WorkflowExecutor,
};
pub use nodes::{
    ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeRegistry, NodeType,
};
pub use queue::{
    EnqueueOutcome, EnqueueRequest, QueueError, QueueStats, UrlQueue, UrlQueueItem, UrlStatus,
    canonicalize, url_fingerprint,
};
pub use recovery::{
    Action, Condition, RecoveryManager, RecoveryRule, Solution, SolutionProvider,
};
pub use selector::{ExtractionSpec, FieldSpec, SelectorError, Transform, extract_fields};
pub use storage::{
    Database, ExecutionRecord, ExecutionStatus, ExtractedItem, ItemSink, NodeExecutionRecord,
};
pub use workflow::{
    Node, Phase, PhaseKind, RetryPolicy, UrlFilter, Workflow, WorkflowError, WorkflowSource,
};
