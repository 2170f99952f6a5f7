use thiserror::Error;

/// Failures raised by the engine's collaborators (stores, queue, executor, notifier).
///
/// Every one of these is treated as transient by the step engine: the job is retried
/// until `max_retries` is reached.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("marker store: {0}")]
    MarkerStore(String),

    #[error("checklist store: {0}")]
    ChecklistStore(String),

    #[error("result store: {0}")]
    ResultStore(String),

    #[error("module catalog: {0}")]
    Catalog(String),

    #[error("module executor: {0}")]
    Executor(String),

    #[error("queue: {0}")]
    Queue(String),

    #[error("notification: {0}")]
    Notification(String),

    #[error("settings unavailable: {0}")]
    Settings(String),

    #[error("checklist not found: {0}")]
    ChecklistNotFound(String),

    #[error("malformed job: {0}")]
    MalformedJob(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Short type label used as the `<error-type>` part of a job's failure reason.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::MarkerStore(_) => "MarkerStoreError",
            EngineError::ChecklistStore(_) => "ChecklistStoreError",
            EngineError::ResultStore(_) => "ResultStoreError",
            EngineError::Catalog(_) => "CatalogError",
            EngineError::Executor(_) => "ExecutorError",
            EngineError::Queue(_) => "QueueError",
            EngineError::Notification(_) => "NotificationError",
            EngineError::Settings(_) => "SettingsError",
            EngineError::ChecklistNotFound(_) => "ChecklistNotFound",
            EngineError::MalformedJob(_) => "MalformedJob",
            EngineError::Http(_) => "HttpError",
            EngineError::Io(_) => "IoError",
            EngineError::Json(_) => "JsonError",
        }
    }
}

/// Why a single step failed. Drives the retry-versus-escalate decision.
#[derive(Debug, Error)]
pub enum StepError {
    /// No progress for longer than `task_timeout`.
    #[error("no progress for {idle}s, task timeout is {limit}s")]
    Stall { idle: i64, limit: i64 },

    /// A fan-in or grace phase ran past `wait_timeout`.
    #[error("waited {waited}s, wait timeout is {limit}s")]
    WaitBudget { waited: i64, limit: i64 },

    /// One or more children reported a timeout through their marker.
    #[error("child modules timed out: {}", .0.join(", "))]
    ChildTimeout(Vec<String>),

    #[error(transparent)]
    Transient(#[from] EngineError),
}

impl StepError {
    /// Only collaborator failures are retried; timeouts escalate immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Stall { .. } => "StallError",
            StepError::WaitBudget { .. } => "WaitBudgetError",
            StepError::ChildTimeout(_) => "ChildTimeoutError",
            StepError::Transient(inner) => inner.kind(),
        }
    }

    /// Formats the failure as `"<error-type> - <message>"`.
    pub fn reason(&self) -> String {
        format!("{} - {}", self.kind(), self)
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
