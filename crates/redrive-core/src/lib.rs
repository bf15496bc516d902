//! # Workflow Replay Executor
//!
//! The engine that drives a durable, deterministic workflow program through a
//! server-supplied event history: every decision the program made before is
//! reproduced bit-identically, decisions past the replayed suffix are emitted
//! as new commands, and side effects (timers, activities, child workflows,
//! external signals, markers) map onto per-command state machines the
//! orchestration service can audit.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ReplayExecutor                        │
//! │   (per-task pipeline, event dispatch, query handling)       │
//! └─────────────────────────────────────────────────────────────┘
//!        │                  │                     │
//!        ▼                  ▼                     ▼
//! ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐
//! │HistoryIterator│  │CommandBookkeeper│  │ LocalActivityRunner │
//! │ (task batches,│  │ (state machines,│  │ (in-task execution, │
//! │  pagination)  │  │  receipts)      │  │  marker recording)  │
//! └──────────────┘  └────────────────┘  └─────────────────────┘
//! ```
//!
//! One executor instance serves one cached workflow run; a single mutex
//! guards all of its state. The workflow program, the history fetcher and
//! the local activity dispatcher are injected collaborators.
//!
//! ## Example
//!
//! ```ignore
//! use redrive_core::prelude::*;
//!
//! let executor = ReplayExecutor::new(
//!     run_id,
//!     MyProgram::new(),
//!     history_fetcher,
//!     local_activity_dispatcher,
//!     ExecutorConfig::default(),
//! );
//!
//! let result = executor.handle_workflow_task(poll_response).await?;
//! respond_workflow_task_completed(result.commands).await?;
//! ```

pub mod clock;
pub mod command;
pub mod executor;
pub mod history;
pub mod local_activity;
pub mod machines;
pub mod program;
pub mod retry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::ReplayClock;
    pub use crate::command::{Command, TimeoutType, WorkflowFailure};
    pub use crate::executor::{
        ExecutorConfig, ExecutorError, ExecutorMetrics, ReplayExecutor, WorkflowTaskResult,
    };
    pub use crate::history::{
        FetchError, HistoryEvent, HistoryFetcher, HistoryPage, WorkflowTask,
    };
    pub use crate::local_activity::{
        LocalActivityDispatcher, LocalActivityRequest, LocalActivityTask,
    };
    pub use crate::machines::{CommandBookkeeper, CommandId, CommandState, CommandTarget};
    pub use crate::program::{
        ProgramError, QueryResult, Resolution, WorkflowContext, WorkflowErrorPolicy,
        WorkflowProgram, WorkflowQuery,
    };
    pub use crate::retry::{RetryOptions, RetryPolicy};
}

// Re-export key types at crate root
pub use command::{Command, TimeoutType, WorkflowFailure};
pub use executor::{
    ExecutorConfig, ExecutorError, ExecutorMetrics, ReplayExecutor, WorkflowTaskResult,
};
pub use history::{HistoryEvent, HistoryFetcher, WorkflowTask};
pub use local_activity::{LocalActivityDispatcher, LocalActivityRequest};
pub use program::{WorkflowContext, WorkflowProgram};
pub use retry::RetryPolicy;
