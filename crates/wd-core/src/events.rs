//! Structured progress events emitted by the orchestrator.

use wd_workspace::Stage;

/// One observable step of a workspace operation.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StageStarted { stage: Stage },
    StageCompleted { stage: Stage },
    Message { text: String },
}

/// Consumer of progress events; the CLI renders them, tests record them.
pub type ProgressSink = Box<dyn Fn(ProgressEvent) + Send + Sync>;
