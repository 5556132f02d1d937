//! Tipos compartidos entre coordinador, workers y CLI.

pub mod error;
pub mod progress;
pub mod protocol;
pub mod task;
pub mod tool;
pub mod upscale;

pub use error::{CancelReason, TaskError};
pub use progress::{Progress, ProgressTracker, ProgressUpdate};
pub use protocol::{LeaseId, TaskAssignment};
pub use task::{Lane, TaskId, TaskKind, TaskPayload, TaskRecord, TaskStatus, UpscaleProfile};
pub use tool::ExternalTool;
pub use upscale::{CommandUpscaler, Upscaler};
