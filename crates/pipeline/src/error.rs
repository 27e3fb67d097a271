use imagegen_comfyui::compute::ComputeError;
use imagegen_comfyui::task::TaskError;

/// Terminal failures of a generation job.
///
/// A job that ran but produced nothing is not an error; see
/// [`JobOutcome::NoOutput`](crate::job::JobOutcome::NoOutput).
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job or the client configuration is unusable. Raised before any
    /// network call.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The engine refused the submission.
    #[error("Submission rejected: {message}")]
    SubmissionRejected {
        message: String,
        diagnostic: serde_json::Value,
    },

    /// A node failed while the engine executed the job.
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        message: String,
        diagnostic: serde_json::Value,
    },

    /// Downloading, embedding, naming or persisting an output failed.
    /// `index` is the output's position; the grid uses the output count.
    #[error("Failed to process output {index}: {reason}")]
    OutputProcessingFailed { index: usize, reason: String },

    #[error("Job canceled")]
    Canceled,

    /// Network or protocol failure without a structured diagnostic.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<ComputeError> for JobError {
    fn from(e: ComputeError) -> Self {
        match e {
            ComputeError::Rejected {
                message,
                diagnostic,
            } => Self::SubmissionRejected {
                message,
                diagnostic,
            },
            ComputeError::Transport(msg) => Self::Transport(msg),
            ComputeError::NotFound(what) => Self::Transport(format!("not found: {what}")),
        }
    }
}

impl From<TaskError> for JobError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Execution {
                message,
                diagnostic,
            } => Self::ExecutionFailed {
                message,
                diagnostic,
            },
            // Interrupted by someone other than this job's cancellation.
            TaskError::Interrupted => Self::Canceled,
            TaskError::Abandoned => {
                Self::Transport("connection to the compute engine was lost".into())
            }
        }
    }
}
