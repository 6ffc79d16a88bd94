use thiserror::Error;

use crate::task::TaskId;

/// Errors raised by [`Manager`](crate::manager::Manager) operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("label `{0}` is already registered")]
    DuplicateLabel(String),

    #[error("no task registered under id {0}")]
    UnknownTask(TaskId),

    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("task evaluation failed: {0}")]
    EvaluationError(#[from] anyhow::Error),

    #[error("missing key while evaluating reference")]
    MissingKey,

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Errors raised by a [`Container`](crate::container::Container) implementation.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("attribute `{0}` not found")]
    NoSuchAttribute(String),

    #[error("item key not found")]
    NoSuchItem,

    #[error("container does not support item access")]
    NotIndexable,

    #[error("container does not support attribute access")]
    NotAttributable,
}
