use std::fmt;

use tessera_common::error::CommonError;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("user task exception: {0}")]
    UserTaskException(ReturnedException),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidArgument(message.into())
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        CoreError::OutOfRange(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::InternalError(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        CoreError::NotSupported(message.into())
    }
}

impl From<CommonError> for CoreError {
    fn from(error: CommonError) -> Self {
        match error {
            CommonError::InvalidArgument(x) => CoreError::InvalidArgument(x),
            CommonError::InternalError(x) => CoreError::InternalError(x),
        }
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(error: tokio::task::JoinError) -> Self {
        CoreError::InternalError(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Raised by a task body written in Rust.
    Native,
    /// Raised by a task body from a language binding; the payload is opaque to the core.
    Foreign,
}

/// An exception raised by a point task, packaged for delivery to the submitting thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedException {
    pub kind: ExceptionKind,
    pub index: i32,
    pub message: String,
    pub payload: Vec<u8>,
}

impl fmt::Display for ReturnedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception {} raised by task: {}", self.index, self.message)
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

/// The error type returned by task bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub kind: ExceptionKind,
    pub index: i32,
    pub message: String,
    pub payload: Vec<u8>,
}

impl TaskError {
    pub fn new(index: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ExceptionKind::Native,
            index,
            message: message.into(),
            payload: vec![],
        }
    }

    pub fn foreign(index: i32, message: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: ExceptionKind::Foreign,
            index,
            message: message.into(),
            payload,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<CoreError> for TaskError {
    fn from(error: CoreError) -> Self {
        TaskError::new(0, error.to_string())
    }
}

impl From<TaskError> for ReturnedException {
    fn from(error: TaskError) -> Self {
        ReturnedException {
            kind: error.kind,
            index: error.index,
            message: error.message,
            payload: error.payload,
        }
    }
}
