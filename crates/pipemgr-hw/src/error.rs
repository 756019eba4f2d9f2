//! Driver status codes and error handling.
//!
//! The error taxonomy used by every layer of the entry manager, and the
//! driver status code each error reports to API callers.

use std::fmt;
use thiserror::Error;

/// Status codes of the pipeline driver API.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeStatus {
    Success = 0,
    NotReady = 1,
    NoSysResources = 2,
    InvalidArg = 3,
    AlreadyExists = 4,
    HwCommFail = 5,
    ObjectNotFound = 6,
    NoSpace = 9,
    TryAgain = 10,
    TxnNotSupported = 12,
    TableLocked = 13,
    Unexpected = 15,
    EntryReferencesExist = 16,
    NotSupported = 17,
}

impl fmt::Display for PipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipeStatus::Success => "PIPE_SUCCESS",
            PipeStatus::NotReady => "PIPE_NOT_READY",
            PipeStatus::NoSysResources => "PIPE_NO_SYS_RESOURCES",
            PipeStatus::InvalidArg => "PIPE_INVALID_ARG",
            PipeStatus::AlreadyExists => "PIPE_ALREADY_EXISTS",
            PipeStatus::HwCommFail => "PIPE_COMM_FAIL",
            PipeStatus::ObjectNotFound => "PIPE_OBJ_NOT_FOUND",
            PipeStatus::NoSpace => "PIPE_NO_SPACE",
            PipeStatus::TryAgain => "PIPE_TRY_AGAIN",
            PipeStatus::TxnNotSupported => "PIPE_TXN_NOT_SUPPORTED",
            PipeStatus::TableLocked => "PIPE_TABLE_LOCKED",
            PipeStatus::Unexpected => "PIPE_UNEXPECTED",
            PipeStatus::EntryReferencesExist => "PIPE_ENTRY_REFERENCES_EXIST",
            PipeStatus::NotSupported => "PIPE_NOT_SUPPORTED",
        };
        write!(f, "{}", s)
    }
}

/// Error type for entry-manager operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeError {
    /// A table, instance, stage or entry handle does not exist.
    #[error("Not found: {item}")]
    NotFound { item: String },

    /// An allocator or handle space has no room left.
    #[error("No space: {resource}")]
    Exhausted { resource: String },

    /// A member id or location is already in use.
    #[error("Already exists: {item}")]
    AlreadyExists { item: String },

    /// The entry is still referenced and cannot be deleted.
    #[error("References exist: {item} has {count} reference(s)")]
    ReferencesExist { item: String, count: u32 },

    /// The caller violated a precondition.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An invariant assumed always-true was violated, or hardware and
    /// software state may now disagree.
    #[error("Unexpected error: {message}")]
    Unexpected { message: String },

    /// The instruction transport or encoder reported a failure status.
    #[error("Transport failure ({status}): {context}")]
    Transport { status: PipeStatus, context: String },
}

impl PipeError {
    /// Creates a not found error with an item description.
    pub fn not_found(item: impl Into<String>) -> Self {
        PipeError::NotFound { item: item.into() }
    }

    /// Creates a no space error.
    pub fn exhausted(resource: impl Into<String>) -> Self {
        PipeError::Exhausted {
            resource: resource.into(),
        }
    }

    /// Creates an already exists error.
    pub fn already_exists(item: impl Into<String>) -> Self {
        PipeError::AlreadyExists { item: item.into() }
    }

    /// Creates a references exist error.
    pub fn references_exist(item: impl Into<String>, count: u32) -> Self {
        PipeError::ReferencesExist {
            item: item.into(),
            count,
        }
    }

    /// Creates an invalid argument error with a message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        PipeError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an unexpected error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        PipeError::Unexpected {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(status: PipeStatus, context: impl Into<String>) -> Self {
        PipeError::Transport {
            status,
            context: context.into(),
        }
    }

    /// Returns the driver status this error reports to API callers.
    pub fn status(&self) -> PipeStatus {
        match self {
            PipeError::NotFound { .. } => PipeStatus::ObjectNotFound,
            PipeError::Exhausted { .. } => PipeStatus::NoSpace,
            PipeError::AlreadyExists { .. } => PipeStatus::AlreadyExists,
            PipeError::ReferencesExist { .. } => PipeStatus::EntryReferencesExist,
            PipeError::InvalidArgument { .. } => PipeStatus::InvalidArg,
            PipeError::Unexpected { .. } => PipeStatus::Unexpected,
            PipeError::Transport { status, .. } => *status,
        }
    }

    /// Returns true if the caller may continue using the table after this
    /// error. Invalid arguments are caller bugs, and unexpected or transport
    /// errors leave hardware and software state in doubt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipeError::NotFound { .. }
                | PipeError::Exhausted { .. }
                | PipeError::AlreadyExists { .. }
                | PipeError::ReferencesExist { .. }
        )
    }
}

/// Result type for entry-manager operations.
pub type PipeResult<T> = Result<T, PipeError>;
