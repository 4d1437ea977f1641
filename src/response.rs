//! Wire-level response types for request handlers.
//!
//! Mirrors the status vocabulary the client CLI understands. Handlers never
//! return [`crate::error::Error`] to the transport directly; they convert
//! through [`Response::from_error`] so the status-code mapping lives in one
//! place.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::start::supervisor::{ExitInfo, ExitKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    InvalidArgument,
    AlreadyExists,
    FailedPrecondition,
    Internal,
}

/// Per-instance slice of a successful start response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub instance_id: u32,
}

/// The new group's identity, attached to a successful start response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_name: String,
    pub home_directories: Vec<String>,
    pub instances: Vec<InstanceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub group_info: Option<GroupInfo>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            message: String::new(),
            group_info: None,
        }
    }

    pub fn with_status(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            group_info: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let status = match err {
            Error::Invalid(_) => Status::InvalidArgument,
            Error::Conflict(_) => Status::AlreadyExists,
            Error::Precondition(_) => Status::FailedPrecondition,
            Error::Io(_) | Error::ChildFailed(_) | Error::Internal(_) => Status::Internal,
        };
        Self::with_status(status, err.to_string())
    }

    /// Derive a response from the launcher child's exit information.
    pub fn from_exit(exit: ExitInfo) -> Self {
        if exit.success() {
            return Self::ok();
        }
        let message = match exit.kind {
            ExitKind::Exited => format!("launcher exited with code {}", exit.code),
            ExitKind::Signalled => format!("launcher terminated by signal {}", exit.code),
        };
        Self::with_status(Status::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        let conflict = Error::conflict("taken");
        assert_eq!(Response::from_error(&conflict).status, Status::AlreadyExists);

        let invalid = Error::invalid("bad name");
        assert_eq!(
            Response::from_error(&invalid).status,
            Status::InvalidArgument
        );

        let precondition = Error::Precondition("missing env".into());
        assert_eq!(
            Response::from_error(&precondition).status,
            Status::FailedPrecondition
        );
    }

    #[test]
    fn exit_zero_is_ok() {
        let exit = ExitInfo {
            kind: ExitKind::Exited,
            code: 0,
        };
        let response = Response::from_exit(exit);
        assert_eq!(response.status, Status::Ok);
    }

    #[test]
    fn exit_nonzero_surfaces_child_code() {
        let exit = ExitInfo {
            kind: ExitKind::Exited,
            code: 9,
        };
        let response = Response::from_exit(exit);
        assert_eq!(response.status, Status::Internal);
        assert!(response.message.contains('9'));
    }
}
