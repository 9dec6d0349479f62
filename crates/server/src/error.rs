// Request failures and their wire reasons.
//
// Every typed error raised below the pipeline converts into a
// `RequestFailure` here; its `Display` output is the `reason` sent to the
// client. Infrastructure failures are logged and collapsed into a generic
// reason so storage details never leave the server.

use bittle_common::protocol::RequestStatus;
use thiserror::Error;
use tracing::error;

use crate::access::AccessError;
use crate::auth::AuthError;
use crate::model::ModelError;
use crate::repo::RepoError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("Request ID is not valid or is not allowed before logging in.")]
    NotAllowedBeforeLogin,

    #[error("Bad ID.")]
    BadId,

    #[error("Missing parameter {0}.")]
    MissingParameter(&'static str),

    #[error("Mistyped parameter {name}. Should be type {expected}.")]
    MistypedParameter { name: &'static str, expected: &'static str },

    #[error("Not enough permission.")]
    InsufficientPermission,

    /// A domain rule rejected the request; the string is the wire reason.
    #[error("{0}")]
    Rejected(String),

    #[error("Request timed out.")]
    TimedOut,

    #[error("Uncaught server error.")]
    Internal,

    #[error("Server syntax error.")]
    Panicked,
}

impl RequestFailure {
    /// Unknown operations close rather than fail.
    pub const fn status(&self) -> RequestStatus {
        match self {
            Self::BadId => RequestStatus::Closed,
            _ => RequestStatus::Failed,
        }
    }

    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<AccessError> for RequestFailure {
    fn from(value: AccessError) -> Self {
        match value {
            AccessError::InsufficientPermission => Self::InsufficientPermission,
            other => Self::Rejected(other.to_string()),
        }
    }
}

impl From<RepoError> for RequestFailure {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Storage(store_error) => {
                error!(error = ?store_error, "repository storage failure");
                Self::Internal
            }
            RepoError::Model(ModelError::BrokenChain(detail)) => {
                error!(detail = %detail, "stored line chain is inconsistent");
                Self::Internal
            }
            RepoError::Access(access_error) => access_error.into(),
            other => Self::Rejected(other.to_string()),
        }
    }
}

impl From<AuthError> for RequestFailure {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::Storage(store_error) => {
                error!(error = ?store_error, "account storage failure");
                Self::Internal
            }
            AuthError::Hashing(detail) => {
                error!(detail = %detail, "password hashing failure");
                Self::Internal
            }
            AuthError::Mail(mail_error) => {
                error!(error = ?mail_error, "password reset delivery failure");
                Self::Internal
            }
            other => Self::Rejected(other.to_string()),
        }
    }
}
