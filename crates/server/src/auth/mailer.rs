use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

/// Outbound delivery of password reset notices.
pub trait Mailer: Send + Sync {
    fn send_password_reset(&self, email: &str, name: &str, temporary_pass: &str) -> Result<(), MailError>;
}

/// Used when no mail transport is configured. Every delivery fails, so a
/// reset never replaces a password the user cannot receive.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledMailer;

impl Mailer for DisabledMailer {
    fn send_password_reset(&self, email: &str, name: &str, _temporary_pass: &str) -> Result<(), MailError> {
        warn!(user = %name, email = %email, "password reset refused: no mail transport configured");
        Err(MailError("no mail transport configured".to_owned()))
    }
}
