use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct MailError(pub String);

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Outbound mail sink. Delivery is fire-and-forget from the core's point
/// of view; an `Err` only signals that the hand-off itself failed, which
/// the sweep worker counts as a dispatch failure.
pub trait Mailer: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), MailError>;
}

/// Default sink: logs the descriptor and reports success. Deliverability
/// is out of scope for the lifecycle engine.
pub struct ConsoleMailer;

impl Mailer for ConsoleMailer {
    fn send(&self, message: &OutboundMessage) -> Result<(), MailError> {
        log::info!("Mail to {}: {}", message.to, message.subject);
        log::debug!("{}", message.text);

        Ok(())
    }
}
