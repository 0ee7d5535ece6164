//! Outbound invite email, behind a trait so delivery can be swapped out.
//!
//! Delivery failure never fails invite creation: the authority reports it
//! back as `email_sent: false` together with the link for manual sharing.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MailError {
    #[error("Email configuration error")]
    NotConfigured,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Everything an invite email needs.
#[derive(Debug, Clone)]
pub struct InviteEmail<'a> {
    pub to: &'a str,
    pub invite_link: &'a str,
    pub room_name: &'a str,
    pub inviter_name: &'a str,
}

impl InviteEmail<'_> {
    pub fn subject(&self) -> String {
        format!("You're invited to join \"{}\"", self.room_name)
    }

    pub fn body(&self) -> String {
        format!(
            "{} invited you to collaborate in \"{}\".\n\nJoin here: {}\n\nThis link expires in 24 hours.",
            self.inviter_name, self.room_name, self.invite_link
        )
    }
}

pub trait InviteMailer: Send + Sync {
    fn send_invite(&self, email: &InviteEmail<'_>) -> Result<(), MailError>;
}

/// Default mailer: no transport configured, every send fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredMailer;

impl InviteMailer for UnconfiguredMailer {
    fn send_invite(&self, email: &InviteEmail<'_>) -> Result<(), MailError> {
        log::debug!("No mail transport configured, not sending invite to {}", email.to);
        Err(MailError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_mailer_fails() {
        let email = InviteEmail {
            to: "bob@example.com",
            invite_link: "http://localhost:5173/join/abc",
            room_name: "Demo",
            inviter_name: "Alice",
        };
        assert_eq!(UnconfiguredMailer.send_invite(&email), Err(MailError::NotConfigured));
        assert!(email.subject().contains("Demo"));
        assert!(email.body().contains("http://localhost:5173/join/abc"));
    }
}
