//! Sendout status machine.
//!
//! ```text
//! draft -> pending -> queued -> sending -> sent
//!              ^         |         |
//!              +---------+---------+   (not due / repeating run finished)
//! sending | queued | pending | failed -> paused
//! paused | failed -> pending
//! sending | queued -> failed
//! anything but draft/sent/cancelled -> cancelled
//! ```

use crate::domain::model::Sendout;
use crate::utils::error::{Result, SendoutError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    #[default]
    Draft,
    Pending,
    Queued,
    Sending,
    Sent,
    Paused,
    Cancelled,
    Failed,
}

impl SendStatus {
    pub const ALL: [SendStatus; 8] = [
        SendStatus::Draft,
        SendStatus::Pending,
        SendStatus::Queued,
        SendStatus::Sending,
        SendStatus::Sent,
        SendStatus::Paused,
        SendStatus::Cancelled,
        SendStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Draft => "draft",
            SendStatus::Pending => "pending",
            SendStatus::Queued => "queued",
            SendStatus::Sending => "sending",
            SendStatus::Sent => "sent",
            SendStatus::Paused => "paused",
            SendStatus::Cancelled => "cancelled",
            SendStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SendStatus::Sent | SendStatus::Cancelled)
    }

    pub fn is_editable(&self) -> bool {
        matches!(self, SendStatus::Draft | SendStatus::Paused)
    }

    pub fn is_sendable(&self) -> bool {
        matches!(self, SendStatus::Sending | SendStatus::Queued)
    }

    pub fn is_pausable(&self) -> bool {
        matches!(
            self,
            SendStatus::Sending | SendStatus::Queued | SendStatus::Pending | SendStatus::Failed
        )
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, SendStatus::Paused | SendStatus::Failed)
    }

    pub fn is_cancellable(&self) -> bool {
        !matches!(
            self,
            SendStatus::Draft | SendStatus::Cancelled | SendStatus::Sent
        )
    }

    /// A failed sendout is stalled mid-flight, so it may be deleted even
    /// though it is pausable.
    pub fn is_deletable(&self) -> bool {
        !self.is_pausable() || *self == SendStatus::Failed
    }

    pub fn can_transition_to(&self, to: SendStatus) -> bool {
        use SendStatus::*;

        if to == Cancelled {
            return self.is_cancellable();
        }
        if to == Paused {
            return self.is_pausable();
        }

        matches!(
            (self, to),
            (Draft, Pending)
                | (Pending, Queued)
                | (Queued, Sending)
                | (Queued, Pending)
                | (Sending, Sent)
                | (Sending, Pending)
                | (Sending, Failed)
                | (Queued, Failed)
                | (Paused, Pending)
                | (Failed, Pending)
        )
    }

    pub fn transition(&self, to: SendStatus) -> Result<SendStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(SendoutError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Sendout {
    pub fn transition_to(&mut self, to: SendStatus) -> Result<()> {
        self.send_status = self.send_status.transition(to)?;
        tracing::debug!(sendout = %self.sid, status = %to, "sendout status changed");
        Ok(())
    }
}
