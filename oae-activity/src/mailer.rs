//! Mail transport interface
//!
//! The email scheduler composes one message per user per collection and hands
//! it to a [`Mailer`]. Transport and template rendering are external; the
//! pipeline supplies the template reference, the data bag and a deterministic
//! fingerprint the transport uses to suppress accidental duplicates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use crate::error::Result;

/// Who a digest is addressed to: a platform user, or a raw address from an
/// invitation flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecipient {
    /// The user's resource id when the recipient is a platform user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Destination address
    pub email: String,

    /// Tenant the mail is sent on behalf of
    pub tenant_alias: String,
}

/// Reference to an email template owned by an external module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTemplate {
    /// Module owning the template
    pub module: String,

    /// Template id inside the module
    pub id: String,
}

/// One outbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    /// Destination
    pub recipient: EmailRecipient,

    /// Template to render
    pub template: EmailTemplate,

    /// Data bag handed to the renderer
    pub data: Value,

    /// Deterministic hash over the recipient and contributing activities;
    /// the transport drops a message whose fingerprint it has already sent
    pub fingerprint: String,
}

/// External mail transport
#[async_trait]
pub trait Mailer: Send + Sync + fmt::Debug {
    /// Send one message. Failures are logged by the caller and do not block
    /// the rest of the batch.
    async fn send(&self, message: EmailMessage) -> Result<()>;
}

/// Recording mailer for tests; honours fingerprint dedup like a real
/// transport would
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<EmailMessage>>,
    fingerprints: Mutex<HashSet<String>>,
}

impl MemoryMailer {
    /// Create an empty mailer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages accepted so far
    #[must_use]
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("mailer poisoned").clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: EmailMessage) -> Result<()> {
        let fresh = self
            .fingerprints
            .lock()
            .expect("mailer poisoned")
            .insert(message.fingerprint.clone());
        if !fresh {
            tracing::debug!(
                fingerprint = %message.fingerprint,
                "Duplicate email suppressed"
            );
            return Ok(());
        }
        self.sent.lock().expect("mailer poisoned").push(message);
        Ok(())
    }
}
