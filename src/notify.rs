//! Notification entry points
//!
//! Called by the mail and admin request paths after their database writes
//! commit. Each call resolves the little display data it needs from the
//! [`MailDirectory`], builds an [`Event`], and hands it to the hub without
//! waiting on delivery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::hub::HubHandle;
use crate::message::{
    Event, EventBody, NewMailNotice, NoticeLevel, ReadReceiptNotice, SystemNoticePayload,
};
use crate::types::UserId;

/// Name shown when the sender cannot be resolved
pub const UNKNOWN_SENDER: &str = "Unknown user";

/// Sender shown on system notices
pub const SYSTEM_SENDER: &str = "System Administrator";

/// Characters kept in a body preview
const PREVIEW_CHARS: usize = 100;

/// Account lookups the notifier needs from the persistence layer
#[async_trait]
pub trait MailDirectory: Send + Sync {
    /// Display name for a user, if the user exists
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, DirectoryError>;

    /// Whether a user should receive mail notifications at all
    async fn wants_notifications(&self, _user_id: UserId) -> Result<bool, DirectoryError> {
        Ok(true)
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Directory backed by in-process maps
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    names: RwLock<HashMap<UserId, String>>,
    muted: RwLock<HashSet<UserId>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: UserId, name: impl Into<String>) {
        self.names.write().await.insert(user_id, name.into());
    }

    /// Stop or resume mail notifications for a user
    pub async fn set_muted(&self, user_id: UserId, muted: bool) {
        let mut set = self.muted.write().await;
        if muted {
            set.insert(user_id);
        } else {
            set.remove(&user_id);
        }
    }
}

#[async_trait]
impl MailDirectory for InMemoryDirectory {
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, DirectoryError> {
        Ok(self.names.read().await.get(&user_id).cloned())
    }

    async fn wants_notifications(&self, user_id: UserId) -> Result<bool, DirectoryError> {
        Ok(!self.muted.read().await.contains(&user_id))
    }
}

/// What the mail path knows about a freshly delivered message
#[derive(Debug, Clone)]
pub struct MailSummary {
    pub email_id: i64,
    pub sender_id: UserId,
    pub sender_email: String,
    pub subject: String,
    /// Full body, HTML allowed; only a preview is sent
    pub body: String,
    pub has_attachment: bool,
    pub created_at: DateTime<Utc>,
}

/// Administrator notice
#[derive(Debug, Clone)]
pub struct SystemNotice {
    pub title: String,
    pub message: String,
    pub level: NoticeLevel,
}

/// Who receives a system notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    Users(Vec<UserId>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Notice title and message must not be empty")]
    EmptyNotice,
    #[error("No recipients specified")]
    NoRecipients,
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Front door for request handlers
#[derive(Clone)]
pub struct Notifier {
    hub: HubHandle,
    directory: Arc<dyn MailDirectory>,
}

impl Notifier {
    pub fn new(hub: HubHandle, directory: Arc<dyn MailDirectory>) -> Self {
        Self { hub, directory }
    }

    /// Tell every connection of `recipient` about a new message
    ///
    /// Directory failures degrade to defaults; they never stop the
    /// notification.
    pub async fn notify_new_mail(
        &self,
        recipient: UserId,
        summary: MailSummary,
    ) -> Result<(), NotifyError> {
        match self.directory.wants_notifications(recipient).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("User {} has notifications off, skipping email {}", recipient, summary.email_id);
                return Ok(());
            }
            Err(e) => warn!("Notification preference lookup for {} failed: {}", recipient, e),
        }

        let sender_name = match self.directory.display_name(summary.sender_id).await {
            Ok(Some(name)) => name,
            Ok(None) => UNKNOWN_SENDER.to_string(),
            Err(e) => {
                warn!("Sender lookup for {} failed: {}", summary.sender_id, e);
                UNKNOWN_SENDER.to_string()
            }
        };

        let email_id = summary.email_id;
        let event = Event::new(EventBody::NewMail(NewMailNotice {
            email_id,
            sender_id: summary.sender_id,
            sender_name,
            sender_email: summary.sender_email,
            subject: summary.subject,
            preview: body_preview(&summary.body),
            has_attachment: summary.has_attachment,
            created_at: summary.created_at,
        }));

        self.hub.send_to_user(recipient, event)?;
        debug!("New mail notification queued: email {} for user {}", email_id, recipient);
        Ok(())
    }

    /// Tell the sender of `email_id` that `reader` opened it
    ///
    /// Reading your own message is not a receipt.
    pub async fn notify_read(
        &self,
        sender: UserId,
        reader: UserId,
        email_id: i64,
        read_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        if sender == reader {
            return Ok(());
        }

        let event = Event::new(EventBody::ReadReceipt(ReadReceiptNotice {
            email_id,
            reader_id: reader,
            read_at,
        }));
        self.hub.send_to_user(sender, event)?;
        Ok(())
    }

    /// Deliver an administrator notice
    ///
    /// Unreachable targets are pruned by the hub and do not fail the call.
    pub async fn send_system_notice(
        &self,
        notice: SystemNotice,
        audience: Audience,
    ) -> Result<(), NotifyError> {
        if notice.title.trim().is_empty() || notice.message.trim().is_empty() {
            return Err(NotifyError::EmptyNotice);
        }
        if matches!(&audience, Audience::Users(ids) if ids.is_empty()) {
            return Err(NotifyError::NoRecipients);
        }

        let event = Event::new(EventBody::SystemNotice(SystemNoticePayload {
            title: notice.title,
            message: notice.message,
            level: notice.level,
            from: SYSTEM_SENDER.to_string(),
        }));

        match audience {
            Audience::All => {
                self.hub.broadcast(event)?;
                info!("System notice sent to all users");
            }
            Audience::Users(ids) => {
                let count = ids.len();
                self.hub.send_to_users(ids, event)?;
                info!("System notice sent to {} listed users", count);
            }
        }
        Ok(())
    }
}

/// Plain-text preview of a message body
///
/// Drops anything between `<` and `>`, then keeps the first 100
/// characters, marking truncation with `...`.
pub fn body_preview(body: &str) -> String {
    let mut plain = String::with_capacity(body.len());
    let mut in_tag = false;
    for c in body.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => plain.push(c),
            _ => {}
        }
    }

    if plain.chars().count() > PREVIEW_CHARS {
        let mut preview: String = plain.chars().take(PREVIEW_CHARS).collect();
        preview.push_str("...");
        preview
    } else {
        plain
    }
}
