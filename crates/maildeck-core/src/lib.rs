//! Local mail store: accounts, folders, messages, labels and the change feed.

use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod accounts;
pub mod contracts;
pub mod folders;
pub mod messages;

pub use accounts::{AccountStore, NewExternalAccount, UpdateAccount};
pub use contracts::{
    BlobStore, MailTransport, OutboundAttachment, SendMailRequest, TransportReply,
};
pub use folders::FolderStore;
pub use messages::{
    MessagePage, MessageStore, MessageWithMeta, NewAttachment, NewMessage, SearchFilters,
};

pub const CHANGE_FEED_CAPACITY: usize = 256;
pub const SNIPPET_MAX_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T, E = MailError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapParams {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpParams {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

/// Internal accounts are platform mailboxes addressed by their owner
/// identity; external accounts carry the full IMAP/SMTP endpoints plus an
/// opaque credential reference handed back by the transport service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    Internal,
    External {
        imap: ImapParams,
        smtp: SmtpParams,
        credential_ref: String,
    },
}

impl AccountKind {
    pub fn type_str(&self) -> &'static str {
        match self {
            AccountKind::Internal => "internal",
            AccountKind::External { .. } => "external",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub owner_identity: String,
    pub kind: AccountKind,
    pub external_address: Option<String>,
    pub signature_html: Option<String>,
    pub is_default: bool,
    pub is_system_default: bool,
    pub sync_enabled: bool,
    pub last_sync_at: Option<i64>,
}

impl Account {
    /// The address this account sends from.
    pub fn address(&self) -> &str {
        match &self.kind {
            AccountKind::Internal => &self.owner_identity,
            AccountKind::External { .. } => {
                self.external_address.as_deref().unwrap_or(&self.owner_identity)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Custom,
}

impl FolderKind {
    pub const SYSTEM: [FolderKind; 6] = [
        FolderKind::Inbox,
        FolderKind::Sent,
        FolderKind::Drafts,
        FolderKind::Trash,
        FolderKind::Spam,
        FolderKind::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FolderKind::Inbox => "inbox",
            FolderKind::Sent => "sent",
            FolderKind::Drafts => "drafts",
            FolderKind::Trash => "trash",
            FolderKind::Spam => "spam",
            FolderKind::Archive => "archive",
            FolderKind::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> FolderKind {
        match value {
            "inbox" => FolderKind::Inbox,
            "sent" => FolderKind::Sent,
            "drafts" => FolderKind::Drafts,
            "trash" => FolderKind::Trash,
            "spam" => FolderKind::Spam,
            "archive" => FolderKind::Archive,
            _ => FolderKind::Custom,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            FolderKind::Inbox => "Inbox",
            FolderKind::Sent => "Sent",
            FolderKind::Drafts => "Drafts",
            FolderKind::Trash => "Trash",
            FolderKind::Spam => "Spam",
            FolderKind::Archive => "Archive",
            FolderKind::Custom => "Custom",
        }
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, FolderKind::Custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub kind: FolderKind,
    pub parent_id: Option<i64>,
    pub position: i64,
    pub color: Option<String>,
    pub unread_count: i64,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub account_id: i64,
    pub folder_id: i64,
    pub message_key: Option<String>,
    pub thread_key: Option<String>,
    pub in_reply_to: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub snippet: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
    pub received_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: i64,
    pub message_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub file_size: i64,
    pub storage_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Message,
    Folder,
}

/// Change feed events carry only locators. Listeners must re-read the store
/// rather than patch local state from the event; delivery is at-least-once
/// and unordered across record ids.
#[derive(Debug, Clone, Copy)]
pub struct ChangeEvent {
    pub account_id: i64,
    pub entity: EntityKind,
    pub kind: ChangeKind,
    pub record_id: i64,
    pub folder_id: Option<i64>,
}

#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No listeners is fine; the stores publish unconditionally.
        let _ = self.tx.send(event);
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct MailDb {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl MailDb {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.trim_start_matches("sqlite:"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            feed: ChangeFeed::new(),
        })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// First non-empty line of the plain-text body, capped for list display.
pub fn snippet_from_text(body: &str) -> String {
    let first = body
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");
    first.trim().chars().take(SNIPPET_MAX_CHARS).collect()
}

pub(crate) fn encode_addresses(addresses: &[String]) -> String {
    serde_json::to_string(addresses).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn decode_addresses(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn placeholders(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(", ")
}
