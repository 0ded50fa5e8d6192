//! Contracts for the external collaborators: the mail transport service
//! (SMTP/IMAP wire mechanics, credential encryption at rest) and the blob
//! store. Both are opaque request/response seams; real implementations live
//! in maildeck-mail, tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Account, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportReply {
    pub success: bool,
    pub message: String,
}

impl TransportReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundAttachment {
    pub id: i64,
    pub filename: String,
    pub mime_type: String,
    pub storage_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMailRequest {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub in_reply_to: Option<String>,
    pub thread_key: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Encrypts a plaintext credential and returns the opaque reference that
    /// is the only thing ever persisted locally.
    async fn encrypt_credential(&self, plaintext: &str) -> Result<String>;

    /// Inverse of `encrypt_credential`, needed when the sync engine opens an
    /// IMAP session on the account's behalf.
    async fn decrypt_credential(&self, opaque: &str) -> Result<String>;

    async fn test_connection(&self, account: &Account) -> Result<TransportReply>;

    /// Delivers over the wire on the account's behalf. External accounts use
    /// their own SMTP endpoint, internal accounts the platform relay.
    async fn send_mail(&self, account: &Account, request: &SendMailRequest)
    -> Result<TransportReply>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<String>;

    async fn public_url(&self, storage_ref: &str) -> Result<String>;

    async fn remove(&self, storage_ref: &str) -> Result<()>;

    async fn download(&self, storage_ref: &str) -> Result<Vec<u8>>;
}
