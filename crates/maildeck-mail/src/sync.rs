//! One-way inbox sync: pull recent remote messages into the local store.
//! Additive only; local deletes, moves and flag changes are never pushed
//! back, and remote deletions never remove local rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use maildeck_core::{
    AccountKind, AccountStore, BlobStore, FolderKind, FolderStore, MailError, MailTransport,
    MessageStore, NewAttachment, NewMessage, Result, now_ts,
};

use crate::source::{ImapSource, RemoteMessage};

pub const INITIAL_SYNC_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Connecting,
    Fetching,
    Reconciling,
}

/// Outcome of one sync pass. Connection and fetch failures are reported
/// here rather than as errors; the account's `last_sync_at` only moves on a
/// successful pass.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub account_id: i64,
    pub success: bool,
    pub fetched: usize,
    pub saved: usize,
    pub message: String,
}

impl SyncReport {
    fn failed(account_id: i64, message: impl Into<String>) -> Self {
        Self {
            account_id,
            success: false,
            fetched: 0,
            saved: 0,
            message: message.into(),
        }
    }
}

pub struct SyncEngine {
    accounts: AccountStore,
    folders: FolderStore,
    messages: MessageStore,
    transport: Arc<dyn MailTransport>,
    source: Arc<dyn ImapSource>,
    blobs: Arc<dyn BlobStore>,
    phases: Arc<Mutex<HashMap<i64, SyncPhase>>>,
}

impl SyncEngine {
    pub fn new(
        accounts: AccountStore,
        folders: FolderStore,
        messages: MessageStore,
        transport: Arc<dyn MailTransport>,
        source: Arc<dyn ImapSource>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            accounts,
            folders,
            messages,
            transport,
            source,
            blobs,
            phases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn phase(&self, account_id: i64) -> SyncPhase {
        self.phases
            .lock()
            .ok()
            .and_then(|phases| phases.get(&account_id).copied())
            .unwrap_or(SyncPhase::Idle)
    }

    /// One sync pass for one account. At most one pass per account runs at a
    /// time; a second caller gets a `Conflict` instead of queueing.
    pub async fn sync_account(&self, account_id: i64) -> Result<SyncReport> {
        let account = self.accounts.get_account(account_id).await?;
        let (endpoint, credential_ref) = match &account.kind {
            AccountKind::External {
                imap,
                credential_ref,
                ..
            } => (imap.clone(), credential_ref.clone()),
            AccountKind::Internal => {
                return Err(MailError::Validation(
                    "internal accounts have no remote mailbox to sync".to_string(),
                ));
            }
        };
        if !account.sync_enabled {
            return Ok(SyncReport::failed(account_id, "sync is disabled"));
        }

        let guard = self.claim(account_id)?;

        let password = match self.transport.decrypt_credential(&credential_ref).await {
            Ok(password) => password,
            Err(err) => {
                warn!(account_id, error = %err, "credential resolution failed");
                return Ok(SyncReport::failed(account_id, err.to_string()));
            }
        };
        guard.set(SyncPhase::Fetching);
        let remote = match self
            .source
            .fetch_recent(&endpoint, account.address(), &password, INITIAL_SYNC_DAYS)
            .await
        {
            Ok(remote) => remote,
            Err(err) => {
                warn!(account_id, error = %err, "inbox fetch failed");
                return Ok(SyncReport::failed(account_id, err.to_string()));
            }
        };

        guard.set(SyncPhase::Reconciling);
        let fetched = remote.len();
        let saved = self.reconcile(account_id, remote).await?;

        self.folders.recalculate_counts(account_id).await?;
        self.accounts.touch_last_sync(account_id, now_ts()).await?;
        info!(account_id, fetched, saved, "sync pass complete");
        Ok(SyncReport {
            account_id,
            success: true,
            fetched,
            saved,
            message: format!("saved {saved} of {fetched} fetched messages"),
        })
    }

    /// Inserts remote messages that are not already present. The partial
    /// unique index on `(account_id, message_key)` backs the same guarantee
    /// at the schema level.
    async fn reconcile(&self, account_id: i64, remote: Vec<RemoteMessage>) -> Result<usize> {
        let inbox = self
            .folders
            .folder_by_kind(account_id, FolderKind::Inbox)
            .await?;
        let mut saved = 0;
        for message in remote {
            if self
                .messages
                .find_by_message_key(account_id, &message.message_key)
                .await?
                .is_some()
            {
                continue;
            }
            let mut attachments = Vec::with_capacity(message.attachments.len());
            let mut upload_failed = false;
            for attachment in &message.attachments {
                let path = format!(
                    "mail/{account_id}/{}/{}",
                    message.message_key, attachment.filename
                );
                match self.blobs.upload(&path, &attachment.data).await {
                    Ok(storage_ref) => attachments.push(NewAttachment {
                        filename: attachment.filename.clone(),
                        mime_type: attachment.mime_type.clone(),
                        file_size: attachment.data.len() as i64,
                        storage_ref,
                    }),
                    Err(err) => {
                        warn!(
                            key = %message.message_key,
                            filename = %attachment.filename,
                            error = %err,
                            "attachment upload failed, skipping message"
                        );
                        upload_failed = true;
                        break;
                    }
                }
            }
            // Attachment rows are only written for uploaded blobs; a message
            // that cannot be stored whole is left for the next pass.
            if upload_failed {
                continue;
            }
            self.messages
                .insert_message(NewMessage {
                    account_id,
                    folder_id: inbox.id,
                    message_key: Some(message.message_key),
                    thread_key: None,
                    in_reply_to: None,
                    from_address: message.from_address,
                    from_name: message.from_name,
                    to_addresses: message.to_addresses,
                    cc_addresses: message.cc_addresses,
                    bcc_addresses: Vec::new(),
                    subject: message.subject,
                    body_html: message.body_html,
                    body_text: message.body_text,
                    is_read: message.is_read,
                    is_draft: false,
                    received_at: message.received_at,
                    attachments,
                })
                .await?;
            saved += 1;
        }
        Ok(saved)
    }

    fn claim(&self, account_id: i64) -> Result<PhaseGuard> {
        let mut phases = self
            .phases
            .lock()
            .map_err(|_| MailError::Conflict("sync state poisoned".to_string()))?;
        if phases.contains_key(&account_id) {
            return Err(MailError::Conflict(format!(
                "a sync for account {account_id} is already running"
            )));
        }
        phases.insert(account_id, SyncPhase::Connecting);
        Ok(PhaseGuard {
            phases: self.phases.clone(),
            account_id,
        })
    }
}

#[derive(Debug)]
struct PhaseGuard {
    phases: Arc<Mutex<HashMap<i64, SyncPhase>>>,
    account_id: i64,
}

impl PhaseGuard {
    fn set(&self, phase: SyncPhase) {
        if let Ok(mut phases) = self.phases.lock() {
            phases.insert(self.account_id, phase);
        }
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if let Ok(mut phases) = self.phases.lock() {
            phases.remove(&self.account_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    use maildeck_core::{
        Account, AccountStore, BlobStore, FolderKind, FolderStore, ImapParams, MailDb, MailError,
        MailTransport, MessageStore, NewExternalAccount, Result, SendMailRequest, SmtpParams,
        TransportReply, now_ts,
    };

    use super::{INITIAL_SYNC_DAYS, SyncEngine, SyncPhase, SyncReport};
    use crate::source::{ImapSource, RemoteAttachment, RemoteMessage};

    struct PlainTransport;

    #[async_trait::async_trait]
    impl MailTransport for PlainTransport {
        async fn encrypt_credential(&self, plaintext: &str) -> Result<String> {
            Ok(format!("ref:{plaintext}"))
        }

        async fn decrypt_credential(&self, opaque: &str) -> Result<String> {
            Ok(opaque.trim_start_matches("ref:").to_string())
        }

        async fn test_connection(&self, _account: &Account) -> Result<TransportReply> {
            Ok(TransportReply::ok("reachable"))
        }

        async fn send_mail(
            &self,
            _account: &Account,
            _request: &SendMailRequest,
        ) -> Result<TransportReply> {
            Ok(TransportReply::ok("sent"))
        }
    }

    struct MemoryBlobs {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryBlobs {
        fn new() -> Self {
            Self {
                files: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BlobStore for MemoryBlobs {
        async fn upload(&self, path: &str, bytes: &[u8]) -> Result<String> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), bytes.to_vec());
            Ok(path.to_string())
        }

        async fn public_url(&self, storage_ref: &str) -> Result<String> {
            Ok(format!("memory://{storage_ref}"))
        }

        async fn remove(&self, storage_ref: &str) -> Result<()> {
            self.files.lock().unwrap().remove(storage_ref);
            Ok(())
        }

        async fn download(&self, storage_ref: &str) -> Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(storage_ref)
                .cloned()
                .ok_or_else(|| MailError::NotFound(storage_ref.to_string()))
        }
    }

    struct BrokenCredentials;

    #[async_trait::async_trait]
    impl MailTransport for BrokenCredentials {
        async fn encrypt_credential(&self, plaintext: &str) -> Result<String> {
            Ok(format!("ref:{plaintext}"))
        }

        async fn decrypt_credential(&self, _opaque: &str) -> Result<String> {
            Err(MailError::Transport(
                "credential service unavailable".to_string(),
            ))
        }

        async fn test_connection(&self, _account: &Account) -> Result<TransportReply> {
            Ok(TransportReply::ok("reachable"))
        }

        async fn send_mail(
            &self,
            _account: &Account,
            _request: &SendMailRequest,
        ) -> Result<TransportReply> {
            Ok(TransportReply::ok("sent"))
        }
    }

    struct RejectingBlobs;

    #[async_trait::async_trait]
    impl BlobStore for RejectingBlobs {
        async fn upload(&self, _path: &str, _bytes: &[u8]) -> Result<String> {
            Err(MailError::Transport("blob store rejected the upload".to_string()))
        }

        async fn public_url(&self, storage_ref: &str) -> Result<String> {
            Ok(format!("memory://{storage_ref}"))
        }

        async fn remove(&self, _storage_ref: &str) -> Result<()> {
            Ok(())
        }

        async fn download(&self, _storage_ref: &str) -> Result<Vec<u8>> {
            Err(MailError::NotFound("nothing stored".to_string()))
        }
    }

    struct FixedSource {
        messages: Vec<RemoteMessage>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ImapSource for FixedSource {
        async fn fetch_recent(
            &self,
            _endpoint: &ImapParams,
            _username: &str,
            _password: &str,
            _since_days: i64,
        ) -> Result<Vec<RemoteMessage>> {
            if self.fail {
                return Err(MailError::Transport("connection refused".to_string()));
            }
            Ok(self.messages.clone())
        }
    }

    fn remote(key: &str, subject: &str) -> RemoteMessage {
        RemoteMessage {
            message_key: key.to_string(),
            from_address: "sender@provider.test".to_string(),
            from_name: None,
            to_addresses: vec!["me@provider.test".to_string()],
            cc_addresses: Vec::new(),
            subject: subject.to_string(),
            body_html: String::new(),
            body_text: format!("body of {subject}"),
            is_read: false,
            received_at: now_ts(),
            attachments: Vec::new(),
        }
    }

    fn temp_db_path(tag: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "maildeck-sync-{}-{}-{}.db",
            tag,
            std::process::id(),
            ts
        ))
    }

    async fn setup(
        tag: &str,
        source: FixedSource,
        transport: Arc<dyn MailTransport>,
        blobs: Arc<dyn BlobStore>,
    ) -> anyhow::Result<(SyncEngine, AccountStore, MailDb, i64, PathBuf)> {
        let path = temp_db_path(tag);
        let _ = std::fs::remove_file(&path);
        let db = MailDb::connect(path.to_str().expect("temp path")).await?;
        db.init().await?;
        let accounts = AccountStore::new(db.clone(), transport.clone());
        let account = accounts
            .create_external(
                "owner@deck.test",
                NewExternalAccount {
                    address: "me@provider.test".to_string(),
                    imap: ImapParams {
                        host: "imap.provider.test".to_string(),
                        port: 993,
                        secure: true,
                    },
                    smtp: SmtpParams {
                        host: "smtp.provider.test".to_string(),
                        port: 465,
                        secure: true,
                    },
                    credential: "secret".to_string(),
                    signature_html: None,
                },
            )
            .await?;
        let engine = SyncEngine::new(
            accounts.clone(),
            FolderStore::new(db.clone()),
            MessageStore::new(db.clone()),
            transport,
            Arc::new(source),
            blobs,
        );
        Ok((engine, accounts, db, account.id, path))
    }

    fn assert_success(report: &SyncReport, fetched: usize, saved: usize) {
        assert!(report.success, "report: {}", report.message);
        assert_eq!(report.fetched, fetched);
        assert_eq!(report.saved, saved);
    }

    #[tokio::test]
    async fn repeated_sync_saves_each_message_once() -> anyhow::Result<()> {
        let source = FixedSource {
            messages: vec![remote("key-1", "first"), remote("key-2", "second")],
            fail: false,
        };
        let (engine, accounts, db, account_id, path) = setup(
            "idempotent",
            source,
            Arc::new(PlainTransport),
            Arc::new(MemoryBlobs::new()),
        )
        .await?;

        let first = engine.sync_account(account_id).await?;
        assert_success(&first, 2, 2);
        let second = engine.sync_account(account_id).await?;
        assert_success(&second, 2, 0);

        // Counts were recalculated as part of the pass.
        let inbox = FolderStore::new(db.clone())
            .folder_by_kind(account_id, FolderKind::Inbox)
            .await?;
        assert_eq!(inbox.total_count, 2);
        assert_eq!(inbox.unread_count, 2);
        assert!(accounts.get_account(account_id).await?.last_sync_at.is_some());
        assert_eq!(engine.phase(account_id), SyncPhase::Idle);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_failure_reports_without_touching_last_sync() -> anyhow::Result<()> {
        let source = FixedSource {
            messages: Vec::new(),
            fail: true,
        };
        let (engine, accounts, _db, account_id, path) = setup(
            "fetchfail",
            source,
            Arc::new(PlainTransport),
            Arc::new(MemoryBlobs::new()),
        )
        .await?;

        let report = engine.sync_account(account_id).await?;
        assert!(!report.success);
        assert!(report.message.contains("connection refused"));
        assert!(accounts.get_account(account_id).await?.last_sync_at.is_none());
        assert_eq!(engine.phase(account_id), SyncPhase::Idle);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn credential_failure_reports_without_touching_last_sync() -> anyhow::Result<()> {
        let source = FixedSource {
            messages: vec![remote("key-1", "unreached")],
            fail: false,
        };
        let (engine, accounts, _db, account_id, path) = setup(
            "credfail",
            source,
            Arc::new(BrokenCredentials),
            Arc::new(MemoryBlobs::new()),
        )
        .await?;

        let report = engine.sync_account(account_id).await?;
        assert!(!report.success);
        assert!(report.message.contains("credential service unavailable"));
        assert!(accounts.get_account(account_id).await?.last_sync_at.is_none());
        assert_eq!(engine.phase(account_id), SyncPhase::Idle);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn attachment_upload_failure_skips_only_that_message() -> anyhow::Result<()> {
        let mut with_file = remote("key-1", "heavy");
        with_file.attachments.push(RemoteAttachment {
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            data: b"%PDF-".to_vec(),
        });
        let source = FixedSource {
            messages: vec![with_file, remote("key-2", "light")],
            fail: false,
        };
        let (engine, _accounts, db, account_id, path) = setup(
            "uploadfail",
            source,
            Arc::new(PlainTransport),
            Arc::new(RejectingBlobs),
        )
        .await?;

        let report = engine.sync_account(account_id).await?;
        assert_success(&report, 2, 1);

        let inbox = FolderStore::new(db.clone())
            .folder_by_kind(account_id, FolderKind::Inbox)
            .await?;
        assert_eq!(inbox.total_count, 1);
        let saved = MessageStore::new(db.clone())
            .find_by_message_key(account_id, "key-2")
            .await?;
        assert!(saved.is_some());

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn internal_accounts_cannot_sync() -> anyhow::Result<()> {
        let source = FixedSource {
            messages: Vec::new(),
            fail: false,
        };
        let (engine, accounts, _db, _account_id, path) = setup(
            "internal",
            source,
            Arc::new(PlainTransport),
            Arc::new(MemoryBlobs::new()),
        )
        .await?;
        let internal = accounts.create_internal("owner@deck.test").await?;

        let err = engine.sync_account(internal.id).await.unwrap_err();
        assert!(matches!(err, MailError::Validation(_)));

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_claim_is_rejected_with_conflict() -> anyhow::Result<()> {
        let source = FixedSource {
            messages: Vec::new(),
            fail: false,
        };
        let (engine, _accounts, _db, account_id, path) = setup(
            "busy",
            source,
            Arc::new(PlainTransport),
            Arc::new(MemoryBlobs::new()),
        )
        .await?;

        let guard = engine.claim(account_id)?;
        guard.set(SyncPhase::Fetching);
        assert_eq!(engine.phase(account_id), SyncPhase::Fetching);
        let err = engine.claim(account_id).unwrap_err();
        assert!(matches!(err, MailError::Conflict(_)));

        drop(guard);
        assert_eq!(engine.phase(account_id), SyncPhase::Idle);
        assert!(engine.claim(account_id).is_ok());

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_accounts_report_without_fetching() -> anyhow::Result<()> {
        let source = FixedSource {
            messages: vec![remote("key-1", "skipped")],
            fail: false,
        };
        let (engine, _accounts, db, account_id, path) = setup(
            "disabled",
            source,
            Arc::new(PlainTransport),
            Arc::new(MemoryBlobs::new()),
        )
        .await?;
        sqlx::query("UPDATE mail_accounts SET sync_enabled = 0 WHERE id = ?")
            .bind(account_id)
            .execute(db.pool())
            .await?;

        let report = engine.sync_account(account_id).await?;
        assert!(!report.success);
        assert!(report.message.contains("disabled"));

        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}
