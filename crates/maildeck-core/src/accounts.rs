//! Account store: one internal platform account per owner plus any number
//! of externally-hosted IMAP/SMTP accounts. System folders are provisioned
//! in the same transaction that creates the account.

use std::sync::Arc;

use tracing::debug;

use crate::contracts::{MailTransport, TransportReply};
use crate::folders::provision_system_folders;
use crate::{Account, AccountKind, ImapParams, MailDb, MailError, Result, SmtpParams};

const ACCOUNT_COLUMNS: &str = "id, owner_identity, account_type, external_address, \
     imap_host, imap_port, imap_secure, smtp_host, smtp_port, smtp_secure, \
     credential_ref, signature_html, is_default, is_system_default, sync_enabled, last_sync_at";

#[derive(Debug, Clone)]
pub struct NewExternalAccount {
    pub address: String,
    pub imap: ImapParams,
    pub smtp: SmtpParams,
    pub credential: String,
    pub signature_html: Option<String>,
}

/// Partial update; `None` leaves the stored value untouched. A `credential`
/// of `None` in particular keeps the existing opaque reference.
#[derive(Debug, Clone, Default)]
pub struct UpdateAccount {
    pub external_address: Option<String>,
    pub imap: Option<ImapParams>,
    pub smtp: Option<SmtpParams>,
    pub credential: Option<String>,
    pub signature_html: Option<String>,
    pub sync_enabled: Option<bool>,
}

impl UpdateAccount {
    fn touches_external_config(&self) -> bool {
        self.external_address.is_some()
            || self.imap.is_some()
            || self.smtp.is_some()
            || self.credential.is_some()
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    owner_identity: String,
    account_type: String,
    external_address: Option<String>,
    imap_host: Option<String>,
    imap_port: Option<i64>,
    imap_secure: Option<i64>,
    smtp_host: Option<String>,
    smtp_port: Option<i64>,
    smtp_secure: Option<i64>,
    credential_ref: Option<String>,
    signature_html: Option<String>,
    is_default: i64,
    is_system_default: i64,
    sync_enabled: i64,
    last_sync_at: Option<i64>,
}

impl AccountRow {
    fn into_account(self) -> Result<Account> {
        let kind = match self.account_type.as_str() {
            "internal" => AccountKind::Internal,
            "external" => {
                let missing = || {
                    MailError::Validation(format!(
                        "external account {} is missing connection fields",
                        self.id
                    ))
                };
                AccountKind::External {
                    imap: ImapParams {
                        host: self.imap_host.ok_or_else(missing)?,
                        port: self.imap_port.ok_or_else(missing)? as u16,
                        secure: self.imap_secure.unwrap_or(1) != 0,
                    },
                    smtp: SmtpParams {
                        host: self.smtp_host.ok_or_else(missing)?,
                        port: self.smtp_port.ok_or_else(missing)? as u16,
                        secure: self.smtp_secure.unwrap_or(1) != 0,
                    },
                    credential_ref: self.credential_ref.ok_or_else(missing)?,
                }
            }
            other => {
                return Err(MailError::Validation(format!(
                    "unknown account type {other}"
                )));
            }
        };
        Ok(Account {
            id: self.id,
            owner_identity: self.owner_identity,
            kind,
            external_address: self.external_address,
            signature_html: self.signature_html,
            is_default: self.is_default != 0,
            is_system_default: self.is_system_default != 0,
            sync_enabled: self.sync_enabled != 0,
            last_sync_at: self.last_sync_at,
        })
    }
}

#[derive(Clone)]
pub struct AccountStore {
    db: MailDb,
    transport: Arc<dyn MailTransport>,
}

impl AccountStore {
    pub fn new(db: MailDb, transport: Arc<dyn MailTransport>) -> Self {
        Self { db, transport }
    }

    pub async fn list_accounts(&self, owner: &str) -> Result<Vec<Account>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mail_accounts WHERE owner_identity = ? ORDER BY id"
        );
        let rows = sqlx::query_as::<_, AccountRow>(&query)
            .bind(owner)
            .fetch_all(self.db.pool())
            .await?;
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    pub async fn get_account(&self, id: i64) -> Result<Account> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM mail_accounts WHERE id = ?");
        let row = sqlx::query_as::<_, AccountRow>(&query)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| MailError::NotFound(format!("account {id}")))?;
        row.into_account()
    }

    /// Idempotent: returns the existing internal account for the owner when
    /// one is already present.
    pub async fn create_internal(&self, owner: &str) -> Result<Account> {
        if let Some((id,)) = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM mail_accounts WHERE owner_identity = ? AND account_type = 'internal'",
        )
        .bind(owner)
        .fetch_optional(self.db.pool())
        .await?
        {
            return self.get_account(id).await;
        }

        let mut tx = self.db.pool().begin().await?;
        let is_default = !owner_has_default(&mut tx, owner).await?;
        let result = sqlx::query(
            "INSERT INTO mail_accounts (owner_identity, account_type, is_default, sync_enabled)
             VALUES (?, 'internal', ?, 0)",
        )
        .bind(owner)
        .bind(is_default)
        .execute(&mut *tx)
        .await?;
        let account_id = result.last_insert_rowid();
        provision_system_folders(&mut tx, account_id).await?;
        tx.commit().await?;
        debug!(account_id, owner, "created internal account");
        self.get_account(account_id).await
    }

    pub async fn create_external(&self, owner: &str, params: NewExternalAccount) -> Result<Account> {
        validate_external_params(&params)?;
        let credential_ref = self.transport.encrypt_credential(&params.credential).await?;

        let mut tx = self.db.pool().begin().await?;
        let is_default = !owner_has_default(&mut tx, owner).await?;
        let result = sqlx::query(
            "INSERT INTO mail_accounts
             (owner_identity, account_type, external_address,
              imap_host, imap_port, imap_secure, smtp_host, smtp_port, smtp_secure,
              credential_ref, signature_html, is_default, sync_enabled)
             VALUES (?, 'external', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(owner)
        .bind(&params.address)
        .bind(&params.imap.host)
        .bind(params.imap.port as i64)
        .bind(params.imap.secure)
        .bind(&params.smtp.host)
        .bind(params.smtp.port as i64)
        .bind(params.smtp.secure)
        .bind(&credential_ref)
        .bind(&params.signature_html)
        .bind(is_default)
        .execute(&mut *tx)
        .await
        .map_err(|err| match err {
            // The partial unique index on (owner_identity, external_address)
            // is the authoritative duplicate check, even under concurrent
            // creates.
            sqlx::Error::Database(db) if db.is_unique_violation() => MailError::Conflict(
                format!("account for {} already exists", params.address),
            ),
            other => other.into(),
        })?;
        let account_id = result.last_insert_rowid();
        provision_system_folders(&mut tx, account_id).await?;
        tx.commit().await?;
        debug!(account_id, owner, address = %params.address, "created external account");
        self.get_account(account_id).await
    }

    pub async fn update_account(&self, id: i64, patch: UpdateAccount) -> Result<Account> {
        let current = self.get_account(id).await?;
        if matches!(current.kind, AccountKind::Internal) && patch.touches_external_config() {
            return Err(MailError::Validation(
                "internal accounts have no IMAP/SMTP configuration".to_string(),
            ));
        }

        let (mut imap, mut smtp, mut credential_ref) = match current.kind.clone() {
            AccountKind::External {
                imap,
                smtp,
                credential_ref,
            } => (Some(imap), Some(smtp), Some(credential_ref)),
            AccountKind::Internal => (None, None, None),
        };
        if let Some(new_imap) = patch.imap {
            imap = Some(new_imap);
        }
        if let Some(new_smtp) = patch.smtp {
            smtp = Some(new_smtp);
        }
        if let Some(plaintext) = &patch.credential {
            if plaintext.trim().is_empty() {
                return Err(MailError::Validation("credential must not be empty".to_string()));
            }
            credential_ref = Some(self.transport.encrypt_credential(plaintext).await?);
        }
        let external_address = patch
            .external_address
            .or(current.external_address);
        let signature_html = patch.signature_html.or(current.signature_html);
        let sync_enabled = patch.sync_enabled.unwrap_or(current.sync_enabled);

        sqlx::query(
            "UPDATE mail_accounts SET external_address = ?,
               imap_host = ?, imap_port = ?, imap_secure = ?,
               smtp_host = ?, smtp_port = ?, smtp_secure = ?,
               credential_ref = ?, signature_html = ?, sync_enabled = ?
             WHERE id = ?",
        )
        .bind(&external_address)
        .bind(imap.as_ref().map(|p| p.host.clone()))
        .bind(imap.as_ref().map(|p| p.port as i64))
        .bind(imap.as_ref().map(|p| p.secure))
        .bind(smtp.as_ref().map(|p| p.host.clone()))
        .bind(smtp.as_ref().map(|p| p.port as i64))
        .bind(smtp.as_ref().map(|p| p.secure))
        .bind(&credential_ref)
        .bind(&signature_html)
        .bind(sync_enabled)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        self.get_account(id).await
    }

    /// Cascades to folders, messages, attachments and labels via foreign keys.
    pub async fn delete_account(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM mail_accounts WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(MailError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    /// Atomically clears the owner's previous default and sets the new one.
    pub async fn set_default(&self, owner: &str, id: i64) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        let owned = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM mail_accounts WHERE id = ? AND owner_identity = ?",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;
        if owned.is_none() {
            return Err(MailError::NotFound(format!("account {id} for owner {owner}")));
        }
        sqlx::query("UPDATE mail_accounts SET is_default = 0 WHERE owner_identity = ?")
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE mail_accounts SET is_default = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// At most one account system-wide carries the flag; `None` clears it.
    pub async fn set_system_default(&self, id: Option<i64>) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("UPDATE mail_accounts SET is_system_default = 0")
            .execute(&mut *tx)
            .await?;
        if let Some(id) = id {
            let result = sqlx::query("UPDATE mail_accounts SET is_system_default = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MailError::NotFound(format!("account {id}")));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn test_connection(&self, id: i64) -> Result<TransportReply> {
        let account = self.get_account(id).await?;
        self.transport.test_connection(&account).await
    }

    pub async fn touch_last_sync(&self, id: i64, ts: i64) -> Result<()> {
        sqlx::query("UPDATE mail_accounts SET last_sync_at = ? WHERE id = ?")
            .bind(ts)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Resolves a recipient address to an internal account, used by the send
    /// pipeline for platform-local delivery.
    pub async fn find_internal_by_address(&self, address: &str) -> Result<Option<Account>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mail_accounts
             WHERE owner_identity = ? AND account_type = 'internal'"
        );
        let row = sqlx::query_as::<_, AccountRow>(&query)
            .bind(address)
            .fetch_optional(self.db.pool())
            .await?;
        row.map(AccountRow::into_account).transpose()
    }
}

async fn owner_has_default(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    owner: &str,
) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM mail_accounts WHERE owner_identity = ? AND is_default = 1",
    )
    .bind(owner)
    .fetch_one(&mut **tx)
    .await?;
    Ok(count > 0)
}

fn validate_external_params(params: &NewExternalAccount) -> Result<()> {
    let address = params.address.trim();
    if address.is_empty() || !address.contains('@') {
        return Err(MailError::Validation(format!(
            "malformed external address {:?}",
            params.address
        )));
    }
    if params.imap.host.trim().is_empty() || params.smtp.host.trim().is_empty() {
        return Err(MailError::Validation("IMAP and SMTP hosts are required".to_string()));
    }
    if params.imap.port == 0 || params.smtp.port == 0 {
        return Err(MailError::Validation("IMAP and SMTP ports are required".to_string()));
    }
    if params.credential.trim().is_empty() {
        return Err(MailError::Validation("credential is required".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;

    use super::{AccountStore, NewExternalAccount, UpdateAccount};
    use crate::contracts::{MailTransport, SendMailRequest, TransportReply};
    use crate::{Account, AccountKind, FolderKind, ImapParams, MailDb, MailError, Result, SmtpParams};

    fn temp_db_path(tag: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "maildeck-accounts-{}-{}-{}.db",
            tag,
            std::process::id(),
            ts
        ))
    }

    struct EchoTransport;

    #[async_trait]
    impl MailTransport for EchoTransport {
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

    async fn store(tag: &str) -> anyhow::Result<(AccountStore, MailDb, PathBuf)> {
        let path = temp_db_path(tag);
        let _ = std::fs::remove_file(&path);
        let db = MailDb::connect(path.to_str().expect("temp path")).await?;
        db.init().await?;
        let store = AccountStore::new(db.clone(), Arc::new(EchoTransport));
        Ok((store, db, path))
    }

    fn external_params() -> NewExternalAccount {
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
            credential: "hunter2".to_string(),
            signature_html: None,
        }
    }

    #[tokio::test]
    async fn create_internal_is_idempotent_and_provisions_system_folders() -> anyhow::Result<()> {
        let (store, db, path) = store("internal").await?;

        let first = store.create_internal("alice@deck.test").await?;
        let second = store.create_internal("alice@deck.test").await?;
        assert_eq!(first.id, second.id);
        assert!(first.is_default);
        assert!(matches!(first.kind, AccountKind::Internal));

        let folders = crate::FolderStore::new(db.clone())
            .list_folders(first.id)
            .await?;
        assert_eq!(folders.len(), FolderKind::SYSTEM.len());
        assert!(folders.iter().any(|f| f.kind == FolderKind::Inbox));
        assert!(folders.iter().any(|f| f.kind == FolderKind::Drafts));

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn external_creation_validates_and_rejects_duplicates() -> anyhow::Result<()> {
        let (store, _db, path) = store("external").await?;

        let mut bad = external_params();
        bad.imap.host.clear();
        let err = store.create_external("bob@deck.test", bad).await.unwrap_err();
        assert!(matches!(err, MailError::Validation(_)));

        let account = store
            .create_external("bob@deck.test", external_params())
            .await?;
        match &account.kind {
            AccountKind::External { credential_ref, .. } => {
                assert_eq!(credential_ref, "ref:hunter2");
            }
            AccountKind::Internal => panic!("expected external account"),
        }

        let err = store
            .create_external("bob@deck.test", external_params())
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Conflict(_)));

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn set_default_clears_prior_default_for_owner() -> anyhow::Result<()> {
        let (store, _db, path) = store("default").await?;

        let internal = store.create_internal("carol@deck.test").await?;
        let external = store
            .create_external("carol@deck.test", external_params())
            .await?;
        assert!(internal.is_default);
        assert!(!external.is_default);

        store.set_default("carol@deck.test", external.id).await?;
        let accounts = store.list_accounts("carol@deck.test").await?;
        let defaults: Vec<_> = accounts.iter().filter(|a| a.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, external.id);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn set_system_default_is_exclusive_across_owners() -> anyhow::Result<()> {
        let (store, _db, path) = store("sysdefault").await?;

        let a = store.create_internal("one@deck.test").await?;
        let b = store.create_internal("two@deck.test").await?;

        store.set_system_default(Some(a.id)).await?;
        store.set_system_default(Some(b.id)).await?;
        assert!(!store.get_account(a.id).await?.is_system_default);
        assert!(store.get_account(b.id).await?.is_system_default);

        store.set_system_default(None).await?;
        assert!(!store.get_account(b.id).await?.is_system_default);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn update_keeps_credential_when_patch_omits_it() -> anyhow::Result<()> {
        let (store, _db, path) = store("update").await?;

        let account = store
            .create_external("dave@deck.test", external_params())
            .await?;
        let updated = store
            .update_account(
                account.id,
                UpdateAccount {
                    signature_html: Some("<p>--dave</p>".to_string()),
                    ..UpdateAccount::default()
                },
            )
            .await?;
        match &updated.kind {
            AccountKind::External { credential_ref, .. } => {
                assert_eq!(credential_ref, "ref:hunter2");
            }
            AccountKind::Internal => panic!("expected external account"),
        }
        assert_eq!(updated.signature_html.as_deref(), Some("<p>--dave</p>"));

        let rotated = store
            .update_account(
                account.id,
                UpdateAccount {
                    credential: Some("hunter3".to_string()),
                    ..UpdateAccount::default()
                },
            )
            .await?;
        match &rotated.kind {
            AccountKind::External { credential_ref, .. } => {
                assert_eq!(credential_ref, "ref:hunter3");
            }
            AccountKind::Internal => panic!("expected external account"),
        }

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[tokio::test]
    async fn delete_account_cascades_to_folders() -> anyhow::Result<()> {
        let (store, db, path) = store("delete").await?;

        let account = store.create_internal("erin@deck.test").await?;
        store.delete_account(account.id).await?;

        let err = store.get_account(account.id).await.unwrap_err();
        assert!(matches!(err, MailError::NotFound(_)));
        let folders = crate::FolderStore::new(db.clone())
            .list_folders(account.id)
            .await?;
        assert!(folders.is_empty());

        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}
