//! Folder store. Unread/total counters are derived caches: mutations may
//! leave them stale, `recalculate_counts` is the only source of truth and is
//! a pure recompute, safe to run concurrently and repeatedly.

use tracing::debug;

use crate::{
    ChangeEvent, ChangeKind, EntityKind, Folder, FolderKind, MailDb, MailError, Result,
};

const FOLDER_COLUMNS: &str =
    "id, account_id, name, folder_type, parent_id, position, color, unread_count, total_count";

#[derive(sqlx::FromRow)]
struct FolderRow {
    id: i64,
    account_id: i64,
    name: String,
    folder_type: String,
    parent_id: Option<i64>,
    position: i64,
    color: Option<String>,
    unread_count: i64,
    total_count: i64,
}

impl FolderRow {
    fn into_folder(self) -> Folder {
        Folder {
            id: self.id,
            account_id: self.account_id,
            name: self.name,
            kind: FolderKind::parse(&self.folder_type),
            parent_id: self.parent_id,
            position: self.position,
            color: self.color,
            unread_count: self.unread_count,
            total_count: self.total_count,
        }
    }
}

pub(crate) async fn provision_system_folders(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    account_id: i64,
) -> Result<()> {
    for (position, kind) in FolderKind::SYSTEM.iter().enumerate() {
        sqlx::query(
            "INSERT INTO mail_folders (account_id, name, folder_type, position)
             VALUES (?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(kind.display_name())
        .bind(kind.as_str())
        .bind(position as i64)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct FolderStore {
    db: MailDb,
}

impl FolderStore {
    pub fn new(db: MailDb) -> Self {
        Self { db }
    }

    pub async fn list_folders(&self, account_id: i64) -> Result<Vec<Folder>> {
        let query = format!(
            "SELECT {FOLDER_COLUMNS} FROM mail_folders WHERE account_id = ? ORDER BY position, id"
        );
        let rows = sqlx::query_as::<_, FolderRow>(&query)
            .bind(account_id)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.into_iter().map(FolderRow::into_folder).collect())
    }

    pub async fn get_folder(&self, id: i64) -> Result<Folder> {
        let query = format!("SELECT {FOLDER_COLUMNS} FROM mail_folders WHERE id = ?");
        let row = sqlx::query_as::<_, FolderRow>(&query)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| MailError::NotFound(format!("folder {id}")))?;
        Ok(row.into_folder())
    }

    /// System folders exist exactly once per account.
    pub async fn folder_by_kind(&self, account_id: i64, kind: FolderKind) -> Result<Folder> {
        let query = format!(
            "SELECT {FOLDER_COLUMNS} FROM mail_folders
             WHERE account_id = ? AND folder_type = ?"
        );
        let row = sqlx::query_as::<_, FolderRow>(&query)
            .bind(account_id)
            .bind(kind.as_str())
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| {
                MailError::NotFound(format!("{} folder for account {account_id}", kind.as_str()))
            })?;
        Ok(row.into_folder())
    }

    pub async fn create_custom_folder(
        &self,
        account_id: i64,
        name: &str,
        parent_id: Option<i64>,
        color: Option<String>,
    ) -> Result<Folder> {
        if name.trim().is_empty() {
            return Err(MailError::Validation("folder name must not be empty".to_string()));
        }
        if let Some(parent_id) = parent_id {
            let parent = self.get_folder(parent_id).await?;
            if parent.account_id != account_id {
                return Err(MailError::Validation(
                    "parent folder belongs to a different account".to_string(),
                ));
            }
        }
        let (next_position,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM mail_folders WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_one(self.db.pool())
        .await?;
        let result = sqlx::query(
            "INSERT INTO mail_folders (account_id, name, folder_type, parent_id, position, color)
             VALUES (?, ?, 'custom', ?, ?, ?)",
        )
        .bind(account_id)
        .bind(name.trim())
        .bind(parent_id)
        .bind(next_position)
        .bind(&color)
        .execute(self.db.pool())
        .await?;
        let folder_id = result.last_insert_rowid();
        self.db.feed().publish(ChangeEvent {
            account_id,
            entity: EntityKind::Folder,
            kind: ChangeKind::Insert,
            record_id: folder_id,
            folder_id: Some(folder_id),
        });
        self.get_folder(folder_id).await
    }

    pub async fn rename_folder(&self, id: i64, new_name: &str) -> Result<Folder> {
        if new_name.trim().is_empty() {
            return Err(MailError::Validation("folder name must not be empty".to_string()));
        }
        let folder = self.get_folder(id).await?;
        if folder.kind.is_system() {
            return Err(MailError::Forbidden(format!(
                "system folder {} cannot be renamed",
                folder.name
            )));
        }
        sqlx::query("UPDATE mail_folders SET name = ? WHERE id = ?")
            .bind(new_name.trim())
            .bind(id)
            .execute(self.db.pool())
            .await?;
        self.db.feed().publish(ChangeEvent {
            account_id: folder.account_id,
            entity: EntityKind::Folder,
            kind: ChangeKind::Update,
            record_id: id,
            folder_id: Some(id),
        });
        self.get_folder(id).await
    }

    pub async fn delete_folder(&self, id: i64) -> Result<()> {
        let folder = self.get_folder(id).await?;
        if folder.kind.is_system() {
            return Err(MailError::Forbidden(format!(
                "system folder {} cannot be deleted",
                folder.name
            )));
        }
        sqlx::query("DELETE FROM mail_folders WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        self.db.feed().publish(ChangeEvent {
            account_id: folder.account_id,
            entity: EntityKind::Folder,
            kind: ChangeKind::Delete,
            record_id: id,
            folder_id: Some(id),
        });
        Ok(())
    }

    /// Full reconciliation pass: recomputes both counters for every folder of
    /// the account from the non-deleted messages, in one transaction.
    pub async fn recalculate_counts(&self, account_id: i64) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query(
            "UPDATE mail_folders SET
               total_count = (
                 SELECT COUNT(*) FROM mail_messages m
                 WHERE m.folder_id = mail_folders.id AND m.deleted_at IS NULL
               ),
               unread_count = (
                 SELECT COUNT(*) FROM mail_messages m
                 WHERE m.folder_id = mail_folders.id AND m.deleted_at IS NULL AND m.is_read = 0
               )
             WHERE account_id = ?",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(account_id, "recalculated folder counts");
        Ok(())
    }
}
