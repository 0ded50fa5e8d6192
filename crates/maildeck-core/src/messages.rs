//! Message store: paginated listing, flag mutation, soft delete/restore,
//! labels and substring search. Search is a deliberate linear filter over
//! subject/body/from, not a ranked full-text index.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::{
    AttachmentMeta, ChangeEvent, ChangeKind, EntityKind, Label, MailDb, MailError, Message,
    Result, decode_addresses, encode_addresses, now_ts, placeholders, snippet_from_text,
};

pub const PAGE_SIZE: usize = 50;
pub const SEARCH_LIMIT: usize = 100;

const MESSAGE_COLUMNS: &str = "id, account_id, folder_id, message_key, thread_key, in_reply_to, \
     from_address, from_name, to_addresses, cc_addresses, bcc_addresses, subject, \
     body_html, body_text, snippet, is_read, is_starred, is_draft, received_at, deleted_at";

#[derive(Debug, Clone)]
pub struct NewMessage {
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
    pub is_read: bool,
    pub is_draft: bool,
    pub received_at: i64,
    pub attachments: Vec<NewAttachment>,
}

/// Attachment metadata persisted alongside a message. Rows are only created
/// for blobs that were already uploaded successfully; `storage_ref` is the
/// blob store's handle.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub filename: String,
    pub mime_type: String,
    pub file_size: i64,
    pub storage_ref: String,
}

#[derive(Debug, Clone)]
pub struct MessageWithMeta {
    pub message: Message,
    pub attachments: Vec<AttachmentMeta>,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    pub items: Vec<MessageWithMeta>,
    pub page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub folder_id: Option<i64>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub received_after: Option<i64>,
    pub received_before: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    account_id: i64,
    folder_id: i64,
    message_key: Option<String>,
    thread_key: Option<String>,
    in_reply_to: Option<String>,
    from_address: String,
    from_name: Option<String>,
    to_addresses: String,
    cc_addresses: String,
    bcc_addresses: String,
    subject: String,
    body_html: String,
    body_text: String,
    snippet: String,
    is_read: i64,
    is_starred: i64,
    is_draft: i64,
    received_at: i64,
    deleted_at: Option<i64>,
}

impl MessageRow {
    fn into_message(self) -> Message {
        Message {
            id: self.id,
            account_id: self.account_id,
            folder_id: self.folder_id,
            message_key: self.message_key,
            thread_key: self.thread_key,
            in_reply_to: self.in_reply_to,
            from_address: self.from_address,
            from_name: self.from_name,
            to_addresses: decode_addresses(&self.to_addresses),
            cc_addresses: decode_addresses(&self.cc_addresses),
            bcc_addresses: decode_addresses(&self.bcc_addresses),
            subject: self.subject,
            body_html: self.body_html,
            body_text: self.body_text,
            snippet: self.snippet,
            is_read: self.is_read != 0,
            is_starred: self.is_starred != 0,
            is_draft: self.is_draft != 0,
            received_at: self.received_at,
            deleted_at: self.deleted_at,
        }
    }
}

#[derive(Clone)]
pub struct MessageStore {
    db: MailDb,
}

impl MessageStore {
    pub fn new(db: MailDb) -> Self {
        Self { db }
    }

    pub async fn insert_message(&self, message: NewMessage) -> Result<i64> {
        if message.from_address.trim().is_empty() {
            return Err(MailError::Validation("from address is required".to_string()));
        }
        let snippet = snippet_from_text(&message.body_text);
        let mut tx = self.db.pool().begin().await?;
        let result = sqlx::query(
            "INSERT INTO mail_messages
             (account_id, folder_id, message_key, thread_key, in_reply_to, from_address,
              from_name, to_addresses, cc_addresses, bcc_addresses, subject, body_html,
              body_text, snippet, is_read, is_starred, is_draft, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(message.account_id)
        .bind(message.folder_id)
        .bind(&message.message_key)
        .bind(&message.thread_key)
        .bind(&message.in_reply_to)
        .bind(&message.from_address)
        .bind(&message.from_name)
        .bind(encode_addresses(&message.to_addresses))
        .bind(encode_addresses(&message.cc_addresses))
        .bind(encode_addresses(&message.bcc_addresses))
        .bind(&message.subject)
        .bind(&message.body_html)
        .bind(&message.body_text)
        .bind(&snippet)
        .bind(message.is_read)
        .bind(message.is_draft)
        .bind(message.received_at)
        .execute(&mut *tx)
        .await?;
        let message_id = result.last_insert_rowid();
        insert_attachment_rows(&mut tx, message_id, &message.attachments).await?;
        tx.commit().await?;

        self.db.feed().publish(ChangeEvent {
            account_id: message.account_id,
            entity: EntityKind::Message,
            kind: ChangeKind::Insert,
            record_id: message_id,
            folder_id: Some(message.folder_id),
        });
        Ok(message_id)
    }

    /// Rewrites a saved draft in place, replacing its attachment rows.
    pub async fn update_draft(&self, id: i64, draft: &NewMessage) -> Result<()> {
        let existing = self.get_message(id).await?;
        if !existing.message.is_draft {
            return Err(MailError::Validation(format!("message {id} is not a draft")));
        }
        let snippet = snippet_from_text(&draft.body_text);
        let mut tx = self.db.pool().begin().await?;
        sqlx::query(
            "UPDATE mail_messages SET thread_key = ?, in_reply_to = ?, from_address = ?,
               from_name = ?, to_addresses = ?, cc_addresses = ?, bcc_addresses = ?,
               subject = ?, body_html = ?, body_text = ?, snippet = ?, received_at = ?
             WHERE id = ?",
        )
        .bind(&draft.thread_key)
        .bind(&draft.in_reply_to)
        .bind(&draft.from_address)
        .bind(&draft.from_name)
        .bind(encode_addresses(&draft.to_addresses))
        .bind(encode_addresses(&draft.cc_addresses))
        .bind(encode_addresses(&draft.bcc_addresses))
        .bind(&draft.subject)
        .bind(&draft.body_html)
        .bind(&draft.body_text)
        .bind(&snippet)
        .bind(draft.received_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM mail_attachments WHERE message_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_attachment_rows(&mut tx, id, &draft.attachments).await?;
        tx.commit().await?;

        self.db.feed().publish(ChangeEvent {
            account_id: existing.message.account_id,
            entity: EntityKind::Message,
            kind: ChangeKind::Update,
            record_id: id,
            folder_id: Some(existing.message.folder_id),
        });
        Ok(())
    }

    /// Non-deleted messages of one folder, newest first, fixed page size.
    /// A full page implies there may be more.
    pub async fn list_messages(
        &self,
        account_id: i64,
        folder_id: i64,
        page: u32,
    ) -> Result<MessagePage> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM mail_messages
             WHERE account_id = ? AND folder_id = ? AND deleted_at IS NULL
             ORDER BY received_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(account_id)
            .bind(folder_id)
            .bind(PAGE_SIZE as i64)
            .bind(page as i64 * PAGE_SIZE as i64)
            .fetch_all(self.db.pool())
            .await?;
        let messages: Vec<Message> = rows.into_iter().map(MessageRow::into_message).collect();
        let has_more = messages.len() == PAGE_SIZE;
        let items = self.attach_meta(messages).await?;
        Ok(MessagePage {
            items,
            page,
            has_more,
        })
    }

    pub async fn get_message(&self, id: i64) -> Result<MessageWithMeta> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM mail_messages WHERE id = ?");
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| MailError::NotFound(format!("message {id}")))?;
        let mut items = self.attach_meta(vec![row.into_message()]).await?;
        Ok(items.remove(0))
    }

    /// Sync idempotence lookup over the `(account_id, message_key)` key.
    pub async fn find_by_message_key(&self, account_id: i64, key: &str) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM mail_messages WHERE account_id = ? AND message_key = ?",
        )
        .bind(account_id)
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn mark_read(&self, ids: &[i64], is_read: bool) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let located = self.locate(ids).await?;
        let query = format!(
            "UPDATE mail_messages SET is_read = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&query).bind(is_read);
        for id in ids {
            q = q.bind(id);
        }
        q.execute(self.db.pool()).await?;
        self.publish_updates(&located);
        Ok(())
    }

    /// Read-then-write inside one transaction so rapid double toggles never
    /// lose an inversion. Returns the new value.
    pub async fn toggle_star(&self, id: i64) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;
        let row = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT account_id, folder_id, is_starred FROM mail_messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MailError::NotFound(format!("message {id}")))?;
        let starred = row.2 == 0;
        sqlx::query("UPDATE mail_messages SET is_starred = ? WHERE id = ?")
            .bind(starred)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.publish_updates(&[(id, row.0, row.1)]);
        Ok(starred)
    }

    /// Cross-account moves are rejected before any row changes.
    pub async fn move_to_folder(&self, ids: &[i64], target_folder_id: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let target_account = self.folder_account(target_folder_id).await?;
        let located = self.locate(ids).await?;
        for (id, account_id, _) in &located {
            if *account_id != target_account {
                return Err(MailError::Validation(format!(
                    "message {id} belongs to another account than the target folder"
                )));
            }
        }
        let query = format!(
            "UPDATE mail_messages SET folder_id = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&query).bind(target_folder_id);
        for id in ids {
            q = q.bind(id);
        }
        q.execute(self.db.pool()).await?;
        let moved: Vec<(i64, i64, i64)> = located
            .into_iter()
            .map(|(id, account_id, _)| (id, account_id, target_folder_id))
            .collect();
        self.publish_updates(&moved);
        Ok(())
    }

    pub async fn soft_delete(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let located = self.locate(ids).await?;
        let query = format!(
            "UPDATE mail_messages SET deleted_at = ? WHERE id IN ({}) AND deleted_at IS NULL",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&query).bind(now_ts());
        for id in ids {
            q = q.bind(id);
        }
        q.execute(self.db.pool()).await?;
        self.publish_updates(&located);
        Ok(())
    }

    pub async fn restore(&self, ids: &[i64], target_folder_id: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let target_account = self.folder_account(target_folder_id).await?;
        let located = self.locate(ids).await?;
        for (id, account_id, _) in &located {
            if *account_id != target_account {
                return Err(MailError::Validation(format!(
                    "message {id} belongs to another account than the target folder"
                )));
            }
        }
        let query = format!(
            "UPDATE mail_messages SET deleted_at = NULL, folder_id = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&query).bind(target_folder_id);
        for id in ids {
            q = q.bind(id);
        }
        q.execute(self.db.pool()).await?;
        let restored: Vec<(i64, i64, i64)> = located
            .into_iter()
            .map(|(id, account_id, _)| (id, account_id, target_folder_id))
            .collect();
        self.publish_updates(&restored);
        Ok(())
    }

    /// Hard delete. Attachment rows go with the message via cascade. Returns
    /// the blob references left with no surviving attachment row, so the
    /// caller can remove the blobs themselves; refs still shared with other
    /// messages (sent copies, internal deliveries) are withheld.
    pub async fn purge(&self, ids: &[i64]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let located = self.locate(ids).await?;
        let refs_query = format!(
            "SELECT DISTINCT storage_ref FROM mail_attachments WHERE message_id IN ({})",
            placeholders(ids.len())
        );
        let mut refs_q = sqlx::query_as::<_, (String,)>(&refs_query);
        for id in ids {
            refs_q = refs_q.bind(id);
        }
        let storage_refs: Vec<String> = refs_q
            .fetch_all(self.db.pool())
            .await?
            .into_iter()
            .map(|r| r.0)
            .collect();

        let delete_query = format!(
            "DELETE FROM mail_messages WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&delete_query);
        for id in ids {
            q = q.bind(id);
        }
        q.execute(self.db.pool()).await?;

        let orphaned_refs = self.without_survivors(storage_refs).await?;

        for (id, account_id, folder_id) in &located {
            self.db.feed().publish(ChangeEvent {
                account_id: *account_id,
                entity: EntityKind::Message,
                kind: ChangeKind::Delete,
                record_id: *id,
                folder_id: Some(*folder_id),
            });
        }
        debug!(count = ids.len(), "purged messages");
        Ok(orphaned_refs)
    }

    /// Drops refs that still back an attachment row somewhere else.
    async fn without_survivors(&self, refs: Vec<String>) -> Result<Vec<String>> {
        if refs.is_empty() {
            return Ok(refs);
        }
        let query = format!(
            "SELECT DISTINCT storage_ref FROM mail_attachments WHERE storage_ref IN ({})",
            placeholders(refs.len())
        );
        let mut q = sqlx::query_as::<_, (String,)>(&query);
        for storage_ref in &refs {
            q = q.bind(storage_ref);
        }
        let survivors: HashSet<String> = q
            .fetch_all(self.db.pool())
            .await?
            .into_iter()
            .map(|r| r.0)
            .collect();
        Ok(refs
            .into_iter()
            .filter(|r| !survivors.contains(r))
            .collect())
    }

    pub async fn create_label(
        &self,
        account_id: i64,
        name: &str,
        color: Option<String>,
    ) -> Result<Label> {
        if name.trim().is_empty() {
            return Err(MailError::Validation("label name must not be empty".to_string()));
        }
        let result = sqlx::query("INSERT INTO mail_labels (account_id, name, color) VALUES (?, ?, ?)")
            .bind(account_id)
            .bind(name.trim())
            .bind(&color)
            .execute(self.db.pool())
            .await?;
        Ok(Label {
            id: result.last_insert_rowid(),
            account_id,
            name: name.trim().to_string(),
            color,
        })
    }

    pub async fn list_labels(&self, account_id: i64) -> Result<Vec<Label>> {
        let rows = sqlx::query_as::<_, (i64, i64, String, Option<String>)>(
            "SELECT id, account_id, name, color FROM mail_labels WHERE account_id = ? ORDER BY name",
        )
        .bind(account_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, account_id, name, color)| Label {
                id,
                account_id,
                name,
                color,
            })
            .collect())
    }

    pub async fn delete_label(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM mail_labels WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(MailError::NotFound(format!("label {id}")));
        }
        Ok(())
    }

    /// Re-reads the join row inside the transaction before toggling, so a
    /// rapid double invocation nets out instead of racing. Returns whether
    /// the label is attached afterwards.
    pub async fn toggle_label(&self, message_id: i64, label_id: i64) -> Result<bool> {
        let located = self.locate(&[message_id]).await?;
        let (_, account_id, folder_id) = located
            .first()
            .copied()
            .ok_or_else(|| MailError::NotFound(format!("message {message_id}")))?;

        let mut tx = self.db.pool().begin().await?;
        let existing = sqlx::query_as::<_, (i64,)>(
            "SELECT 1 FROM mail_message_labels WHERE message_id = ? AND label_id = ?",
        )
        .bind(message_id)
        .bind(label_id)
        .fetch_optional(&mut *tx)
        .await?;
        let attached = if existing.is_some() {
            sqlx::query("DELETE FROM mail_message_labels WHERE message_id = ? AND label_id = ?")
                .bind(message_id)
                .bind(label_id)
                .execute(&mut *tx)
                .await?;
            false
        } else {
            sqlx::query(
                "INSERT OR IGNORE INTO mail_message_labels (message_id, label_id) VALUES (?, ?)",
            )
            .bind(message_id)
            .bind(label_id)
            .execute(&mut *tx)
            .await?;
            true
        };
        tx.commit().await?;
        self.publish_updates(&[(message_id, account_id, folder_id)]);
        Ok(attached)
    }

    /// Case-insensitive substring match over subject, body text and sender,
    /// composable with folder/read/starred/date filters. Bounded result set,
    /// newest first.
    pub async fn search(
        &self,
        account_id: i64,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<MessageWithMeta>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM mail_messages
             WHERE account_id = ? AND deleted_at IS NULL"
        );
        let pattern = like_pattern(query);
        if pattern.is_some() {
            sql.push_str(
                " AND (LOWER(subject) LIKE ? ESCAPE '\\'
                   OR LOWER(body_text) LIKE ? ESCAPE '\\'
                   OR LOWER(from_address) LIKE ? ESCAPE '\\')",
            );
        }
        if filters.folder_id.is_some() {
            sql.push_str(" AND folder_id = ?");
        }
        if filters.is_read.is_some() {
            sql.push_str(" AND is_read = ?");
        }
        if filters.is_starred.is_some() {
            sql.push_str(" AND is_starred = ?");
        }
        if filters.received_after.is_some() {
            sql.push_str(" AND received_at >= ?");
        }
        if filters.received_before.is_some() {
            sql.push_str(" AND received_at <= ?");
        }
        sql.push_str(" ORDER BY received_at DESC, id DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, MessageRow>(&sql).bind(account_id);
        if let Some(pattern) = &pattern {
            q = q.bind(pattern).bind(pattern).bind(pattern);
        }
        if let Some(folder_id) = filters.folder_id {
            q = q.bind(folder_id);
        }
        if let Some(is_read) = filters.is_read {
            q = q.bind(is_read);
        }
        if let Some(is_starred) = filters.is_starred {
            q = q.bind(is_starred);
        }
        if let Some(after) = filters.received_after {
            q = q.bind(after);
        }
        if let Some(before) = filters.received_before {
            q = q.bind(before);
        }
        q = q.bind(SEARCH_LIMIT as i64);

        let rows = q.fetch_all(self.db.pool()).await?;
        let messages: Vec<Message> = rows.into_iter().map(MessageRow::into_message).collect();
        self.attach_meta(messages).await
    }

    async fn attach_meta(&self, messages: Vec<Message>) -> Result<Vec<MessageWithMeta>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        let marks = placeholders(ids.len());

        let attachments_query = format!(
            "SELECT id, message_id, filename, mime_type, file_size, storage_ref
             FROM mail_attachments WHERE message_id IN ({marks}) ORDER BY id"
        );
        let mut aq = sqlx::query_as::<_, (i64, i64, String, String, i64, String)>(&attachments_query);
        for id in &ids {
            aq = aq.bind(id);
        }
        let mut attachments_by_message: HashMap<i64, Vec<AttachmentMeta>> = HashMap::new();
        for (id, message_id, filename, mime_type, file_size, storage_ref) in
            aq.fetch_all(self.db.pool()).await?
        {
            attachments_by_message
                .entry(message_id)
                .or_default()
                .push(AttachmentMeta {
                    id,
                    message_id,
                    filename,
                    mime_type,
                    file_size,
                    storage_ref,
                });
        }

        let labels_query = format!(
            "SELECT ml.message_id, l.id, l.account_id, l.name, l.color
             FROM mail_message_labels ml
             JOIN mail_labels l ON l.id = ml.label_id
             WHERE ml.message_id IN ({marks}) ORDER BY l.name"
        );
        let mut lq = sqlx::query_as::<_, (i64, i64, i64, String, Option<String>)>(&labels_query);
        for id in &ids {
            lq = lq.bind(id);
        }
        let mut labels_by_message: HashMap<i64, Vec<Label>> = HashMap::new();
        for (message_id, id, account_id, name, color) in lq.fetch_all(self.db.pool()).await? {
            labels_by_message.entry(message_id).or_default().push(Label {
                id,
                account_id,
                name,
                color,
            });
        }

        Ok(messages
            .into_iter()
            .map(|message| {
                let attachments = attachments_by_message.remove(&message.id).unwrap_or_default();
                let labels = labels_by_message.remove(&message.id).unwrap_or_default();
                MessageWithMeta {
                    message,
                    attachments,
                    labels,
                }
            })
            .collect())
    }

    async fn locate(&self, ids: &[i64]) -> Result<Vec<(i64, i64, i64)>> {
        let query = format!(
            "SELECT id, account_id, folder_id FROM mail_messages WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query_as::<_, (i64, i64, i64)>(&query);
        for id in ids {
            q = q.bind(id);
        }
        let located = q.fetch_all(self.db.pool()).await?;
        if located.len() != ids.len() {
            return Err(MailError::NotFound("one or more messages do not exist".to_string()));
        }
        Ok(located)
    }

    async fn folder_account(&self, folder_id: i64) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT account_id FROM mail_folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| MailError::NotFound(format!("folder {folder_id}")))?;
        Ok(row.0)
    }

    fn publish_updates(&self, located: &[(i64, i64, i64)]) {
        for (id, account_id, folder_id) in located {
            self.db.feed().publish(ChangeEvent {
                account_id: *account_id,
                entity: EntityKind::Message,
                kind: ChangeKind::Update,
                record_id: *id,
                folder_id: Some(*folder_id),
            });
        }
    }
}

async fn insert_attachment_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    message_id: i64,
    attachments: &[NewAttachment],
) -> Result<()> {
    for attachment in attachments {
        sqlx::query(
            "INSERT INTO mail_attachments (message_id, filename, mime_type, file_size, storage_ref)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(&attachment.filename)
        .bind(&attachment.mime_type)
        .bind(attachment.file_size)
        .bind(&attachment.storage_ref)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Lowercased `%...%` pattern with LIKE metacharacters escaped; `None` for a
/// blank query (filters-only search).
fn like_pattern(query: &str) -> Option<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut escaped = String::with_capacity(trimmed.len() + 2);
    escaped.push('%');
    for ch in trimmed.to_lowercase().chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    Some(escaped)
}
