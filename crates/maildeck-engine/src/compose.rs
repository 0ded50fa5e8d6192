//! Draft composer. Holds the single active compose session: a blank message,
//! a reply, a reply-all or a forward. Saving upserts one draft row and keeps
//! its id, so repeated autosaves never multiply drafts.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tracing::debug;

use maildeck_core::{
    AccountStore, BlobStore, FolderKind, FolderStore, MailError, MessageStore, MessageWithMeta,
    NewAttachment, NewMessage, Result, now_ts,
};

const BODY_TEXT_WIDTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeMode {
    Reply,
    ReplyAll,
    Forward,
}

#[derive(Debug, Clone)]
struct StagedAttachment {
    filename: String,
    mime_type: String,
    file_size: i64,
    storage_ref: String,
    uploaded_this_session: bool,
}

#[derive(Debug, Clone)]
struct ComposeState {
    account_id: i64,
    saved_message_id: Option<i64>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: String,
    body_html: String,
    body_touched: bool,
    thread_key: Option<String>,
    in_reply_to: Option<String>,
    attachments: Vec<StagedAttachment>,
}

pub struct DraftComposer {
    accounts: AccountStore,
    folders: FolderStore,
    messages: MessageStore,
    blobs: Arc<dyn BlobStore>,
    state: Option<ComposeState>,
}

impl DraftComposer {
    pub fn new(
        accounts: AccountStore,
        folders: FolderStore,
        messages: MessageStore,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            accounts,
            folders,
            messages,
            blobs,
            state: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Id of the draft row backing this session, once it has been saved.
    pub fn draft_id(&self) -> Option<i64> {
        self.state.as_ref().and_then(|s| s.saved_message_id)
    }

    pub async fn open_blank(&mut self, account_id: i64) -> Result<()> {
        self.ensure_closed()?;
        let account = self.accounts.get_account(account_id).await?;
        let body_html = account
            .signature_html
            .as_deref()
            .map(|sig| format!("<p></p>{sig}"))
            .unwrap_or_default();
        self.state = Some(ComposeState {
            account_id,
            saved_message_id: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            body_html,
            body_touched: false,
            thread_key: None,
            in_reply_to: None,
            attachments: Vec::new(),
        });
        Ok(())
    }

    /// Opens a session prefilled from an existing message. Reply modes
    /// thread onto the original; forwards start a fresh thread but carry the
    /// original's attachments.
    pub async fn open_from_message(&mut self, message_id: i64, mode: ComposeMode) -> Result<()> {
        self.ensure_closed()?;
        let original = self.messages.get_message(message_id).await?;
        let account = self.accounts.get_account(original.message.account_id).await?;
        let own_address = account.address().to_string();

        let (to, cc) = match mode {
            ComposeMode::Reply => (vec![original.message.from_address.clone()], Vec::new()),
            ComposeMode::ReplyAll => {
                let mut to = vec![original.message.from_address.clone()];
                to.extend(
                    original
                        .message
                        .to_addresses
                        .iter()
                        .filter(|a| **a != own_address && **a != original.message.from_address)
                        .cloned(),
                );
                let cc = original
                    .message
                    .cc_addresses
                    .iter()
                    .filter(|a| **a != own_address)
                    .cloned()
                    .collect();
                (to, cc)
            }
            ComposeMode::Forward => (Vec::new(), Vec::new()),
        };

        let subject = match mode {
            ComposeMode::Reply | ComposeMode::ReplyAll => {
                prefixed_subject("Re: ", &original.message.subject)
            }
            ComposeMode::Forward => prefixed_subject("Fwd: ", &original.message.subject),
        };
        // A reply joins the original's thread, falling back to the original's
        // own key when it started the thread. in_reply_to always names the
        // message being answered.
        let (thread_key, in_reply_to) = match mode {
            ComposeMode::Reply | ComposeMode::ReplyAll => (
                original
                    .message
                    .thread_key
                    .clone()
                    .or_else(|| original.message.message_key.clone()),
                original.message.message_key.clone(),
            ),
            ComposeMode::Forward => (None, None),
        };
        let attachments = match mode {
            ComposeMode::Forward => original
                .attachments
                .iter()
                .map(|a| StagedAttachment {
                    filename: a.filename.clone(),
                    mime_type: a.mime_type.clone(),
                    file_size: a.file_size,
                    storage_ref: a.storage_ref.clone(),
                    uploaded_this_session: false,
                })
                .collect(),
            _ => Vec::new(),
        };

        self.state = Some(ComposeState {
            account_id: account.id,
            saved_message_id: None,
            to,
            cc,
            bcc: Vec::new(),
            subject,
            body_html: quoted_body(&original),
            body_touched: false,
            thread_key,
            in_reply_to,
            attachments,
        });
        Ok(())
    }

    pub fn set_recipients(
        &mut self,
        to: Vec<String>,
        cc: Vec<String>,
        bcc: Vec<String>,
    ) -> Result<()> {
        let state = self.open_state_mut()?;
        state.to = to;
        state.cc = cc;
        state.bcc = bcc;
        Ok(())
    }

    pub fn set_subject(&mut self, subject: &str) -> Result<()> {
        self.open_state_mut()?.subject = subject.to_string();
        Ok(())
    }

    pub fn set_body_html(&mut self, body_html: &str) -> Result<()> {
        let state = self.open_state_mut()?;
        state.body_html = body_html.to_string();
        state.body_touched = true;
        Ok(())
    }

    pub async fn upload_attachment(&mut self, filename: &str, bytes: &[u8]) -> Result<()> {
        let account_id = self.open_state_mut()?.account_id;
        let mime_type = mime_guess::from_path(filename)
            .first_or_octet_stream()
            .to_string();
        let path = format!("mail/{account_id}/drafts/{}-{filename}", now_ts());
        let storage_ref = self.blobs.upload(&path, bytes).await?;
        self.open_state_mut()?.attachments.push(StagedAttachment {
            filename: filename.to_string(),
            mime_type,
            file_size: bytes.len() as i64,
            storage_ref,
            uploaded_this_session: true,
        });
        Ok(())
    }

    /// Blobs uploaded during this session are removed with the staging
    /// entry; carried-over blobs stay, their original message still points
    /// at them.
    pub async fn remove_attachment(&mut self, storage_ref: &str) -> Result<()> {
        let state = self.open_state_mut()?;
        let index = state
            .attachments
            .iter()
            .position(|a| a.storage_ref == storage_ref)
            .ok_or_else(|| MailError::NotFound(format!("attachment {storage_ref}")))?;
        let staged = state.attachments.remove(index);
        if staged.uploaded_this_session {
            self.blobs.remove(&staged.storage_ref).await?;
        }
        Ok(())
    }

    /// Writes the session to the Drafts folder. The first save inserts, later
    /// saves rewrite the same row.
    pub async fn save_draft(&mut self) -> Result<i64> {
        let state = self
            .state
            .clone()
            .ok_or_else(|| MailError::Conflict("no compose session is open".to_string()))?;
        let account = self.accounts.get_account(state.account_id).await?;
        let drafts = self
            .folders
            .folder_by_kind(state.account_id, FolderKind::Drafts)
            .await?;
        let body_text = html2text::from_read(state.body_html.as_bytes(), BODY_TEXT_WIDTH);
        let draft = NewMessage {
            account_id: state.account_id,
            folder_id: drafts.id,
            message_key: None,
            thread_key: state.thread_key.clone(),
            in_reply_to: state.in_reply_to.clone(),
            from_address: account.address().to_string(),
            from_name: None,
            to_addresses: state.to.clone(),
            cc_addresses: state.cc.clone(),
            bcc_addresses: state.bcc.clone(),
            subject: state.subject.clone(),
            body_html: state.body_html.clone(),
            body_text,
            is_read: true,
            is_draft: true,
            received_at: now_ts(),
            attachments: state
                .attachments
                .iter()
                .map(|a| NewAttachment {
                    filename: a.filename.clone(),
                    mime_type: a.mime_type.clone(),
                    file_size: a.file_size,
                    storage_ref: a.storage_ref.clone(),
                })
                .collect(),
        };

        let id = match state.saved_message_id {
            Some(id) => {
                self.messages.update_draft(id, &draft).await?;
                id
            }
            None => self.messages.insert_message(draft).await?,
        };
        if let Some(state) = self.state.as_mut() {
            state.saved_message_id = Some(id);
        }
        self.folders.recalculate_counts(account.id).await?;
        debug!(draft_id = id, "draft saved");
        Ok(id)
    }

    /// Saves and ends the session. An untouched session (no recipients, no
    /// subject, no body, never saved) is dropped without creating a row.
    pub async fn close(&mut self) -> Result<Option<i64>> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        let untouched = state.saved_message_id.is_none()
            && state.to.is_empty()
            && state.cc.is_empty()
            && state.bcc.is_empty()
            && state.subject.is_empty()
            && !state.body_touched
            && state.attachments.is_empty();
        if untouched {
            self.state = None;
            return Ok(None);
        }
        let id = self.save_draft().await?;
        self.state = None;
        Ok(Some(id))
    }

    /// Ends the session without saving. Blobs uploaded this session that no
    /// saved draft references yet are removed.
    pub async fn discard(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };
        if state.saved_message_id.is_none() {
            for staged in &state.attachments {
                if staged.uploaded_this_session {
                    self.blobs.remove(&staged.storage_ref).await?;
                }
            }
        }
        Ok(())
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.state.is_some() {
            return Err(MailError::Conflict(
                "a compose session is already open".to_string(),
            ));
        }
        Ok(())
    }

    fn open_state_mut(&mut self) -> Result<&mut ComposeState> {
        self.state
            .as_mut()
            .ok_or_else(|| MailError::Conflict("no compose session is open".to_string()))
    }
}

/// Prepends the prefix unless the subject already carries it, so replying to
/// a reply never yields `Re: Re: ...`.
fn prefixed_subject(prefix: &str, original: &str) -> String {
    let trimmed = original.trim();
    let already = trimmed
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
    if already {
        trimmed.to_string()
    } else {
        format!("{prefix}{trimmed}")
    }
}

fn quoted_body(original: &MessageWithMeta) -> String {
    let when = Utc
        .timestamp_opt(original.message.received_at, 0)
        .single()
        .map(|dt| dt.format("%a, %d %b %Y %H:%M").to_string())
        .unwrap_or_default();
    let attribution = html_escape::encode_text(&format!(
        "On {when}, {} wrote:",
        original.message.from_address
    ))
    .to_string();
    let quoted = if original.message.body_html.is_empty() {
        format!(
            "<pre>{}</pre>",
            html_escape::encode_text(&original.message.body_text)
        )
    } else {
        original.message.body_html.clone()
    };
    format!("<p></p><p>{attribution}</p><blockquote>{quoted}</blockquote>")
}
