//! Send pipeline. Takes a saved draft through validation, delivery and
//! bookkeeping: internal-to-internal mail is delivered by writing straight
//! into the recipients' inboxes, everything else goes over SMTP. On success
//! the draft row is replaced by a copy in the sender's Sent folder; on
//! transport failure the draft is left exactly as it was.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use maildeck_core::{
    Account, AccountKind, AccountStore, FolderKind, FolderStore, MailError, MailTransport,
    MessageStore, MessageWithMeta, NewAttachment, NewMessage, OutboundAttachment, Result,
    SendMailRequest, now_ts,
};

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub sent_message_id: i64,
    pub via_transport: bool,
}

pub struct SendPipeline {
    accounts: AccountStore,
    folders: FolderStore,
    messages: MessageStore,
    transport: Arc<dyn MailTransport>,
}

impl SendPipeline {
    pub fn new(
        accounts: AccountStore,
        folders: FolderStore,
        messages: MessageStore,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            accounts,
            folders,
            messages,
            transport,
        }
    }

    pub async fn send_draft(&self, draft_id: i64) -> Result<SendOutcome> {
        let draft = self.messages.get_message(draft_id).await?;
        if !draft.message.is_draft {
            return Err(MailError::Validation(format!(
                "message {draft_id} is not a draft"
            )));
        }
        if draft.message.to_addresses.is_empty() {
            return Err(MailError::Validation(
                "at least one recipient is required".to_string(),
            ));
        }
        let account = self.accounts.get_account(draft.message.account_id).await?;

        let via_transport = match self.internal_recipients(&account, &draft).await? {
            Some(recipients) => {
                self.deliver_internally(&account, &draft, &recipients).await?;
                false
            }
            None => {
                let request = build_request(&account, &draft);
                let reply = self.transport.send_mail(&account, &request).await?;
                if !reply.success {
                    warn!(draft_id, reason = %reply.message, "smtp delivery failed");
                    return Err(MailError::Transport(reply.message));
                }
                true
            }
        };

        // The draft becomes a Sent copy; the attachment blobs are shared, so
        // the refs returned by the purge are not removed.
        let sent = self
            .folders
            .folder_by_kind(account.id, FolderKind::Sent)
            .await?;
        let sent_message_id = self
            .messages
            .insert_message(sent_copy(&account, &draft, sent.id))
            .await?;
        let _ = self.messages.purge(&[draft_id]).await?;
        self.folders.recalculate_counts(account.id).await?;
        info!(draft_id, sent_message_id, via_transport, "draft sent");
        Ok(SendOutcome {
            sent_message_id,
            via_transport,
        })
    }

    /// `Some(accounts)` when the sender is internal and every recipient
    /// resolves to an internal account, `None` otherwise.
    async fn internal_recipients(
        &self,
        account: &Account,
        draft: &MessageWithMeta,
    ) -> Result<Option<Vec<Account>>> {
        if !matches!(account.kind, AccountKind::Internal) {
            return Ok(None);
        }
        let all = draft
            .message
            .to_addresses
            .iter()
            .chain(&draft.message.cc_addresses)
            .chain(&draft.message.bcc_addresses);
        let mut recipients = Vec::new();
        for address in all {
            match self.accounts.find_internal_by_address(address).await? {
                Some(recipient) => recipients.push(recipient),
                None => return Ok(None),
            }
        }
        Ok(Some(recipients))
    }

    async fn deliver_internally(
        &self,
        sender: &Account,
        draft: &MessageWithMeta,
        recipients: &[Account],
    ) -> Result<()> {
        let mut touched: HashSet<i64> = HashSet::new();
        for recipient in recipients {
            if !touched.insert(recipient.id) {
                continue;
            }
            let inbox = self
                .folders
                .folder_by_kind(recipient.id, FolderKind::Inbox)
                .await?;
            self.messages
                .insert_message(NewMessage {
                    account_id: recipient.id,
                    folder_id: inbox.id,
                    message_key: None,
                    thread_key: draft.message.thread_key.clone(),
                    in_reply_to: draft.message.in_reply_to.clone(),
                    from_address: sender.address().to_string(),
                    from_name: None,
                    to_addresses: draft.message.to_addresses.clone(),
                    cc_addresses: draft.message.cc_addresses.clone(),
                    bcc_addresses: Vec::new(),
                    subject: draft.message.subject.clone(),
                    body_html: draft.message.body_html.clone(),
                    body_text: draft.message.body_text.clone(),
                    is_read: false,
                    is_draft: false,
                    received_at: now_ts(),
                    attachments: shared_attachments(draft),
                })
                .await?;
            self.folders.recalculate_counts(recipient.id).await?;
        }
        Ok(())
    }
}

fn build_request(account: &Account, draft: &MessageWithMeta) -> SendMailRequest {
    SendMailRequest {
        from: account.address().to_string(),
        to: draft.message.to_addresses.clone(),
        cc: draft.message.cc_addresses.clone(),
        bcc: draft.message.bcc_addresses.clone(),
        subject: draft.message.subject.clone(),
        body_html: draft.message.body_html.clone(),
        body_text: draft.message.body_text.clone(),
        in_reply_to: draft.message.in_reply_to.clone(),
        thread_key: draft.message.thread_key.clone(),
        attachments: draft
            .attachments
            .iter()
            .map(|a| OutboundAttachment {
                id: a.id,
                filename: a.filename.clone(),
                mime_type: a.mime_type.clone(),
                storage_ref: a.storage_ref.clone(),
            })
            .collect(),
    }
}

fn sent_copy(account: &Account, draft: &MessageWithMeta, sent_folder_id: i64) -> NewMessage {
    NewMessage {
        account_id: account.id,
        folder_id: sent_folder_id,
        message_key: None,
        thread_key: draft.message.thread_key.clone(),
        in_reply_to: draft.message.in_reply_to.clone(),
        from_address: account.address().to_string(),
        from_name: None,
        to_addresses: draft.message.to_addresses.clone(),
        cc_addresses: draft.message.cc_addresses.clone(),
        bcc_addresses: draft.message.bcc_addresses.clone(),
        subject: draft.message.subject.clone(),
        body_html: draft.message.body_html.clone(),
        body_text: draft.message.body_text.clone(),
        is_read: true,
        is_draft: false,
        received_at: now_ts(),
        attachments: shared_attachments(draft),
    }
}

fn shared_attachments(draft: &MessageWithMeta) -> Vec<NewAttachment> {
    draft
        .attachments
        .iter()
        .map(|a| NewAttachment {
            filename: a.filename.clone(),
            mime_type: a.mime_type.clone(),
            file_size: a.file_size,
            storage_ref: a.storage_ref.clone(),
        })
        .collect()
}
