//! The orchestrator façade. One `MailOrchestrator` per signed-in user wires
//! the stores, sync engine, send pipeline, composer and notifier together
//! and tracks the explicit UI session: which account, folder and message
//! are active. Callers go through here instead of touching stores directly.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use maildeck_core::{
    Account, AccountStore, BlobStore, Folder, FolderKind, FolderStore, MailDb, MailError,
    MailTransport, MessagePage, MessageStore, MessageWithMeta, NewExternalAccount, Result,
    SearchFilters, TransportReply, UpdateAccount,
};
use maildeck_mail::{ImapSource, SendOutcome, SendPipeline, SyncEngine, SyncReport};

use crate::compose::DraftComposer;
use crate::notify::{RealtimeNotifier, UiSignal, ViewContext};

/// Current UI selection. Selecting an account clears the folder and message
/// below it; selecting a folder clears the open message.
#[derive(Debug, Clone, Default)]
pub struct MailSession {
    pub owner: String,
    pub active_account: Option<Account>,
    pub active_folder: Option<Folder>,
    pub open_message_id: Option<i64>,
    pub page: u32,
}

pub struct MailOrchestrator {
    accounts: AccountStore,
    folders: FolderStore,
    messages: MessageStore,
    blobs: Arc<dyn BlobStore>,
    sync: SyncEngine,
    pipeline: SendPipeline,
    composer: DraftComposer,
    notifier: RealtimeNotifier,
    session: MailSession,
    send_in_flight: bool,
}

impl MailOrchestrator {
    pub fn new(
        db: MailDb,
        transport: Arc<dyn MailTransport>,
        source: Arc<dyn ImapSource>,
        blobs: Arc<dyn BlobStore>,
        owner: &str,
    ) -> (Self, mpsc::Receiver<UiSignal>) {
        let accounts = AccountStore::new(db.clone(), transport.clone());
        let folders = FolderStore::new(db.clone());
        let messages = MessageStore::new(db.clone());
        let sync = SyncEngine::new(
            accounts.clone(),
            folders.clone(),
            messages.clone(),
            transport.clone(),
            source,
            blobs.clone(),
        );
        let pipeline = SendPipeline::new(
            accounts.clone(),
            folders.clone(),
            messages.clone(),
            transport,
        );
        let composer = DraftComposer::new(
            accounts.clone(),
            folders.clone(),
            messages.clone(),
            blobs.clone(),
        );
        let (notifier, signals) = RealtimeNotifier::start(db.feed());
        let orchestrator = Self {
            accounts,
            folders,
            messages,
            blobs,
            sync,
            pipeline,
            composer,
            notifier,
            session: MailSession {
                owner: owner.to_string(),
                ..MailSession::default()
            },
            send_in_flight: false,
        };
        (orchestrator, signals)
    }

    pub fn session(&self) -> &MailSession {
        &self.session
    }

    pub fn composer_mut(&mut self) -> &mut DraftComposer {
        &mut self.composer
    }

    // Account management.

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.accounts.list_accounts(&self.session.owner).await
    }

    pub async fn ensure_internal_account(&self) -> Result<Account> {
        self.accounts.create_internal(&self.session.owner).await
    }

    pub async fn add_external_account(&self, params: NewExternalAccount) -> Result<Account> {
        self.accounts
            .create_external(&self.session.owner, params)
            .await
    }

    pub async fn update_account(&self, id: i64, patch: UpdateAccount) -> Result<Account> {
        self.owned_account(id).await?;
        self.accounts.update_account(id, patch).await
    }

    pub async fn remove_account(&mut self, id: i64) -> Result<()> {
        self.owned_account(id).await?;
        if self.session.active_account.as_ref().map(|a| a.id) == Some(id) {
            self.clear_selection();
        }
        self.accounts.delete_account(id).await
    }

    pub async fn set_default_account(&self, id: i64) -> Result<()> {
        self.accounts.set_default(&self.session.owner, id).await
    }

    pub async fn test_account_connection(&self, id: i64) -> Result<TransportReply> {
        self.owned_account(id).await?;
        self.accounts.test_connection(id).await
    }

    // Navigation.

    pub async fn select_account(&mut self, id: i64) -> Result<Vec<Folder>> {
        let account = self.owned_account(id).await?;
        info!(account_id = id, "account selected");
        self.session.active_account = Some(account);
        self.session.active_folder = None;
        self.session.open_message_id = None;
        self.session.page = 0;
        self.sync_view();
        self.folders.list_folders(id).await
    }

    pub async fn select_folder(&mut self, folder_id: i64) -> Result<MessagePage> {
        let account = self.active_account()?;
        let folder = self.folders.get_folder(folder_id).await?;
        if folder.account_id != account.id {
            return Err(MailError::Validation(
                "folder belongs to another account".to_string(),
            ));
        }
        self.session.active_folder = Some(folder);
        self.session.open_message_id = None;
        self.session.page = 0;
        self.sync_view();
        self.current_page().await
    }

    pub async fn load_page(&mut self, page: u32) -> Result<MessagePage> {
        self.session.page = page;
        self.current_page().await
    }

    async fn current_page(&self) -> Result<MessagePage> {
        let account = self.active_account()?;
        let folder = self.active_folder()?;
        self.messages
            .list_messages(account.id, folder.id, self.session.page)
            .await
    }

    /// Opens a message for reading; it is marked read as a side effect and
    /// the folder counts catch up immediately.
    pub async fn open_message(&mut self, message_id: i64) -> Result<MessageWithMeta> {
        let account = self.active_account()?.clone();
        let message = self.messages.get_message(message_id).await?;
        if message.message.account_id != account.id {
            return Err(MailError::Forbidden(
                "message belongs to another account".to_string(),
            ));
        }
        if !message.message.is_read {
            self.messages.mark_read(&[message_id], true).await?;
            self.folders.recalculate_counts(account.id).await?;
        }
        self.session.open_message_id = Some(message_id);
        self.sync_view();
        self.messages.get_message(message_id).await
    }

    // Message actions on the active account.

    pub async fn mark_read(&self, ids: &[i64], is_read: bool) -> Result<()> {
        let account = self.active_account()?;
        self.messages.mark_read(ids, is_read).await?;
        self.folders.recalculate_counts(account.id).await
    }

    pub async fn toggle_star(&self, message_id: i64) -> Result<bool> {
        self.messages.toggle_star(message_id).await
    }

    pub async fn move_messages(&self, ids: &[i64], target_folder_id: i64) -> Result<()> {
        let account = self.active_account()?;
        self.messages.move_to_folder(ids, target_folder_id).await?;
        self.folders.recalculate_counts(account.id).await
    }

    /// Deleting from Trash soft-deletes; deleting anywhere else moves the
    /// messages to Trash.
    pub async fn delete_messages(&mut self, ids: &[i64]) -> Result<()> {
        let account = self.active_account()?.clone();
        let trash = self
            .folders
            .folder_by_kind(account.id, FolderKind::Trash)
            .await?;
        let in_trash = self
            .session
            .active_folder
            .as_ref()
            .is_some_and(|f| f.id == trash.id);
        if in_trash {
            self.messages.soft_delete(ids).await?;
        } else {
            self.messages.move_to_folder(ids, trash.id).await?;
        }
        if self.session.open_message_id.is_some_and(|id| ids.contains(&id)) {
            self.session.open_message_id = None;
            self.sync_view();
        }
        self.folders.recalculate_counts(account.id).await
    }

    /// Hard delete; orphaned attachment blobs are removed as well.
    pub async fn purge_messages(&mut self, ids: &[i64]) -> Result<()> {
        let account = self.active_account()?.clone();
        let storage_refs = self.messages.purge(ids).await?;
        for storage_ref in storage_refs {
            self.blobs.remove(&storage_ref).await?;
        }
        if self.session.open_message_id.is_some_and(|id| ids.contains(&id)) {
            self.session.open_message_id = None;
            self.sync_view();
        }
        self.folders.recalculate_counts(account.id).await
    }

    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<MessageWithMeta>> {
        let account = self.active_account()?;
        self.messages.search(account.id, query, filters).await
    }

    // Composing and sending.

    pub async fn start_compose(&mut self) -> Result<()> {
        let account_id = self.active_account()?.id;
        self.composer.open_blank(account_id).await
    }

    pub async fn close_compose(&mut self) -> Result<Option<i64>> {
        self.composer.close().await
    }

    /// Saves the active compose session and hands the draft to the send
    /// pipeline. At most one send is in flight per session; the compose
    /// session ends only when the send succeeds.
    pub async fn send_active_draft(&mut self) -> Result<SendOutcome> {
        if self.send_in_flight {
            return Err(MailError::Conflict("a send is already in flight".to_string()));
        }
        if !self.composer.is_open() {
            return Err(MailError::Conflict("no compose session is open".to_string()));
        }
        self.send_in_flight = true;
        let result = self.send_saved_draft().await;
        self.send_in_flight = false;
        result
    }

    async fn send_saved_draft(&mut self) -> Result<SendOutcome> {
        let draft_id = self.composer.save_draft().await?;
        let outcome = self.pipeline.send_draft(draft_id).await?;
        // The draft row is gone; drop the session without another save.
        self.composer.discard().await?;
        Ok(outcome)
    }

    // Sync.

    pub async fn sync_active_account(&self) -> Result<SyncReport> {
        let account = self.active_account()?;
        self.sync.sync_account(account.id).await
    }

    fn clear_selection(&mut self) {
        self.session.active_account = None;
        self.session.active_folder = None;
        self.session.open_message_id = None;
        self.session.page = 0;
        self.sync_view();
    }

    fn sync_view(&self) {
        self.notifier.set_view(ViewContext {
            account_id: self.session.active_account.as_ref().map(|a| a.id),
            folder_id: self.session.active_folder.as_ref().map(|f| f.id),
            open_message_id: self.session.open_message_id,
        });
    }

    fn active_account(&self) -> Result<&Account> {
        self.session
            .active_account
            .as_ref()
            .ok_or_else(|| MailError::Validation("no account selected".to_string()))
    }

    fn active_folder(&self) -> Result<&Folder> {
        self.session
            .active_folder
            .as_ref()
            .ok_or_else(|| MailError::Validation("no folder selected".to_string()))
    }

    async fn owned_account(&self, id: i64) -> Result<Account> {
        let account = self.accounts.get_account(id).await?;
        if account.owner_identity != self.session.owner {
            return Err(MailError::Forbidden(format!(
                "account {id} belongs to another user"
            )));
        }
        Ok(account)
    }
}
