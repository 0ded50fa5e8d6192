//! Realtime change notification. Subscribes to the store's change feed and
//! turns events into coarse refresh signals for whatever the UI currently
//! shows. Events carry locators only, so every signal means "re-read from
//! the store", never "apply this patch".

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::debug;

use maildeck_core::{ChangeEvent, ChangeFeed, EntityKind};

const SIGNAL_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiSignal {
    RefreshFolders,
    RefreshMessageList,
    RefreshOpenMessage,
}

/// What the UI is currently looking at. The notifier only forwards signals
/// relevant to this view.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewContext {
    pub account_id: Option<i64>,
    pub folder_id: Option<i64>,
    pub open_message_id: Option<i64>,
}

#[derive(Clone)]
pub struct RealtimeNotifier {
    view: Arc<Mutex<ViewContext>>,
}

impl RealtimeNotifier {
    /// Spawns the listener task. Dropping the receiver stops it.
    pub fn start(feed: &ChangeFeed) -> (Self, mpsc::Receiver<UiSignal>) {
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        let view = Arc::new(Mutex::new(ViewContext::default()));
        let notifier = Self { view: view.clone() };

        let mut events = feed.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let current = view.lock().map(|v| *v).unwrap_or_default();
                        for signal in signals_for(&event, &current) {
                            if signal_tx.send(signal).await.is_err() {
                                return;
                            }
                        }
                    }
                    // Missed events: the store moved on without us, so
                    // everything on screen is suspect.
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "change feed lagged, forcing full refresh");
                        for signal in [
                            UiSignal::RefreshFolders,
                            UiSignal::RefreshMessageList,
                            UiSignal::RefreshOpenMessage,
                        ] {
                            if signal_tx.send(signal).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });

        (notifier, signal_rx)
    }

    pub fn set_view(&self, context: ViewContext) {
        if let Ok(mut view) = self.view.lock() {
            *view = context;
        }
    }
}

/// Pure mapping from a change event to refresh signals for a view.
pub fn signals_for(event: &ChangeEvent, view: &ViewContext) -> Vec<UiSignal> {
    if view.account_id != Some(event.account_id) {
        return Vec::new();
    }
    match event.entity {
        EntityKind::Folder => vec![UiSignal::RefreshFolders],
        EntityKind::Message => {
            // Folder counts may shift on any message change.
            let mut signals = vec![UiSignal::RefreshFolders];
            if event.folder_id.is_some() && event.folder_id == view.folder_id {
                signals.push(UiSignal::RefreshMessageList);
            }
            if view.open_message_id == Some(event.record_id) {
                signals.push(UiSignal::RefreshOpenMessage);
            }
            signals
        }
    }
}

#[cfg(test)]
mod tests {
    use maildeck_core::{ChangeEvent, ChangeFeed, ChangeKind, EntityKind};

    use super::{RealtimeNotifier, UiSignal, ViewContext, signals_for};

    fn message_event(account_id: i64, record_id: i64, folder_id: i64) -> ChangeEvent {
        ChangeEvent {
            account_id,
            entity: EntityKind::Message,
            kind: ChangeKind::Update,
            record_id,
            folder_id: Some(folder_id),
        }
    }

    #[test]
    fn events_for_other_accounts_are_dropped() {
        let view = ViewContext {
            account_id: Some(1),
            folder_id: Some(10),
            open_message_id: None,
        };
        assert!(signals_for(&message_event(2, 5, 10), &view).is_empty());
    }

    #[test]
    fn message_in_viewed_folder_refreshes_list_and_folders() {
        let view = ViewContext {
            account_id: Some(1),
            folder_id: Some(10),
            open_message_id: None,
        };
        let signals = signals_for(&message_event(1, 5, 10), &view);
        assert_eq!(
            signals,
            vec![UiSignal::RefreshFolders, UiSignal::RefreshMessageList]
        );
    }

    #[test]
    fn message_in_another_folder_only_refreshes_folders() {
        let view = ViewContext {
            account_id: Some(1),
            folder_id: Some(10),
            open_message_id: None,
        };
        let signals = signals_for(&message_event(1, 5, 99), &view);
        assert_eq!(signals, vec![UiSignal::RefreshFolders]);
    }

    #[test]
    fn open_message_changes_refresh_the_reading_pane() {
        let view = ViewContext {
            account_id: Some(1),
            folder_id: Some(10),
            open_message_id: Some(5),
        };
        let signals = signals_for(&message_event(1, 5, 10), &view);
        assert!(signals.contains(&UiSignal::RefreshOpenMessage));
    }

    #[tokio::test]
    async fn notifier_forwards_signals_for_the_current_view() {
        let feed = ChangeFeed::new();
        let (notifier, mut signals) = RealtimeNotifier::start(&feed);
        notifier.set_view(ViewContext {
            account_id: Some(1),
            folder_id: Some(10),
            open_message_id: None,
        });

        feed.publish(message_event(1, 5, 10));
        assert_eq!(signals.recv().await, Some(UiSignal::RefreshFolders));
        assert_eq!(signals.recv().await, Some(UiSignal::RefreshMessageList));

        // Another account's event produces nothing; follow with a matching
        // folder event to prove the channel is still live.
        feed.publish(message_event(2, 6, 10));
        feed.publish(ChangeEvent {
            account_id: 1,
            entity: EntityKind::Folder,
            kind: ChangeKind::Update,
            record_id: 10,
            folder_id: None,
        });
        assert_eq!(signals.recv().await, Some(UiSignal::RefreshFolders));
    }
}
