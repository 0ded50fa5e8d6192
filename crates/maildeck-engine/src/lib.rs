//! Session-level mail engine: draft composition, realtime refresh signals
//! and the orchestrator façade that ties accounts, folders, messages, sync
//! and send together for one signed-in user.

pub mod compose;
pub mod notify;
pub mod session;

pub use compose::{ComposeMode, DraftComposer};
pub use notify::{RealtimeNotifier, UiSignal, ViewContext, signals_for};
pub use session::{MailOrchestrator, MailSession};
