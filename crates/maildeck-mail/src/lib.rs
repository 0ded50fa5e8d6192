//! Remote mail plumbing: the SMTP transport service, the blocking IMAP inbox
//! source, the one-way sync engine and the send pipeline.

pub mod send;
pub mod source;
pub mod sync;
pub mod transport;

pub use send::{SendOutcome, SendPipeline};
pub use source::{ImapSource, NativeImapSource, RemoteAttachment, RemoteMessage};
pub use sync::{INITIAL_SYNC_DAYS, SyncEngine, SyncPhase, SyncReport};
pub use transport::{RelayConfig, SmtpTransportService};
