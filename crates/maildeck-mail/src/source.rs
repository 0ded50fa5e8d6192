//! IMAP inbox source. The `imap` crate is blocking, so every fetch runs a
//! short-lived session on the blocking pool: connect, login, select INBOX,
//! search a recency window, fetch full bodies in chunks, logout.

use anyhow::{Result as WireResult, anyhow};
use chrono::{Datelike, Duration, Local};
use imap::{ClientBuilder, ConnectionMode};
use mailparse::{DispositionType, MailAddr, ParsedMail, addrparse};
use tracing::debug;

use maildeck_core::{ImapParams, MailError, Result, now_ts};

const FETCH_CHUNK_SIZE: usize = 50;
const FETCH_MAX_MESSAGES: usize = 50;

#[derive(Debug, Clone)]
pub struct RemoteAttachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A fully parsed inbox message as pulled off the wire. `message_key` is the
/// RFC 5322 Message-ID when the server provides one and a synthetic
/// `imap:{uidvalidity}:{uid}` key otherwise, so re-fetches stay idempotent
/// either way.
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub message_key: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub is_read: bool,
    pub received_at: i64,
    pub attachments: Vec<RemoteAttachment>,
}

#[async_trait::async_trait]
pub trait ImapSource: Send + Sync {
    async fn fetch_recent(
        &self,
        endpoint: &ImapParams,
        username: &str,
        password: &str,
        since_days: i64,
    ) -> Result<Vec<RemoteMessage>>;
}

pub struct NativeImapSource {
    skip_tls_verify: bool,
}

impl NativeImapSource {
    pub fn new() -> Self {
        Self {
            skip_tls_verify: false,
        }
    }

    /// Test rigs only.
    pub fn with_skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }
}

impl Default for NativeImapSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ImapSource for NativeImapSource {
    async fn fetch_recent(
        &self,
        endpoint: &ImapParams,
        username: &str,
        password: &str,
        since_days: i64,
    ) -> Result<Vec<RemoteMessage>> {
        let endpoint = endpoint.clone();
        let username = username.to_string();
        let password = password.to_string();
        let skip_tls_verify = self.skip_tls_verify;
        tokio::task::spawn_blocking(move || {
            fetch_blocking(&endpoint, &username, &password, since_days, skip_tls_verify)
        })
        .await
        .map_err(|e| MailError::Transport(format!("imap worker panicked: {e}")))?
        .map_err(|e| MailError::Transport(e.to_string()))
    }
}

fn fetch_blocking(
    endpoint: &ImapParams,
    username: &str,
    password: &str,
    since_days: i64,
    skip_tls_verify: bool,
) -> WireResult<Vec<RemoteMessage>> {
    debug!(host = %endpoint.host, port = endpoint.port, "imap connect");
    let client = ClientBuilder::new(endpoint.host.as_str(), endpoint.port)
        .tls_kind(imap::TlsKind::Native)
        .mode(if endpoint.secure {
            ConnectionMode::AutoTls
        } else {
            ConnectionMode::Plaintext
        })
        .danger_skip_tls_verify(skip_tls_verify)
        .connect()?;
    let mut session = client.login(username, password).map_err(|e| e.0)?;

    let mailbox = session.select("INBOX")?;
    let uid_validity = mailbox.uid_validity.unwrap_or(0);
    if mailbox.exists == 0 {
        let _ = session.logout();
        return Ok(Vec::new());
    }

    let query = format!("SINCE {}", imap_since_date(since_days));
    let uids = session.uid_search(&query)?;
    let uids_vec = recent_window(uids.into_iter().collect(), FETCH_MAX_MESSAGES);
    debug!(count = uids_vec.len(), "imap uid search");

    let mut messages = Vec::with_capacity(uids_vec.len());
    for chunk in uids_vec.chunks(FETCH_CHUNK_SIZE) {
        let uid_set = chunk
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session.uid_fetch(uid_set, "(UID FLAGS RFC822)")?;
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else { continue };
            let Some(raw) = fetch.body() else { continue };
            let is_read = fetch
                .flags()
                .iter()
                .any(|f| matches!(f, imap::types::Flag::Seen));
            match parse_remote_message(raw, uid_validity, uid, is_read) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    debug!(uid, error = %err, "skipping unparseable message");
                }
            }
        }
    }
    let _ = session.logout();
    Ok(messages)
}

/// Newest `max` UIDs, ascending. Keeps a busy inbox from turning one sync
/// pass into a full-body fetch of the entire window.
fn recent_window(mut uids: Vec<u32>, max: usize) -> Vec<u32> {
    uids.sort_unstable();
    if uids.len() > max {
        uids.drain(..uids.len() - max);
    }
    uids
}

fn parse_remote_message(
    raw: &[u8],
    uid_validity: u32,
    uid: u32,
    is_read: bool,
) -> WireResult<RemoteMessage> {
    let parsed = mailparse::parse_mail(raw)?;

    let message_key = header(&parsed, "Message-ID")
        .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("imap:{uid_validity}:{uid}"));
    let subject = header(&parsed, "Subject").unwrap_or_default();
    let received_at = header(&parsed, "Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .unwrap_or_else(now_ts);

    let (from_address, from_name) = header(&parsed, "From")
        .and_then(|raw| first_address(&raw))
        .ok_or_else(|| anyhow!("message has no From address"))?;
    let to_addresses = header(&parsed, "To")
        .map(|raw| address_list(&raw))
        .unwrap_or_default();
    let cc_addresses = header(&parsed, "Cc")
        .map(|raw| address_list(&raw))
        .unwrap_or_default();

    let mut bodies = BodyParts::default();
    collect_parts(&parsed, &mut bodies)?;

    Ok(RemoteMessage {
        message_key,
        from_address,
        from_name,
        to_addresses,
        cc_addresses,
        subject,
        body_html: bodies.html.unwrap_or_default(),
        body_text: bodies.text.unwrap_or_default(),
        is_read,
        received_at,
        attachments: bodies.attachments,
    })
}

#[derive(Default)]
struct BodyParts {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<RemoteAttachment>,
}

/// Depth-first over MIME parts: first text/plain and text/html become the
/// bodies, everything marked as an attachment is captured with its bytes.
fn collect_parts(part: &ParsedMail, out: &mut BodyParts) -> WireResult<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, out)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    if disposition.disposition == DispositionType::Attachment {
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| "attachment".to_string());
        out.attachments.push(RemoteAttachment {
            filename,
            mime_type: part.ctype.mimetype.clone(),
            data: part.get_body_raw()?,
        });
        return Ok(());
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" if out.text.is_none() => out.text = Some(part.get_body()?),
        "text/html" if out.html.is_none() => out.html = Some(part.get_body()?),
        _ => {}
    }
    Ok(())
}

fn header(parsed: &ParsedMail, name: &str) -> Option<String> {
    parsed
        .headers
        .iter()
        .find(|h| h.get_key_ref().eq_ignore_ascii_case(name))
        .map(|h| h.get_value())
}

fn first_address(raw: &str) -> Option<(String, Option<String>)> {
    let parsed = addrparse(raw).ok()?;
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => {
                return Some((info.addr.clone(), info.display_name.clone()));
            }
            MailAddr::Group(group) => {
                if let Some(info) = group.addrs.first() {
                    return Some((info.addr.clone(), info.display_name.clone()));
                }
            }
        }
    }
    None
}

fn address_list(raw: &str) -> Vec<String> {
    let Ok(parsed) = addrparse(raw) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => out.push(info.addr.clone()),
            MailAddr::Group(group) => out.extend(group.addrs.iter().map(|i| i.addr.clone())),
        }
    }
    out
}

fn imap_since_date(days_back: i64) -> String {
    let target = Local::now() - Duration::days(days_back.max(0));
    let month = match target.month() {
        1 => "Jan",
        2 => "Feb",
        3 => "Mar",
        4 => "Apr",
        5 => "May",
        6 => "Jun",
        7 => "Jul",
        8 => "Aug",
        9 => "Sep",
        10 => "Oct",
        11 => "Nov",
        12 => "Dec",
        _ => "Jan",
    };
    format!("{}-{}-{}", target.day(), month, target.year())
}

#[cfg(test)]
mod tests {
    use super::{FETCH_MAX_MESSAGES, imap_since_date, parse_remote_message, recent_window};

    const SIMPLE: &str = "Message-ID: <abc-123@provider.test>\r\n\
        From: Ada Lovelace <ada@provider.test>\r\n\
        To: me@deck.test, other@deck.test\r\n\
        Subject: Numbers\r\n\
        Date: Mon, 24 Aug 2026 10:00:00 +0000\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        The analytical engine weaves algebraic patterns.\r\n";

    const MULTIPART: &str = "From: bob@provider.test\r\n\
        To: me@deck.test\r\n\
        Subject: Report\r\n\
        Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
        \r\n\
        --outer\r\n\
        Content-Type: text/html\r\n\
        \r\n\
        <p>see attachment</p>\r\n\
        --outer\r\n\
        Content-Type: application/pdf; name=\"report.pdf\"\r\n\
        Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
        Content-Transfer-Encoding: base64\r\n\
        \r\n\
        JVBERi0=\r\n\
        --outer--\r\n";

    #[test]
    fn message_id_becomes_the_message_key() {
        let message = parse_remote_message(SIMPLE.as_bytes(), 7, 42, true).unwrap();
        assert_eq!(message.message_key, "abc-123@provider.test");
        assert_eq!(message.from_address, "ada@provider.test");
        assert_eq!(message.from_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(message.to_addresses.len(), 2);
        assert!(message.is_read);
        assert!(message.body_text.contains("analytical engine"));
        assert!(message.body_html.is_empty());
    }

    #[test]
    fn missing_message_id_falls_back_to_uid_key() {
        let message = parse_remote_message(MULTIPART.as_bytes(), 7, 42, false).unwrap();
        assert_eq!(message.message_key, "imap:7:42");
    }

    #[test]
    fn multipart_yields_html_body_and_attachment_bytes() {
        let message = parse_remote_message(MULTIPART.as_bytes(), 7, 42, false).unwrap();
        assert!(message.body_html.contains("see attachment"));
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].filename, "report.pdf");
        assert_eq!(message.attachments[0].mime_type, "application/pdf");
        assert_eq!(message.attachments[0].data, b"%PDF-");
    }

    #[test]
    fn recent_window_keeps_only_the_newest_uids() {
        let uids: Vec<u32> = (1..=200).rev().collect();
        let window = recent_window(uids, FETCH_MAX_MESSAGES);
        assert_eq!(window.len(), FETCH_MAX_MESSAGES);
        assert_eq!(window.first(), Some(&151));
        assert_eq!(window.last(), Some(&200));

        assert_eq!(recent_window(vec![3, 1, 2], 50), vec![1, 2, 3]);
    }

    #[test]
    fn since_date_uses_imap_day_month_year_form() {
        let date = imap_since_date(0);
        let parts: Vec<&str> = date.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].parse::<u32>().is_ok());
        assert!(parts[2].parse::<i32>().is_ok());
    }
}
