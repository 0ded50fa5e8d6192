//! SMTP transport service: builds and delivers outbound mail with lettre and
//! holds the credential encryption boundary. Only opaque references leave
//! this module; plaintext credentials exist in memory for the duration of a
//! single wire operation.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Attachment, Mailbox, Message, MultiPart, header::ContentType},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use tracing::{debug, warn};

use maildeck_core::{
    Account, AccountKind, BlobStore, MailError, MailTransport, Result, SendMailRequest,
    SmtpParams, TransportReply,
};

const CREDENTIAL_PREFIX: &str = "enc:v1:";

/// Platform outbound relay used for internal accounts, which carry no SMTP
/// endpoint of their own.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub username: String,
    pub password: String,
}

pub struct SmtpTransportService {
    relay: RelayConfig,
    blobs: Arc<dyn BlobStore>,
    skip_tls_verify: bool,
}

impl SmtpTransportService {
    pub fn new(relay: RelayConfig, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            relay,
            blobs,
            skip_tls_verify: false,
        }
    }

    /// Test rigs only; never enable against real providers.
    pub fn with_skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }

    async fn mailer_for(&self, account: &Account) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        match &account.kind {
            AccountKind::External {
                smtp,
                credential_ref,
                ..
            } => {
                let password = self.decrypt_credential(credential_ref).await?;
                build_mailer(
                    smtp,
                    account.address(),
                    &password,
                    self.skip_tls_verify,
                )
            }
            AccountKind::Internal => {
                let smtp = SmtpParams {
                    host: self.relay.host.clone(),
                    port: self.relay.port,
                    secure: self.relay.secure,
                };
                build_mailer(
                    &smtp,
                    &self.relay.username,
                    &self.relay.password,
                    self.skip_tls_verify,
                )
            }
        }
    }
}

#[async_trait::async_trait]
impl MailTransport for SmtpTransportService {
    async fn encrypt_credential(&self, plaintext: &str) -> Result<String> {
        Ok(format!("{CREDENTIAL_PREFIX}{}", STANDARD.encode(plaintext)))
    }

    async fn decrypt_credential(&self, opaque: &str) -> Result<String> {
        let encoded = opaque.strip_prefix(CREDENTIAL_PREFIX).ok_or_else(|| {
            MailError::Validation("unrecognized credential reference".to_string())
        })?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| MailError::Transport(format!("corrupt credential reference: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| MailError::Transport(format!("corrupt credential reference: {e}")))
    }

    async fn test_connection(&self, account: &Account) -> Result<TransportReply> {
        if matches!(account.kind, AccountKind::Internal) {
            return Ok(TransportReply::ok("internal accounts need no connection test"));
        }
        let mailer = self.mailer_for(account).await?;
        match mailer.test_connection().await {
            Ok(true) => Ok(TransportReply::ok("connection and authentication succeeded")),
            Ok(false) => Ok(TransportReply::failed("server refused the connection")),
            Err(e) => {
                warn!(account_id = account.id, error = %e, "smtp connection test failed");
                Ok(TransportReply::failed(e.to_string()))
            }
        }
    }

    async fn send_mail(
        &self,
        account: &Account,
        request: &SendMailRequest,
    ) -> Result<TransportReply> {
        let email = self.build_message(request).await?;
        let mailer = self.mailer_for(account).await?;
        debug!(
            account_id = account.id,
            to = request.to.len(),
            attachments = request.attachments.len(),
            "sending via smtp"
        );
        match mailer.send(email).await {
            Ok(_) => Ok(TransportReply::ok("delivered to smtp server")),
            Err(e) => Ok(TransportReply::failed(e.to_string())),
        }
    }
}

impl SmtpTransportService {
    async fn build_message(&self, request: &SendMailRequest) -> Result<Message> {
        let mut builder = Message::builder()
            .from(parse_mailbox(&request.from)?)
            .subject(&request.subject);
        for addr in &request.to {
            builder = builder.to(parse_mailbox(addr)?);
        }
        for addr in &request.cc {
            builder = builder.cc(parse_mailbox(addr)?);
        }
        for addr in &request.bcc {
            builder = builder.bcc(parse_mailbox(addr)?);
        }
        if let Some(in_reply_to) = &request.in_reply_to {
            builder = builder.in_reply_to(in_reply_to.clone());
        }

        let alternative = MultiPart::alternative_plain_html(
            request.body_text.clone(),
            request.body_html.clone(),
        );
        let email = if request.attachments.is_empty() {
            builder.multipart(alternative)
        } else {
            let mut multipart = MultiPart::mixed().multipart(alternative);
            for attachment in &request.attachments {
                let bytes = self.blobs.download(&attachment.storage_ref).await?;
                let content_type = ContentType::parse(&attachment.mime_type).unwrap_or_else(|_| {
                    ContentType::parse(mime::APPLICATION_OCTET_STREAM.as_ref()).unwrap()
                });
                multipart = multipart
                    .singlepart(Attachment::new(attachment.filename.clone()).body(bytes, content_type));
            }
            builder.multipart(multipart)
        };
        email.map_err(|e| MailError::Transport(e.to_string()))
    }
}

fn build_mailer(
    smtp: &SmtpParams,
    username: &str,
    password: &str,
    skip_tls_verify: bool,
) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let mut tls_builder = TlsParameters::builder(smtp.host.clone());
    if skip_tls_verify {
        tls_builder = tls_builder
            .dangerous_accept_invalid_certs(true)
            .dangerous_accept_invalid_hostnames(true);
    }
    let tls_parameters = tls_builder
        .build()
        .map_err(|e| MailError::Transport(e.to_string()))?;
    let tls = if !smtp.secure {
        Tls::None
    } else if smtp.port == 465 {
        Tls::Wrapper(tls_parameters)
    } else {
        Tls::Required(tls_parameters)
    };
    let builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
        .port(smtp.port)
        .tls(tls)
        .credentials(Credentials::new(username.to_string(), password.to_string()));
    Ok(builder.build())
}

/// Accepts both bare addresses and `Display Name <addr>` forms.
pub(crate) fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let trimmed = input.trim();
    if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.find('>')) {
        let name = trimmed[..start].trim().trim_matches('"');
        let addr = trimmed[start + 1..end]
            .trim()
            .parse()
            .map_err(|_| MailError::Validation(format!("invalid address: {trimmed}")))?;
        let display = (!name.is_empty()).then(|| name.to_string());
        return Ok(Mailbox::new(display, addr));
    }
    let addr = trimmed
        .parse()
        .map_err(|_| MailError::Validation(format!("invalid address: {trimmed}")))?;
    Ok(Mailbox::new(None, addr))
}
