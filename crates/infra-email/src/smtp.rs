//! Outbound SMTP: per-server connection pools, message composition with
//! threading headers, and retrying delivery.

use std::time::Duration;

use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use maildesk_domain::{
    parse_duration, AuthProtocol, ContentType as BodyType, OAuthConfig, OutgoingMessage,
    SmtpConfig, TlsType,
};
use maildesk_error::ChannelError;
use rand::seq::SliceRandom;
use tracing::warn;

/// Stamped on every outbound message with the sending inbox's bare
/// address, and checked on inbound mail so an inbox never ingests its
/// own sends.
pub const LOOP_PREVENTION_HEADER: &str = "X-Maildesk-Loop-Prevention";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(40);

/// A pooled transport for one configured SMTP server.
pub struct SmtpPool {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    max_retries: u32,
    wait_timeout: Duration,
}

impl SmtpPool {
    /// Builds the pooled transport for one server. With OAuth2 the
    /// configured auth protocol is ignored and XOAUTH2 is forced, since
    /// the providers that issue tokens accept nothing else.
    pub fn build(config: &SmtpConfig, oauth: Option<&OAuthConfig>) -> Result<Self, ChannelError> {
        let mut builder = match config.tls_type {
            TlsType::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                    .port(config.port)
            }
            TlsType::Starttls | TlsType::Tls => {
                let mut tls = TlsParameters::builder(config.host.clone());
                if config.tls_skip_verify {
                    tls = tls
                        .dangerous_accept_invalid_certs(true)
                        .dangerous_accept_invalid_hostnames(true);
                }
                let params = tls.build().map_err(|e| {
                    ChannelError::config(format!("tls setup for '{}': {e}", config.host))
                })?;
                let mode = if config.tls_type == TlsType::Tls {
                    Tls::Wrapper(params)
                } else {
                    Tls::Required(params)
                };
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                    .port(config.port)
                    .tls(mode)
            }
        };

        builder = match oauth {
            Some(oauth) => builder
                .credentials(Credentials::new(
                    config.username.clone(),
                    oauth.access_token.clone(),
                ))
                .authentication(vec![Mechanism::Xoauth2]),
            None => match config.auth_protocol {
                AuthProtocol::None => builder,
                AuthProtocol::Plain => builder
                    .credentials(Credentials::new(
                        config.username.clone(),
                        config.password.clone(),
                    ))
                    .authentication(vec![Mechanism::Plain]),
                AuthProtocol::Login => builder
                    .credentials(Credentials::new(
                        config.username.clone(),
                        config.password.clone(),
                    ))
                    .authentication(vec![Mechanism::Login]),
                AuthProtocol::Cram => {
                    return Err(ChannelError::config(format!(
                        "auth protocol 'cram' is not supported for '{}'",
                        config.host
                    )));
                }
            },
        };

        if !config.hello_hostname.is_empty() {
            builder = builder.hello_name(ClientId::Domain(config.hello_hostname.clone()));
        }

        let idle = parse_duration(&config.idle_timeout).unwrap_or(DEFAULT_IDLE_TIMEOUT);
        let wait = parse_duration(&config.wait_timeout).unwrap_or(DEFAULT_WAIT_TIMEOUT);
        let transport = builder
            .pool_config(
                PoolConfig::new()
                    .max_size(config.max_conns.max(1))
                    .idle_timeout(idle),
            )
            .build();

        Ok(Self {
            transport,
            host: config.host.clone(),
            max_retries: config.max_msg_retries,
            wait_timeout: wait,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Delivers a composed message, retrying transient failures up to the
    /// configured attempt count. Permanent SMTP rejections stop retrying
    /// immediately. Each attempt is bounded by the wait timeout so a
    /// saturated pool cannot wedge the caller.
    pub async fn deliver(&self, email: &Message) -> Result<(), ChannelError> {
        let bytes = email.formatted();
        let attempts = self.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(
                self.wait_timeout,
                self.transport.send_raw(email.envelope(), &bytes),
            )
            .await
            {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => {
                    if e.is_permanent() {
                        return Err(ChannelError::delivery(format!(
                            "'{}' rejected the message: {e}",
                            self.host
                        )));
                    }
                    warn!(host = %self.host, attempt, error = %e, "smtp delivery attempt failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(host = %self.host, attempt, "smtp delivery attempt timed out");
                    last_error = format!(
                        "timed out after {}s waiting for the pool",
                        self.wait_timeout.as_secs()
                    );
                }
            }
        }

        Err(ChannelError::delivery(format!(
            "giving up on '{}' after {attempts} attempt(s): {last_error}",
            self.host
        )))
    }
}

/// Picks the pool for the next send, spreading load across the
/// configured servers. `None` once the channel is closed.
pub fn pick_pool(pools: &[SmtpPool]) -> Option<&SmtpPool> {
    pools.choose(&mut rand::thread_rng())
}

/// Bare address of a possibly display-named mailbox string, e.g.
/// `Support <support@example.com>` becomes `support@example.com`.
pub fn bare_address(mailbox: &str) -> Result<String, ChannelError> {
    let parsed: Mailbox = mailbox
        .parse()
        .map_err(|e| ChannelError::config(format!("invalid address '{mailbox}': {e}")))?;
    Ok(parsed.email.to_string())
}

/// Builds the MIME message: recipients, threading headers, the
/// loop-prevention stamp, inbox-level headers and the body parts.
pub fn compose(
    from: &str,
    loop_prevention: &str,
    inbox_headers: &[(String, String)],
    message: &OutgoingMessage,
) -> Result<Message, ChannelError> {
    let from_mailbox: Mailbox = from
        .parse()
        .map_err(|e| ChannelError::config(format!("invalid from '{from}': {e}")))?;

    let mut builder = Message::builder()
        .from(from_mailbox)
        .subject(message.subject.clone());

    for addr in &message.to {
        builder = builder.to(parse_mailbox(addr, "to")?);
    }
    for addr in &message.cc {
        builder = builder.cc(parse_mailbox(addr, "cc")?);
    }
    for addr in &message.bcc {
        builder = builder.bcc(parse_mailbox(addr, "bcc")?);
    }

    builder = builder.message_id(message.source_id.as_ref().map(|id| format!("<{id}>")));
    if !message.in_reply_to.is_empty() {
        builder = builder.in_reply_to(format!("<{}>", message.in_reply_to));
    }
    // Always written, even when empty, so threading clients see the
    // header on every reply in the conversation.
    let references: String = message
        .references
        .iter()
        .map(|r| format!("<{r}> "))
        .collect();
    builder = builder.references(references);

    let mut email = match body_parts(message)? {
        BodyParts::Single(part) => builder
            .singlepart(part)
            .map_err(|e| ChannelError::internal(format!("message build: {e}")))?,
        BodyParts::Multi(multi) => builder
            .multipart(multi)
            .map_err(|e| ChannelError::internal(format!("message build: {e}")))?,
    };

    insert_raw_header(&mut email, LOOP_PREVENTION_HEADER, loop_prevention)?;
    for (name, value) in inbox_headers.iter().chain(&message.headers) {
        // The builder's headers win; a caller copy would put a second
        // line on the wire instead of overriding.
        if builder_managed(name, !message.in_reply_to.is_empty()) {
            continue;
        }
        insert_raw_header(&mut email, name, value)?;
    }

    Ok(email)
}

/// Header names `compose` writes itself. `In-Reply-To` is only claimed
/// when the message carries one, so a caller-supplied reply header on a
/// fresh message still goes through.
fn builder_managed(name: &str, has_reply: bool) -> bool {
    const ALWAYS: &[&str] = &[
        "from",
        "to",
        "cc",
        "bcc",
        "subject",
        "date",
        "message-id",
        "references",
        "mime-version",
        "content-type",
        "content-transfer-encoding",
    ];
    ALWAYS.iter().any(|h| name.eq_ignore_ascii_case(h))
        || name.eq_ignore_ascii_case(LOOP_PREVENTION_HEADER)
        || (has_reply && name.eq_ignore_ascii_case("in-reply-to"))
}

enum BodyParts {
    Single(SinglePart),
    Multi(MultiPart),
}

fn body_parts(message: &OutgoingMessage) -> Result<BodyParts, ChannelError> {
    let plain = |s: &str| {
        SinglePart::builder()
            .content_type(ContentType::TEXT_PLAIN)
            .body(s.to_string())
    };
    let html = |s: &str| {
        SinglePart::builder()
            .content_type(ContentType::TEXT_HTML)
            .body(s.to_string())
    };

    // Html bodies with a plain-text fallback become multipart/alternative;
    // everything else is a single part.
    enum Body {
        Part(SinglePart),
        Alternative(MultiPart),
    }
    let body = match message.content_type {
        BodyType::Plain => Body::Part(plain(&message.content)),
        BodyType::Html if message.alt_content.is_empty() => Body::Part(html(&message.content)),
        BodyType::Html => Body::Alternative(
            MultiPart::alternative()
                .singlepart(plain(&message.alt_content))
                .singlepart(html(&message.content)),
        ),
    };

    if message.attachments.is_empty() {
        return Ok(match body {
            Body::Part(part) => BodyParts::Single(part),
            Body::Alternative(multi) => BodyParts::Multi(multi),
        });
    }

    let mut mixed = match body {
        Body::Part(part) => MultiPart::mixed().singlepart(part),
        Body::Alternative(multi) => MultiPart::mixed().multipart(multi),
    };
    for attachment in &message.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .or_else(|_| ContentType::parse("application/octet-stream"))
            .unwrap_or(ContentType::TEXT_PLAIN);
        mixed = mixed.singlepart(
            MailAttachment::new(attachment.filename.clone())
                .body(attachment.content.clone(), content_type),
        );
    }
    Ok(BodyParts::Multi(mixed))
}

fn parse_mailbox(addr: &str, field: &str) -> Result<Mailbox, ChannelError> {
    addr.parse()
        .map_err(|e| ChannelError::config(format!("invalid {field} address '{addr}': {e}")))
}

fn insert_raw_header(email: &mut Message, name: &str, value: &str) -> Result<(), ChannelError> {
    let header_name = HeaderName::new_from_ascii(name.to_string())
        .map_err(|e| ChannelError::config(format!("invalid header name '{name}': {e}")))?;
    email
        .headers_mut()
        .insert_raw(HeaderValue::new(header_name, value.to_string()));
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use maildesk_domain::Attachment;

    fn base_message() -> OutgoingMessage {
        OutgoingMessage {
            from: String::new(),
            to: vec!["alice@example.com".into()],
            subject: "Re: ticket".into(),
            content: "<p>hi</p>".into(),
            content_type: BodyType::Html,
            ..Default::default()
        }
    }

    fn rendered(message: &OutgoingMessage) -> String {
        let email = compose(
            "Support <support@example.com>",
            "support@example.com",
            &[],
            message,
        )
        .unwrap();
        String::from_utf8_lossy(&email.formatted()).to_string()
    }

    #[test]
    fn stamps_loop_prevention_header() {
        let out = rendered(&base_message());
        assert!(out.contains("X-Maildesk-Loop-Prevention: support@example.com"));
    }

    #[test]
    fn threading_headers_are_angle_bracketed() {
        let mut message = base_message();
        message.in_reply_to = "prev@mx".into();
        message.references = vec!["a@mx".into(), "b@mx".into()];
        message.source_id = Some("self@mx".into());
        let out = rendered(&message);
        assert!(out.contains("In-Reply-To: <prev@mx>"));
        assert!(out.contains("References: <a@mx> <b@mx>"));
        assert!(out.contains("Message-ID: <self@mx>"));
    }

    #[test]
    fn references_header_is_written_even_when_empty() {
        let out = rendered(&base_message());
        assert!(out.contains("References:"));
    }

    #[test]
    fn custom_headers_follow_the_message() {
        let mut message = base_message();
        message.headers.push(("X-Ticket-ID".into(), "1234".into()));
        let out = rendered(&message);
        assert!(out.contains("X-Ticket-ID: 1234"));
    }

    #[test]
    fn threading_headers_are_never_duplicated_by_caller_copies() {
        let mut message = base_message();
        message.in_reply_to = "canonical@mx".into();
        message.headers.push(("In-Reply-To".into(), "<stale@mx>".into()));
        message.headers.push(("References".into(), "<stale@mx>".into()));
        message.headers.push(("Subject".into(), "spoofed".into()));
        let out = rendered(&message);
        assert_eq!(out.matches("In-Reply-To:").count(), 1);
        assert_eq!(out.matches("References:").count(), 1);
        assert!(out.contains("In-Reply-To: <canonical@mx>"));
        assert!(!out.contains("stale@mx"));
        assert!(!out.contains("spoofed"));
    }

    #[test]
    fn caller_reply_header_survives_on_a_fresh_message() {
        let mut message = base_message();
        message.headers.push(("In-Reply-To".into(), "<ext@mx>".into()));
        let out = rendered(&message);
        assert_eq!(out.matches("In-Reply-To:").count(), 1);
        assert!(out.contains("In-Reply-To: <ext@mx>"));
    }

    #[test]
    fn inbox_headers_are_stamped_on_every_message() {
        let email = compose(
            "support@example.com",
            "support@example.com",
            &[("X-Mailer".into(), "maildesk".into())],
            &base_message(),
        )
        .unwrap();
        let out = String::from_utf8_lossy(&email.formatted()).to_string();
        assert!(out.contains("X-Mailer: maildesk"));
    }

    #[test]
    fn html_with_fallback_is_multipart_alternative() {
        let mut message = base_message();
        message.alt_content = "hi".into();
        let out = rendered(&message);
        assert!(out.contains("multipart/alternative"));
        assert!(out.contains("text/plain"));
        assert!(out.contains("text/html"));
    }

    #[test]
    fn plain_body_has_no_html_part() {
        let mut message = base_message();
        message.content = "hi".into();
        message.content_type = BodyType::Plain;
        let out = rendered(&message);
        assert!(out.contains("text/plain"));
        assert!(!out.contains("text/html"));
    }

    #[test]
    fn attachments_force_multipart_mixed() {
        let mut message = base_message();
        message.attachments.push(Attachment {
            filename: "log.txt".into(),
            content_type: "text/plain".into(),
            content: b"line".to_vec(),
        });
        let out = rendered(&message);
        assert!(out.contains("multipart/mixed"));
        assert!(out.contains("log.txt"));
    }

    #[test]
    fn bare_address_strips_display_name() {
        assert_eq!(
            bare_address("Support <support@example.com>").unwrap(),
            "support@example.com"
        );
        assert_eq!(bare_address("plain@example.com").unwrap(), "plain@example.com");
        assert!(bare_address("not an address").is_err());
    }

    #[test]
    fn cram_auth_is_rejected_at_build() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            auth_protocol: AuthProtocol::Cram,
            ..Default::default()
        };
        assert!(matches!(
            SmtpPool::build(&config, None),
            Err(ChannelError::Config(_))
        ));
    }

    // Pooled transports spawn their cleanup task on drop, so any test
    // that builds one needs a runtime.
    #[tokio::test]
    async fn pool_defaults_survive_bad_duration_strings() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            idle_timeout: "soon".into(),
            wait_timeout: "0s".into(),
            ..Default::default()
        };
        let pool = SmtpPool::build(&config, None).unwrap();
        assert_eq!(pool.wait_timeout, DEFAULT_WAIT_TIMEOUT);
        assert_eq!(pool.host(), "smtp.example.com");
    }

    #[tokio::test]
    async fn pick_pool_covers_every_server() {
        let build = |host: &str| {
            SmtpPool::build(
                &SmtpConfig {
                    host: host.into(),
                    port: 587,
                    ..Default::default()
                },
                None,
            )
            .unwrap()
        };
        let pools = vec![
            build("a.example.com"),
            build("b.example.com"),
            build("c.example.com"),
        ];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(pick_pool(&pools).unwrap().host().to_string());
        }
        assert_eq!(seen.len(), 3);
        assert!(pick_pool(&[]).is_none());
    }
}
