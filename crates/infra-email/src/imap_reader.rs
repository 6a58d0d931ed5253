//! Inbound IMAP: connecting under the configured TLS posture,
//! authenticating, and turning raw RFC822 bodies into parsed messages.
//!
//! Everything here is synchronous; the channel bridges it onto the
//! runtime with `spawn_blocking`.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;
use maildesk_domain::{ImapConfig, IncomingMessage, TlsType};
use maildesk_error::ChannelError;
use native_tls::TlsConnector;
use tracing::warn;

use crate::smtp::LOOP_PREVENTION_HEADER;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(20);

/// How a reader authenticates its IMAP session.
#[derive(Clone)]
pub enum ImapAuth {
    Password { username: String, password: String },
    Xoauth2 { username: String, access_token: String },
}

/// Connects, authenticates, and pulls every message in the mailbox newer
/// than `since` whose UID is not already in `seen`. One connection per
/// call; the session is logged out before returning.
pub fn fetch_inbox(
    config: &ImapConfig,
    auth: &ImapAuth,
    since: DateTime<Utc>,
    seen: &HashSet<u32>,
) -> Result<Vec<(u32, IncomingMessage)>, ChannelError> {
    match config.tls_type {
        TlsType::Tls => {
            let tls = tls_connector(config.tls_skip_verify)?;
            let client = imap::connect((config.host.as_str(), config.port), &config.host, &tls)
                .map_err(|e| {
                    ChannelError::network(format!(
                        "imap connect to '{}:{}': {e}",
                        config.host, config.port
                    ))
                })?;
            let mut session = authenticate(client, auth)?;
            scan_mailbox(&mut session, config, since, seen)
        }
        TlsType::Starttls => {
            let client = open_plain_client(config)?;
            let tls = tls_connector(config.tls_skip_verify)?;
            let client = client.secure(&config.host, &tls).map_err(|e| {
                ChannelError::network(format!(
                    "imap starttls upgrade for '{}:{}': {e}",
                    config.host, config.port
                ))
            })?;
            let mut session = authenticate(client, auth)?;
            scan_mailbox(&mut session, config, since, seen)
        }
        TlsType::None => {
            let client = open_plain_client(config)?;
            let mut session = authenticate(client, auth)?;
            scan_mailbox(&mut session, config, since, seen)
        }
    }
}

fn open_plain_client(config: &ImapConfig) -> Result<imap::Client<TcpStream>, ChannelError> {
    let stream = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
        ChannelError::network(format!(
            "imap connect to '{}:{}': {e}",
            config.host, config.port
        ))
    })?;
    let _ = stream.set_read_timeout(Some(SOCKET_TIMEOUT));
    let _ = stream.set_write_timeout(Some(SOCKET_TIMEOUT));
    let mut client = imap::Client::new(stream);
    client.read_greeting().map_err(|e| {
        ChannelError::network(format!("imap greeting from '{}': {e}", config.host))
    })?;
    Ok(client)
}

fn tls_connector(skip_verify: bool) -> Result<TlsConnector, ChannelError> {
    let mut builder = TlsConnector::builder();
    if skip_verify {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    builder
        .build()
        .map_err(|e| ChannelError::network(format!("tls setup: {e}")))
}

fn authenticate<T: Read + Write>(
    client: imap::Client<T>,
    auth: &ImapAuth,
) -> Result<imap::Session<T>, ChannelError> {
    match auth {
        ImapAuth::Password { username, password } => {
            // LOGIN first, PLAIN as a fallback for servers that disable it.
            match client.login(username, password) {
                Ok(session) => Ok(session),
                Err((login_err, client)) => {
                    let authenticator = crate::xoauth2::ImapPlainAuthenticator {
                        username,
                        password,
                    };
                    client
                        .authenticate("PLAIN", &authenticator)
                        .map_err(|(plain_err, _)| {
                            ChannelError::auth(format!(
                                "imap auth failed for '{username}': login={login_err} plain={plain_err}"
                            ))
                        })
                }
            }
        }
        ImapAuth::Xoauth2 {
            username,
            access_token,
        } => {
            let authenticator = crate::xoauth2::ImapXoauth2Authenticator {
                username,
                access_token,
            };
            client
                .authenticate("XOAUTH2", &authenticator)
                .map_err(|(e, _)| {
                    ChannelError::auth(format!("imap xoauth2 auth failed for '{username}': {e}"))
                })
        }
    }
}

fn scan_mailbox<T: Read + Write>(
    session: &mut imap::Session<T>,
    config: &ImapConfig,
    since: DateTime<Utc>,
    seen: &HashSet<u32>,
) -> Result<Vec<(u32, IncomingMessage)>, ChannelError> {
    let mailbox = if config.mailbox.is_empty() {
        "INBOX"
    } else {
        config.mailbox.as_str()
    };
    session
        .select(mailbox)
        .map_err(|e| ChannelError::network(format!("imap select '{mailbox}': {e}")))?;

    let query = format!("SINCE {}", since.format("%d-%b-%Y"));
    let uids = session
        .uid_search(&query)
        .map_err(|e| ChannelError::network(format!("imap search '{query}': {e}")))?;

    let mut fresh: Vec<u32> = uids.into_iter().filter(|uid| !seen.contains(uid)).collect();
    fresh.sort_unstable();
    if fresh.is_empty() {
        let _ = session.logout();
        return Ok(Vec::new());
    }

    let uid_set = fresh
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let fetches = session
        .uid_fetch(&uid_set, "(UID BODY.PEEK[] INTERNALDATE)")
        .map_err(|e| ChannelError::network(format!("imap fetch: {e}")))?;

    let mut out = Vec::new();
    for fetch in fetches.iter() {
        let Some(uid) = fetch.uid else { continue };
        let Some(body) = fetch.body() else {
            warn!(uid, mailbox, "fetch returned no body");
            continue;
        };
        match parse_message(body, mailbox) {
            Ok(message) => out.push((uid, message)),
            // A single unparseable message must not abort the scan.
            Err(e) => warn!(uid, mailbox, error = %e, "message parse failed"),
        }
    }
    let _ = session.logout();
    Ok(out)
}

/// Parses a raw RFC822 message into the domain shape the store accepts.
pub fn parse_message(raw: &[u8], mailbox: &str) -> Result<IncomingMessage, ChannelError> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|e| ChannelError::parse(format!("mailparse: {e}")))?;
    let headers = parsed.get_headers();

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| trim_angle_brackets(&v))
        .unwrap_or_default();
    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .map(|v| trim_angle_brackets(&v))
        .filter(|v| !v.is_empty());
    let references = headers
        .get_first_value("References")
        .map(|v| {
            v.split_whitespace()
                .map(trim_angle_brackets)
                .filter(|r| !r.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let received_at = headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let text_body = extract_text(&parsed);
    let html_body = find_text_part(&parsed, "text/html");

    Ok(IncomingMessage {
        message_id,
        in_reply_to,
        references,
        from: headers.get_first_value("From").unwrap_or_default(),
        to: address_list(&headers, "To"),
        cc: address_list(&headers, "Cc"),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        text_body,
        html_body,
        received_at,
        mailbox: mailbox.to_string(),
        has_attachments: check_attachments(&parsed),
        loop_prevention: headers.get_first_value(LOOP_PREVENTION_HEADER),
        sender_id: None,
    })
}

fn trim_angle_brackets(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

fn address_list(headers: &mailparse::headers::Headers<'_>, name: &str) -> Vec<String> {
    headers
        .get_first_value(name)
        .map(|v| {
            v.split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn extract_text(parsed: &mailparse::ParsedMail<'_>) -> String {
    if let Some(text) = find_text_part(parsed, "text/plain") {
        return text;
    }
    if let Some(html) = find_text_part(parsed, "text/html") {
        return strip_html(&html);
    }
    parsed.get_body().unwrap_or_default()
}

fn find_text_part(parsed: &mailparse::ParsedMail<'_>, target: &str) -> Option<String> {
    if parsed.subparts.is_empty() {
        let ct = parsed
            .get_headers()
            .get_first_value("Content-Type")
            .unwrap_or_default();
        if ct.starts_with(target) || (target == "text/plain" && ct.is_empty()) {
            return parsed.get_body().ok();
        }
        return None;
    }
    for part in &parsed.subparts {
        if let Some(text) = find_text_part(part, target) {
            return Some(text);
        }
    }
    None
}

fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn check_attachments(parsed: &mailparse::ParsedMail<'_>) -> bool {
    for part in &parsed.subparts {
        let disp = part
            .get_headers()
            .get_first_value("Content-Disposition")
            .unwrap_or_default();
        if disp.starts_with("attachment") {
            return true;
        }
        if check_attachments(part) {
            return true;
        }
    }
    false
}
