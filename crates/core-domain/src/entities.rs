use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use maildesk_error::ChannelError;
use serde::{Deserialize, Serialize};

/// How the inbox authenticates against its mail servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Password,
    Oauth2,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password => write!(f, "password"),
            Self::Oauth2 => write!(f, "oauth2"),
        }
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "password" => Ok(Self::Password),
            "oauth2" => Ok(Self::Oauth2),
            _ => Err(format!("unknown auth type: {s}")),
        }
    }
}

/// OAuth2 provider behind an inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Google => write!(f, "google"),
            Self::Microsoft => write!(f, "microsoft"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "google" | "gmail" => Ok(Self::Google),
            "microsoft" | "outlook" | "office365" => Ok(Self::Microsoft),
            _ => Err(format!("unknown oauth provider: {s}")),
        }
    }
}

/// TLS posture of an SMTP or IMAP endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsType {
    None,
    #[default]
    Starttls,
    Tls,
}

/// Password-based SMTP authentication protocol. Ignored when the inbox
/// uses OAuth2 (XOAUTH2 always wins).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    #[default]
    #[serde(alias = "")]
    None,
    Plain,
    Login,
    Cram,
}

/// One outbound SMTP server. An inbox may configure several; sends are
/// spread across them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth_protocol: AuthProtocol,
    #[serde(default)]
    pub tls_type: TlsType,
    #[serde(default)]
    pub tls_skip_verify: bool,
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
    #[serde(default)]
    pub max_msg_retries: u32,
    /// Duration string, e.g. "30s". Unparseable values fall back to the
    /// pool default.
    #[serde(default)]
    pub idle_timeout: String,
    #[serde(default)]
    pub wait_timeout: String,
    #[serde(default)]
    pub hello_hostname: String,
}

fn default_max_conns() -> u32 {
    2
}

/// One monitored IMAP mailbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default)]
    pub tls_type: TlsType,
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// Poll interval, duration string, e.g. "60s".
    #[serde(default)]
    pub read_interval: String,
    /// Lookback window for the first scan after start, e.g. "48h".
    #[serde(default)]
    pub scan_inbox_since: String,
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

/// OAuth2 credentials and token state for an inbox. `expires_at` is
/// absolute wall-clock time, never a relative duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub provider: Provider,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Microsoft only; empty means the "common" endpoint.
    #[serde(default)]
    pub tenant_id: String,
}

/// The full inbox configuration, round-tripped through the inbox's
/// database config column. Field names are part of the stored format;
/// renaming any of them breaks existing inboxes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboxConfig {
    #[serde(default)]
    pub smtp: Vec<SmtpConfig>,
    #[serde(default)]
    pub imap: Vec<ImapConfig>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
}

impl InboxConfig {
    /// Structural invariants: an oauth block is present exactly when the
    /// auth type is oauth2, and oauth2 entries carry no plaintext
    /// passwords.
    pub fn validate(&self) -> Result<(), ChannelError> {
        match (self.auth_type, &self.oauth) {
            (AuthType::Oauth2, None) => {
                return Err(ChannelError::config(
                    "auth_type is oauth2 but no oauth block is configured",
                ));
            }
            (AuthType::Password, Some(_)) => {
                return Err(ChannelError::config(
                    "oauth block configured but auth_type is password",
                ));
            }
            _ => {}
        }
        if self.auth_type == AuthType::Oauth2 {
            let has_password = self.smtp.iter().any(|c| !c.password.is_empty())
                || self.imap.iter().any(|c| !c.password.is_empty());
            if has_password {
                return Err(ChannelError::config(
                    "oauth2 inbox must not carry plaintext server passwords",
                ));
            }
        }
        Ok(())
    }

    /// Strips every secret, for returning the config over an API.
    pub fn clear_passwords(&mut self) {
        for smtp in &mut self.smtp {
            smtp.password.clear();
        }
        for imap in &mut self.imap {
            imap.password.clear();
        }
        if let Some(oauth) = &mut self.oauth {
            oauth.access_token.clear();
            oauth.refresh_token.clear();
            oauth.client_secret.clear();
        }
    }
}

/// Body type of an outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Plain,
    #[default]
    Html,
}

#[derive(Debug, Clone, Default)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// An outbound message as handed over by the conversation layer.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub content: String,
    pub content_type: ContentType,
    /// Plain-text fallback for html content; empty means none.
    pub alt_content: String,
    pub attachments: Vec<Attachment>,
    /// Message-specific headers, applied in order after the inbox-level
    /// ones.
    pub headers: Vec<(String, String)>,
    /// Message id being replied to, bare (no angle brackets).
    pub in_reply_to: String,
    /// Thread reference ids, bare.
    pub references: Vec<String>,
    /// Our own message id for the outgoing mail, bare.
    pub source_id: Option<String>,
}

/// A parsed inbound message on its way to the `MessageStore`.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Mailbox the message was read from.
    pub mailbox: String,
    pub has_attachments: bool,
    /// Value of the loop-prevention header, when present.
    pub loop_prevention: Option<String>,
    /// Internal record for the sender, when the `UserStore` knows them.
    pub sender_id: Option<i64>,
}

/// Internal identity a sender address resolved to.
#[derive(Debug, Clone)]
pub struct SenderRef {
    pub id: i64,
    pub email: String,
}

/// Parses duration strings like "500ms", "30s", "5m", "48h". Returns
/// `None` for anything else; callers substitute their own defaults.
/// A zero duration also parses as `None` since every consumer is an
/// interval or timeout that cannot run at zero.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let duration = match unit {
        "ms" => Duration::from_millis(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => return None,
    };
    (!duration.is_zero()).then_some(duration)
}
