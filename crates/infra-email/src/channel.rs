//! The email channel: ties pooled SMTP delivery, IMAP polling and the
//! OAuth token lifecycle together behind the `InboxChannel` port.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use maildesk_domain::{
    parse_duration, AuthType, ImapConfig, InboxChannel, InboxConfig, MessageStore,
    OutgoingMessage, TokenStore, UserStore,
};
use maildesk_error::ChannelError;
use maildesk_oauth::{is_token_expired, refresh_oauth_config};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::imap_reader::{fetch_inbox, ImapAuth};
use crate::smtp::{bare_address, compose, pick_pool, SmtpPool};

pub const CHANNEL_EMAIL: &str = "email";

const DEFAULT_READ_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SCAN_LOOKBACK: Duration = Duration::from_secs(48 * 3600);

pub struct EmailChannelOpts {
    pub inbox_id: i64,
    pub config: InboxConfig,
    pub message_store: Arc<dyn MessageStore>,
    pub user_store: Arc<dyn UserStore>,
    /// When absent, refreshed tokens live only in memory and are lost on
    /// restart.
    pub token_store: Option<Arc<dyn TokenStore>>,
    /// Static headers stamped on every outbound message from this inbox.
    pub headers: Vec<(String, String)>,
}

pub struct EmailChannel {
    inner: Arc<Inner>,
}

struct Inner {
    inbox_id: i64,
    from: String,
    bare_from: String,
    config: RwLock<InboxConfig>,
    // Swapped wholesale on token refresh and on close; senders work from
    // a snapshot so a refresh never blocks an in-flight delivery.
    pools: RwLock<Arc<Vec<SmtpPool>>>,
    message_store: Arc<dyn MessageStore>,
    user_store: Arc<dyn UserStore>,
    token_store: Option<Arc<dyn TokenStore>>,
    headers: Vec<(String, String)>,
}

impl EmailChannel {
    pub fn new(opts: EmailChannelOpts) -> Result<Self, ChannelError> {
        opts.config.validate()?;
        let bare_from = bare_address(&opts.config.from)?;
        let pools = build_pools(&opts.config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                inbox_id: opts.inbox_id,
                from: opts.config.from.clone(),
                bare_from,
                config: RwLock::new(opts.config),
                pools: RwLock::new(Arc::new(pools)),
                message_store: opts.message_store,
                user_store: opts.user_store,
                token_store: opts.token_store,
                headers: opts.headers,
            }),
        })
    }
}

fn build_pools(config: &InboxConfig) -> Result<Vec<SmtpPool>, ChannelError> {
    let oauth = if config.auth_type == AuthType::Oauth2 {
        config.oauth.as_ref()
    } else {
        None
    };
    config
        .smtp
        .iter()
        .map(|server| SmtpPool::build(server, oauth))
        .collect()
}

impl Inner {
    /// Refreshes the OAuth tokens when they are within the expiry margin,
    /// rebuilds the SMTP pools with the new access token, and hands the
    /// updated config to the token store. Cheap no-op for password
    /// inboxes and unexpired tokens.
    async fn refresh_oauth_if_needed(&self) -> Result<(), ChannelError> {
        {
            let config = self.config.read().await;
            match &config.oauth {
                Some(oauth) if is_token_expired(oauth.expires_at) => {}
                _ => return Ok(()),
            }
        }

        let mut config = self.config.write().await;
        // Another sender may have refreshed while we waited for the lock.
        let oauth = match &config.oauth {
            Some(oauth) if is_token_expired(oauth.expires_at) => oauth.clone(),
            _ => return Ok(()),
        };

        let refreshed = refresh_oauth_config(&oauth)
            .await
            .map_err(|e| ChannelError::token_refresh(self.inbox_id, e.to_string()))?;
        config.oauth = Some(refreshed);

        let pools = build_pools(&config)?;
        *self.pools.write().await = Arc::new(pools);
        info!(inbox_id = self.inbox_id, "oauth tokens refreshed");

        // Persist outside the lock so a slow store never stalls senders.
        let snapshot = config.clone();
        drop(config);
        if let Some(store) = &self.token_store {
            // A failed write costs one extra refresh after a restart; the
            // send that triggered the refresh still goes out.
            if let Err(e) = store.save_refreshed(self.inbox_id, &snapshot).await {
                warn!(inbox_id = self.inbox_id, error = %e, "persisting refreshed tokens failed");
            }
        }
        Ok(())
    }

    async fn imap_auth(&self, server: &ImapConfig) -> ImapAuth {
        let config = self.config.read().await;
        if config.auth_type == AuthType::Oauth2 {
            if let Some(oauth) = &config.oauth {
                return ImapAuth::Xoauth2 {
                    username: server.username.clone(),
                    access_token: oauth.access_token.clone(),
                };
            }
        }
        ImapAuth::Password {
            username: server.username.clone(),
            password: server.password.clone(),
        }
    }

    async fn poll_loop(self: Arc<Self>, server: ImapConfig, shutdown: CancellationToken) {
        let (interval, lookback) = reader_timing(&server);
        let mut seen: HashSet<u32> = HashSet::new();
        // First scan reaches back over the configured window; afterwards
        // each scan starts where the last successful one began. SINCE is
        // date-granular, so the seen set handles same-day overlap.
        let mut last_scan: Option<chrono::DateTime<Utc>> = None;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            inbox_id = self.inbox_id,
            host = %server.host,
            mailbox = %server.mailbox,
            interval_secs = interval.as_secs(),
            "mailbox reader started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(inbox_id = self.inbox_id, host = %server.host, "mailbox reader stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let started = Utc::now();
            let since = last_scan.unwrap_or_else(|| {
                started
                    - chrono::Duration::from_std(lookback)
                        .unwrap_or_else(|_| chrono::Duration::hours(48))
            });
            match self.poll_once(&server, since, &mut seen).await {
                Ok(()) => last_scan = Some(started),
                Err(e) => warn!(
                    inbox_id = self.inbox_id,
                    host = %server.host,
                    error = %e,
                    "mailbox poll failed"
                ),
            }
        }
    }

    async fn poll_once(
        &self,
        server: &ImapConfig,
        since: chrono::DateTime<Utc>,
        seen: &mut HashSet<u32>,
    ) -> Result<(), ChannelError> {
        self.refresh_oauth_if_needed().await?;
        let auth = self.imap_auth(server).await;

        let server_cfg = server.clone();
        let seen_snapshot = seen.clone();
        let fetched = tokio::task::spawn_blocking(move || {
            fetch_inbox(&server_cfg, &auth, since, &seen_snapshot)
        })
        .await
        .map_err(|e| ChannelError::internal(format!("imap task: {e}")))??;

        for (uid, mut message) in fetched {
            seen.insert(uid);
            if message.loop_prevention.as_deref() == Some(self.bare_from.as_str()) {
                debug!(inbox_id = self.inbox_id, uid, "skipping own outbound message");
                continue;
            }

            let sender = bare_address(&message.from).unwrap_or_else(|_| message.from.clone());
            match self.user_store.resolve_sender(&sender).await {
                Ok(Some(user)) => message.sender_id = Some(user.id),
                Ok(None) => {}
                Err(e) => {
                    warn!(inbox_id = self.inbox_id, sender = %sender, error = %e, "sender lookup failed")
                }
            }

            if let Err(e) = self.message_store.store_incoming(self.inbox_id, message).await {
                error!(inbox_id = self.inbox_id, uid, error = %e, "storing inbound message failed");
            }
        }
        Ok(())
    }
}

/// Poll interval and first-scan lookback for one mailbox. Missing,
/// unparseable and zero values fall back to the defaults; a zero
/// interval in particular would make the ticker unusable.
fn reader_timing(server: &ImapConfig) -> (Duration, Duration) {
    (
        parse_duration(&server.read_interval).unwrap_or(DEFAULT_READ_INTERVAL),
        parse_duration(&server.scan_inbox_since).unwrap_or(DEFAULT_SCAN_LOOKBACK),
    )
}

/// The From line and the loop-prevention stamp for one outbound
/// message. A message-level sender overrides the inbox identity, and
/// the stamp always carries the bare address of whoever actually sends.
fn effective_sender<'a>(
    inbox_from: &'a str,
    inbox_bare: &'a str,
    message_from: &'a str,
) -> Result<(&'a str, String), ChannelError> {
    if message_from.is_empty() {
        Ok((inbox_from, inbox_bare.to_string()))
    } else {
        Ok((message_from, bare_address(message_from)?))
    }
}

#[async_trait]
impl InboxChannel for EmailChannel {
    fn identifier(&self) -> i64 {
        self.inner.inbox_id
    }

    fn from_address(&self) -> &str {
        &self.inner.from
    }

    fn channel(&self) -> &'static str {
        CHANNEL_EMAIL
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
        self.inner.refresh_oauth_if_needed().await?;

        let pools = self.inner.pools.read().await.clone();
        let pool = pick_pool(&pools).ok_or_else(|| {
            ChannelError::delivery("no smtp server available: channel closed or unconfigured")
        })?;

        let (from, stamp) =
            effective_sender(&self.inner.from, &self.inner.bare_from, &message.from)?;
        let email = compose(from, &stamp, &self.inner.headers, &message)?;
        pool.deliver(&email).await?;
        debug!(
            inbox_id = self.inner.inbox_id,
            host = pool.host(),
            to = ?message.to,
            "message delivered"
        );
        Ok(())
    }

    async fn receive(&self, shutdown: CancellationToken) -> Result<(), ChannelError> {
        let servers = { self.inner.config.read().await.imap.clone() };
        let mut readers = JoinSet::new();
        for server in servers {
            let inner = self.inner.clone();
            let token = shutdown.clone();
            readers.spawn(inner.poll_loop(server, token));
        }
        while let Some(result) = readers.join_next().await {
            if let Err(e) = result {
                error!(inbox_id = self.inner.inbox_id, error = %e, "mailbox reader panicked");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        *self.inner.pools.write().await = Arc::new(Vec::new());
        info!(inbox_id = self.inner.inbox_id, "smtp pools closed");
        Ok(())
    }
}
