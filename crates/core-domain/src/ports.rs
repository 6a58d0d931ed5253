use async_trait::async_trait;
use maildesk_error::ChannelError;
use tokio_util::sync::CancellationToken;

use crate::entities::{InboxConfig, IncomingMessage, OutgoingMessage, SenderRef};

/// The contract a live inbox exposes to the orchestration layer that
/// loads and reloads inbox configurations.
#[async_trait]
pub trait InboxChannel: Send + Sync {
    /// Database id of the inbox.
    fn identifier(&self) -> i64;

    /// Configured from address, display-name form included.
    fn from_address(&self) -> &str;

    /// Channel kind, e.g. "email".
    fn channel(&self) -> &'static str;

    /// Delivers one outbound message. Runs on the caller; failures
    /// surface here as delivery failures for that message.
    async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError>;

    /// Starts every configured reader and blocks until all of them have
    /// stopped, which happens once `shutdown` is cancelled.
    async fn receive(&self, shutdown: CancellationToken) -> Result<(), ChannelError>;

    /// Shuts down delivery. Idempotent.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Persists parsed inbound mail. One message's failure must never take
/// down the poller that produced it.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store_incoming(
        &self,
        inbox_id: i64,
        message: IncomingMessage,
    ) -> Result<(), ChannelError>;
}

/// Resolves a sender address to an internal user/contact record.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn resolve_sender(&self, address: &str) -> Result<Option<SenderRef>, ChannelError>;
}

/// Persistence hook invoked after every successful OAuth token refresh,
/// so refreshed tokens survive a process restart. Failures are logged by
/// the caller and never propagate into the send path; a write that never
/// lands simply costs one extra refresh on the next boot.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save_refreshed(
        &self,
        inbox_id: i64,
        config: &InboxConfig,
    ) -> Result<(), ChannelError>;
}
