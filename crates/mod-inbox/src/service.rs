use std::collections::HashMap;
use std::sync::Arc;

use maildesk_domain::{InboxChannel, OutgoingMessage};
use maildesk_error::ChannelError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Holds every active inbox channel, keyed by inbox id. The application
/// registers channels at startup (and again after a config change), then
/// routes sends and starts receivers through here.
#[derive(Default)]
pub struct InboxRegistry {
    inboxes: HashMap<i64, Arc<dyn InboxChannel>>,
}

impl InboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel, replacing any previous channel for the same
    /// inbox id.
    pub fn register(&mut self, channel: Arc<dyn InboxChannel>) {
        let id = channel.identifier();
        info!(inbox_id = id, kind = channel.channel(), from = channel.from_address(), "registered inbox");
        self.inboxes.insert(id, channel);
    }

    pub fn get(&self, inbox_id: i64) -> Result<&Arc<dyn InboxChannel>, ChannelError> {
        self.inboxes
            .get(&inbox_id)
            .ok_or_else(|| ChannelError::not_found(format!("inbox {inbox_id}")))
    }

    pub fn remove(&mut self, inbox_id: i64) -> Option<Arc<dyn InboxChannel>> {
        self.inboxes.remove(&inbox_id)
    }

    pub fn identifiers(&self) -> Vec<i64> {
        self.inboxes.keys().copied().collect()
    }

    /// Routes one outbound message to its inbox.
    pub async fn send(
        &self,
        inbox_id: i64,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        if message.to.is_empty() {
            return Err(ChannelError::config("'to' cannot be empty"));
        }
        self.get(inbox_id)?.send(message).await
    }

    /// Starts the receiver of every registered inbox. Each runs until
    /// `shutdown` is cancelled; the caller drains the returned set to
    /// wait for them.
    pub fn spawn_receivers(&self, shutdown: &CancellationToken) -> JoinSet<()> {
        let mut receivers = JoinSet::new();
        for channel in self.inboxes.values() {
            let channel = channel.clone();
            let token = shutdown.clone();
            receivers.spawn(async move {
                let id = channel.identifier();
                if let Err(e) = channel.receive(token).await {
                    error!(inbox_id = id, error = %e, "receiver stopped with error");
                }
            });
        }
        info!(count = self.inboxes.len(), "inbox receivers started");
        receivers
    }

    /// Closes every channel. Errors are logged per inbox so one failing
    /// close never skips the rest.
    pub async fn close_all(&self) {
        for channel in self.inboxes.values() {
            if let Err(e) = channel.close().await {
                error!(inbox_id = channel.identifier(), error = %e, "close failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubChannel {
        id: i64,
        sent: AtomicUsize,
        closed: AtomicUsize,
    }

    impl StubChannel {
        fn new(id: i64) -> Arc<Self> {
            Arc::new(Self {
                id,
                sent: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InboxChannel for StubChannel {
        fn identifier(&self) -> i64 {
            self.id
        }

        fn from_address(&self) -> &str {
            "stub@example.com"
        }

        fn channel(&self) -> &'static str {
            "email"
        }

        async fn send(&self, _message: OutgoingMessage) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn receive(&self, shutdown: CancellationToken) -> Result<(), ChannelError> {
            shutdown.cancelled().await;
            Ok(())
        }

        async fn close(&self) -> Result<(), ChannelError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            to: vec!["a@example.com".into()],
            content: "hi".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn routes_sends_by_inbox_id() {
        let mut registry = InboxRegistry::new();
        let ch = StubChannel::new(1);
        registry.register(ch.clone());

        registry.send(1, message()).await.unwrap();
        assert_eq!(ch.sent.load(Ordering::SeqCst), 1);

        let err = registry.send(2, message()).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotFound(_)));
    }

    #[tokio::test]
    async fn rejects_empty_recipients_before_routing() {
        let mut registry = InboxRegistry::new();
        let ch = StubChannel::new(1);
        registry.register(ch.clone());

        let err = registry
            .send(1, OutgoingMessage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));
        assert_eq!(ch.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reregistering_replaces_the_channel() {
        let mut registry = InboxRegistry::new();
        registry.register(StubChannel::new(1));
        registry.register(StubChannel::new(1));
        assert_eq!(registry.identifiers(), vec![1]);
    }

    #[tokio::test]
    async fn receivers_stop_on_cancellation() {
        let mut registry = InboxRegistry::new();
        registry.register(StubChannel::new(1));
        registry.register(StubChannel::new(2));

        let shutdown = CancellationToken::new();
        let mut receivers = registry.spawn_receivers(&shutdown);
        shutdown.cancel();
        let mut finished = 0;
        while let Some(result) = receivers.join_next().await {
            result.unwrap();
            finished += 1;
        }
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn close_all_reaches_every_inbox() {
        let mut registry = InboxRegistry::new();
        let a = StubChannel::new(1);
        let b = StubChannel::new(2);
        registry.register(a.clone());
        registry.register(b.clone());

        registry.close_all().await;
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);

        registry.remove(1).unwrap();
        assert!(registry.get(1).is_err());
    }
}
