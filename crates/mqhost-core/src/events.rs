//! Host lifecycle notifications.
//!
//! The plugin publishes every lifecycle callback it receives as a
//! [`HostEvent`] on an [`EventHub`]. Each submodule gets its own
//! [`SubmoduleEvents`] view through its dependencies; subscribers receive the
//! events as a tokio broadcast stream, which they consume from operations
//! running on the execution context. Disposing the view closes every
//! subscription and chat wait made through it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::context::{OperationCancelled, ambient_sleep};
use crate::error::{Error, Result};

/// Game state reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GameState {
    CharSelect = 1,
    CharCreate = 2,
    Something = 4,
    InGame = 5,
    LoggingIn = 253,
    Unloading = 255,
    PostFrontLoad = 500,
    Unknown = 65535,
    PreCharSelect = u32::MAX,
}

impl From<u32> for GameState {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::CharSelect,
            2 => Self::CharCreate,
            4 => Self::Something,
            5 => Self::InGame,
            253 => Self::LoggingIn,
            255 => Self::Unloading,
            500 => Self::PostFrontLoad,
            u32::MAX => Self::PreCharSelect,
            _ => Self::Unknown,
        }
    }
}

/// Where a chat line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSource {
    /// The game client.
    Eq,
    /// The host's own output.
    Mq,
}

/// Which chat lines a waiter listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatChannel {
    Any,
    Eq,
    Mq,
}

impl ChatChannel {
    fn accepts(self, source: ChatSource) -> bool {
        match self {
            Self::Any => true,
            Self::Eq => source == ChatSource::Eq,
            Self::Mq => source == ChatSource::Mq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub source: ChatSource,
    pub text: String,
    pub color: u32,
    pub filter: Option<u32>,
}

/// A lifecycle notification from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    BeginZone,
    EndZone,
    Zoned,
    ReloadUi,
    CleanUi,
    GameStateChanged(GameState),
    Chat(ChatLine),
    AddSpawn { id: u64 },
    RemoveSpawn { id: u64 },
    AddGroundItem { id: u64 },
    RemoveGroundItem { id: u64 },
}

/// Fan-out point for host events.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<HostEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: HostEvent) -> usize {
        tracing::trace!("Publishing {:?}", event);
        self.sender.send(event).unwrap_or(0)
    }

    /// Event view handed to one submodule.
    pub fn for_submodule(&self, name: &str) -> SubmoduleEvents {
        SubmoduleEvents {
            name: name.to_string(),
            sender: self.sender.clone(),
            closed: CancellationToken::new(),
        }
    }
}

/// Per-submodule event subscriptions.
///
/// Disposed together with the submodule's other dependencies. Disposing
/// closes the subscriptions and chat waits already handed out; later
/// subscriptions fail with [`Error::Disposed`].
#[derive(Debug, Clone)]
pub struct SubmoduleEvents {
    name: String,
    sender: broadcast::Sender<HostEvent>,
    closed: CancellationToken,
}

impl SubmoduleEvents {
    /// Owning submodule.
    pub fn submodule(&self) -> &str {
        &self.name
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Result<EventSubscription> {
        self.check_disposed()?;
        Ok(EventSubscription {
            receiver: self.sender.subscribe(),
            closed: self.closed.clone(),
        })
    }

    /// Chat wait helpers.
    pub fn chat(&self) -> Result<ChatWaiter> {
        self.check_disposed()?;
        Ok(ChatWaiter {
            sender: self.sender.clone(),
            closed: self.closed.clone(),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close every subscription and chat wait of this view.
    pub fn dispose(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("Closing event subscriptions of {}", self.name);
        }
        self.closed.cancel();
    }

    fn check_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::Disposed("SubmoduleEvents"))
        } else {
            Ok(())
        }
    }
}

/// Events delivered to one subscriber, until its submodule's view is disposed.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<HostEvent>,
    closed: CancellationToken,
}

impl EventSubscription {
    /// Next event. [`RecvError::Closed`] once the view is disposed or the
    /// hub is gone.
    pub async fn recv(&mut self) -> std::result::Result<HostEvent, RecvError> {
        if self.closed.is_cancelled() {
            return Err(RecvError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RecvError::Closed),
            event = self.receiver.recv() => event,
        }
    }

    pub fn try_recv(&mut self) -> std::result::Result<HostEvent, TryRecvError> {
        if self.closed.is_cancelled() {
            return Err(TryRecvError::Closed);
        }
        self.receiver.try_recv()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Waits for chat lines matching a predicate.
#[derive(Debug, Clone)]
pub struct ChatWaiter {
    sender: broadcast::Sender<HostEvent>,
    closed: CancellationToken,
}

impl ChatWaiter {
    /// Wait for a line on `channel` matching `predicate`.
    ///
    /// The subscription starts when this method is called, not when the
    /// returned future is first polled. Resolves to `Ok(true)` on a match,
    /// `Ok(false)` when `timeout` elapses first, and `Err(OperationCancelled)`
    /// when `cancel` fires, the submodule's events are disposed or the host
    /// shuts down. The timeout runs on the ambient context's runtime.
    pub fn wait_for<P>(
        &self,
        channel: ChatChannel,
        predicate: P,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> impl Future<Output = std::result::Result<bool, OperationCancelled>> + Send + use<P>
    where
        P: Fn(&str) -> bool + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let closed = self.closed.clone();

        async move {
            let matched = async move {
                loop {
                    match receiver.recv().await {
                        Ok(HostEvent::Chat(line))
                            if channel.accepts(line.source) && predicate(&line.text) =>
                        {
                            return Ok(true);
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Chat waiter skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => return Err(OperationCancelled),
                    }
                }
            };

            let deadline = async move {
                match timeout {
                    Some(duration) => ambient_sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(OperationCancelled),
                _ = closed.cancelled() => Err(OperationCancelled),
                result = matched => result,
                _ = deadline => Ok(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(source: ChatSource, text: &str) -> HostEvent {
        HostEvent::Chat(ChatLine {
            source,
            text: text.to_string(),
            color: 0,
            filter: None,
        })
    }

    #[test]
    fn test_game_state_from_raw() {
        assert_eq!(GameState::from(5), GameState::InGame);
        assert_eq!(GameState::from(u32::MAX), GameState::PreCharSelect);
        assert_eq!(GameState::from(42), GameState::Unknown);
        assert_eq!(GameState::PostFrontLoad as u32, 500);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = EventHub::new(8);
        assert_eq!(hub.publish(HostEvent::Zoned), 0);

        let events = hub.for_submodule("Foo");
        let mut rx = events.subscribe().unwrap();
        assert_eq!(hub.publish(HostEvent::BeginZone), 1);
        assert_eq!(rx.try_recv().unwrap(), HostEvent::BeginZone);
    }

    #[test]
    fn test_disposed_view_rejects_subscriptions() {
        let hub = EventHub::new(8);
        let events = hub.for_submodule("Foo");
        events.dispose();

        assert!(matches!(events.subscribe(), Err(Error::Disposed(_))));
        assert!(events.chat().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_closes_live_subscription() {
        let hub = EventHub::new(8);
        let events = hub.for_submodule("Foo");
        let mut subscription = events.subscribe().unwrap();

        hub.publish(HostEvent::Zoned);
        assert_eq!(subscription.recv().await, Ok(HostEvent::Zoned));

        let pending = tokio::spawn(async move {
            let closed = subscription.recv().await;
            (closed, subscription.try_recv(), subscription.is_closed())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        events.dispose();

        let (closed, try_closed, is_closed) = pending.await.unwrap();
        assert_eq!(closed, Err(RecvError::Closed));
        assert_eq!(try_closed, Err(TryRecvError::Closed));
        assert!(is_closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_ends_chat_wait() {
        let hub = EventHub::new(8);
        let events = hub.for_submodule("Foo");
        let waiter = events.chat().unwrap();

        let wait = waiter.wait_for(ChatChannel::Any, |_| true, None, CancellationToken::new());
        events.dispose();
        hub.publish(chat(ChatSource::Eq, "too late"));

        assert_eq!(wait.await, Err(OperationCancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_for_match() {
        let hub = EventHub::new(8);
        let waiter = hub.for_submodule("Foo").chat().unwrap();

        let wait = waiter.wait_for(
            ChatChannel::Eq,
            |line| line.contains("tells you"),
            Some(Duration::from_secs(5)),
            CancellationToken::new(),
        );

        hub.publish(chat(ChatSource::Mq, "Bob tells you, hi"));
        hub.publish(chat(ChatSource::Eq, "unrelated"));
        hub.publish(chat(ChatSource::Eq, "Bob tells you, hi"));

        assert_eq!(wait.await, Ok(true));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_for_timeout() {
        let hub = EventHub::new(8);
        let waiter = hub.for_submodule("Foo").chat().unwrap();

        let result = waiter
            .wait_for(
                ChatChannel::Any,
                |_| true,
                Some(Duration::from_millis(20)),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result, Ok(false));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_for_cancellation() {
        let hub = EventHub::new(8);
        let waiter = hub.for_submodule("Foo").chat().unwrap();
        let token = CancellationToken::new();

        let wait = waiter.wait_for(ChatChannel::Any, |_| false, None, token.clone());
        token.cancel();

        assert_eq!(wait.await, Err(OperationCancelled));
    }
}
