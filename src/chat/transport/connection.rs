//! Realtime connection manager.
//!
//! Owns at most one connection at a time, scoped to the viewer and an
//! optional conversation. A background driver task connects, issues the
//! authenticate and join handshake, pumps inbound events to subscribers
//! and reconnects with a bounded, fixed-delay policy.
//!
//! Every successful (re)connection gets a fresh epoch. Sends capture the
//! epoch they were issued against and fail with
//! [`ChatError::StaleConnection`] if the connection was replaced meanwhile.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat::api::auth::AuthContext;
use crate::chat::core::config::{ReconnectPolicy, RealtimeConfig};
use crate::chat::core::errors::{ChatError, ChatResult, TransportError};
use crate::chat::core::model::ConversationRef;
use crate::chat::transport::events::{InboundEvent, OutboundEvent, TransportEvent};
use crate::chat::transport::link::{ConnectRequest, Connector, Link};
use crate::chat::transport::subscription::{EventBus, Subscription};

/// Connectivity as shown to the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Connectivity {
    /// Nothing opened yet, or closed by the caller.
    #[default]
    Idle,
    /// First attempt in progress.
    Connecting,
    /// Handshake done; sends are accepted.
    Connected,
    /// Waiting for or running a reconnection attempt.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Retry budget exhausted; `open` must be called again.
    Disconnected,
    /// Credentials rejected; no further attempts are made.
    AuthFailed,
}

/// Observable connection state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Current connectivity.
    pub connectivity: Connectivity,
    /// Last human-readable error, cleared on success.
    pub last_error: Option<String>,
    /// Epoch of the current connection, 0 before the first one.
    pub epoch: u64,
}

impl ConnectionState {
    /// Whether sends are currently accepted.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connectivity == Connectivity::Connected
    }
}

enum Command {
    Send {
        event: OutboundEvent,
        epoch: u64,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct ActiveConnection {
    scope: Option<ConversationRef>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Owner of the realtime connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: RealtimeConfig,
    auth: AuthContext,
    bus: EventBus,
    state: Arc<watch::Sender<ConnectionState>>,
    epochs: Arc<AtomicU64>,
    active: Option<ActiveConnection>,
}

impl ConnectionManager {
    /// Create an idle manager.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: RealtimeConfig, auth: AuthContext) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            connector,
            config,
            auth,
            bus: EventBus::new(),
            state: Arc::new(state),
            epochs: Arc::new(AtomicU64::new(0)),
            active: None,
        }
    }

    /// Register for transport events. Dropping the subscription unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Snapshot of the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Whether sends are currently accepted.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Scope of the open connection, if any.
    #[must_use]
    pub fn scope(&self) -> Option<&ConversationRef> {
        self.active.as_ref().and_then(|active| active.scope.as_ref())
    }

    /// Open a connection for `scope`.
    ///
    /// A no-op when a live connection for the same scope exists; otherwise the
    /// previous connection is closed before the new one is started.
    pub async fn open(&mut self, scope: Option<ConversationRef>) {
        if let Some(active) = &self.active {
            if active.scope == scope && !active.task.is_finished() {
                debug!(scope = ?scope, "Connection already open for scope");
                return;
            }
        }
        self.close().await;

        let request = ConnectRequest {
            endpoint: self.config.endpoint.clone(),
            path: self.config.path.clone(),
            token: self.auth.token().to_string(),
            viewer: self.auth.viewer(),
            scope: scope.clone(),
        };
        let (commands, receiver) = mpsc::unbounded_channel();
        let driver = Driver {
            connector: Arc::clone(&self.connector),
            request,
            connect_timeout: self.config.connect_timeout,
            policy: self.config.reconnect,
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            epochs: Arc::clone(&self.epochs),
            commands: receiver,
        };

        info!(scope = ?scope, endpoint = %self.config.endpoint, "Opening realtime connection");
        self.active = Some(ActiveConnection {
            scope,
            commands,
            task: tokio::spawn(driver.run()),
        });
    }

    /// Emit an event on the current connection.
    ///
    /// # Errors
    /// Returns [`ChatError::NotConnected`] unless the state is connected,
    /// [`ChatError::StaleConnection`] if the connection was replaced before the
    /// event was written, or the transport error if the write failed.
    pub async fn send(&self, event: OutboundEvent) -> ChatResult<()> {
        let state = self.state();
        if !state.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let active = self.active.as_ref().ok_or(ChatError::NotConnected)?;

        let (reply, response) = oneshot::channel();
        active
            .commands
            .send(Command::Send {
                event,
                epoch: state.epoch,
                reply,
            })
            .map_err(|_| ChatError::NotConnected)?;
        response.await.map_err(|_| ChatError::StaleConnection)?
    }

    /// Close the connection, if any, and wait for the driver to stop.
    pub async fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let (reply, done) = oneshot::channel();
        if active.commands.send(Command::Close { reply }).is_ok() {
            let grace = self.config.connect_timeout;
            if tokio::time::timeout(grace, done).await.is_err() {
                warn!("Realtime driver did not stop in time; aborting");
            }
        }
        active.task.abort();
        if let Err(err) = active.task.await {
            if !err.is_cancelled() {
                warn!(%err, "Realtime driver ended abnormally");
            }
        }

        self.state.send_modify(|state| {
            if !matches!(
                state.connectivity,
                Connectivity::Disconnected | Connectivity::AuthFailed
            ) {
                state.connectivity = Connectivity::Idle;
            }
        });
        info!("Realtime connection closed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.config.endpoint)
            .field("scope", &self.scope())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

enum PumpExit {
    Closed(Option<oneshot::Sender<()>>),
    AuthFailed(String),
    Lost(String),
}

enum Interrupted<T> {
    Done(T),
    Closed(Option<oneshot::Sender<()>>),
}

struct Driver {
    connector: Arc<dyn Connector>,
    request: ConnectRequest,
    connect_timeout: Duration,
    policy: ReconnectPolicy,
    bus: EventBus,
    state: Arc<watch::Sender<ConnectionState>>,
    epochs: Arc<AtomicU64>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut established = false;

        loop {
            self.set_connectivity(if attempt == 0 {
                Connectivity::Connecting
            } else {
                Connectivity::Reconnecting { attempt }
            });

            let outcome = interruptible(
                &mut self.commands,
                handshake(&self.connector, &self.request, self.connect_timeout),
            )
            .await;
            let result = match outcome {
                Interrupted::Done(result) => result,
                Interrupted::Closed(reply) => return Self::acknowledge(reply),
            };

            match result {
                Ok(mut link) => {
                    let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
                    self.state.send_modify(|state| {
                        state.connectivity = Connectivity::Connected;
                        state.last_error = None;
                        state.epoch = epoch;
                    });
                    if established {
                        info!(attempt, epoch, "Realtime connection restored");
                        self.bus
                            .publish(&TransportEvent::Reconnected { attempt, epoch });
                    } else {
                        info!(epoch, "Realtime connection established");
                        self.bus.publish(&TransportEvent::Connected { epoch });
                    }
                    established = true;
                    attempt = 0;

                    match self.pump(link.as_mut(), epoch).await {
                        PumpExit::Closed(reply) => {
                            link.close().await;
                            return Self::acknowledge(reply);
                        }
                        PumpExit::AuthFailed(reason) => {
                            link.close().await;
                            return self.fail_auth(reason);
                        }
                        PumpExit::Lost(reason) => {
                            warn!(epoch, %reason, "Realtime connection lost");
                            self.record_error(&reason);
                            self.bus.publish(&TransportEvent::Disconnected {
                                reason,
                                gave_up: false,
                            });
                        }
                    }
                }
                Err(TransportError::Rejected(reason)) => return self.fail_auth(reason),
                Err(err) => {
                    let reason = err.to_string();
                    warn!(attempt, %reason, "Realtime connection attempt failed");
                    self.record_error(&reason);
                    self.bus.publish(&TransportEvent::ConnectError(reason));
                }
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                return self.give_up();
            }

            self.set_connectivity(Connectivity::Reconnecting { attempt });
            debug!(attempt, delay = ?self.policy.delay, "Waiting before reconnecting");
            if let Interrupted::Closed(reply) =
                interruptible(&mut self.commands, tokio::time::sleep(self.policy.delay)).await
            {
                return Self::acknowledge(reply);
            }
        }
    }

    async fn pump(&mut self, link: &mut dyn Link, epoch: u64) -> PumpExit {
        loop {
            tokio::select! {
                // a lost link is noticed before queued sends are written
                biased;
                inbound = link.recv() => match inbound {
                    None => return PumpExit::Lost("connection closed by server".to_string()),
                    Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                    Some(Ok(InboundEvent::AuthFailed(reason))) => return PumpExit::AuthFailed(reason),
                    Some(Ok(event)) => {
                        if let Some(event) = TransportEvent::from_inbound(event, epoch) {
                            self.bus.publish(&event);
                        }
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send { event, epoch: target, reply }) => {
                        let result = if target == epoch {
                            debug!(event = event.name(), epoch, "Emitting event");
                            link.send(&event).await.map_err(ChatError::from)
                        } else {
                            warn!(event = event.name(), target, epoch, "Dropping send for a replaced connection");
                            Err(ChatError::StaleConnection)
                        };
                        if reply.send(result).is_err() {
                            debug!("Send caller went away");
                        }
                    }
                    Some(Command::Close { reply }) => return PumpExit::Closed(Some(reply)),
                    None => return PumpExit::Closed(None),
                },
            }
        }
    }

    fn set_connectivity(&self, connectivity: Connectivity) {
        self.state
            .send_modify(|state| state.connectivity = connectivity);
    }

    fn record_error(&self, reason: &str) {
        self.state
            .send_modify(|state| state.last_error = Some(reason.to_string()));
    }

    fn fail_auth(&self, reason: String) {
        warn!(%reason, "Realtime authentication rejected");
        self.state.send_modify(|state| {
            state.connectivity = Connectivity::AuthFailed;
            state.last_error = Some(reason.clone());
        });
        self.bus.publish(&TransportEvent::AuthFailed(reason));
    }

    fn give_up(&self) {
        let last = self
            .state
            .borrow()
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        let reason = format!(
            "unable to reach the chat server after {} attempts: {last}",
            self.policy.max_attempts
        );
        warn!(%reason, "Giving up on realtime connection");
        self.state.send_modify(|state| {
            state.connectivity = Connectivity::Disconnected;
            state.last_error = Some(reason.clone());
        });
        self.bus.publish(&TransportEvent::Disconnected {
            reason,
            gave_up: true,
        });
    }

    fn acknowledge(reply: Option<oneshot::Sender<()>>) {
        if let Some(reply) = reply {
            if reply.send(()).is_err() {
                debug!("Close caller went away");
            }
        }
    }
}

/// Connect within the deadline, then authenticate and join the scope.
async fn handshake(
    connector: &Arc<dyn Connector>,
    request: &ConnectRequest,
    deadline: Duration,
) -> Result<Box<dyn Link>, TransportError> {
    let mut link = tokio::time::timeout(deadline, connector.connect(request))
        .await
        .map_err(|_| TransportError::Timeout)??;

    link.send(&OutboundEvent::authenticate(
        &request.viewer,
        request.scope.as_ref(),
    ))
    .await?;
    if let Some(scope) = &request.scope {
        link.send(&OutboundEvent::Join(scope.clone())).await?;
    }
    Ok(link)
}

/// Drive `fut` while answering commands: sends are refused, close interrupts.
async fn interruptible<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    fut: F,
) -> Interrupted<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Interrupted::Done(output),
            command = commands.recv() => match command {
                Some(Command::Send { event, reply, .. }) => {
                    debug!(event = event.name(), "Refusing send while not connected");
                    if reply.send(Err(ChatError::StaleConnection)).is_err() {
                        debug!("Send caller went away");
                    }
                }
                Some(Command::Close { reply }) => return Interrupted::Closed(Some(reply)),
                None => return Interrupted::Closed(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::core::ids::{ClientMessageId, OrderId};
    use crate::chat::testing::{MockConnector, test_auth};

    fn config(max_attempts: u32) -> RealtimeConfig {
        RealtimeConfig {
            endpoint: "ws://chat.test".to_string(),
            path: "/socket.io".to_string(),
            connect_timeout: Duration::from_millis(500),
            reconnect: ReconnectPolicy {
                max_attempts,
                delay: Duration::from_millis(1000),
            },
        }
    }

    fn order_scope() -> ConversationRef {
        ConversationRef::Order(OrderId::new("o1"))
    }

    fn message_event() -> OutboundEvent {
        OutboundEvent::NewMessage {
            scope: order_scope(),
            content: "hello".to_string(),
            receiver_id: None,
            client_id: ClientMessageId::new(),
        }
    }

    async fn next_event(subscription: &mut Subscription) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(30), subscription.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_authenticates_then_joins() {
        let connector = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), config(5), test_auth());
        let mut events = manager.subscribe();

        manager.open(Some(order_scope())).await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { epoch: 1 }));

        let sent = connector.sent_names();
        assert_eq!(sent, vec!["authenticate", "join-order-chat"]);
        assert!(manager.is_connected());
        manager.close().await;
        assert_eq!(manager.state().connectivity, Connectivity::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn send_is_rejected_before_connecting() {
        let connector = MockConnector::new();
        let manager = ConnectionManager::new(connector.clone(), config(5), test_auth());

        let err = manager.send(message_event()).await.unwrap_err();
        assert!(matches!(err, ChatError::NotConnected));
        assert!(connector.sent_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reissues_handshake_and_accepts_sends() {
        let connector = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), config(5), test_auth());
        let mut events = manager.subscribe();

        manager.open(Some(order_scope())).await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { .. }));

        connector.drop_link();
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { gave_up: false, .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Reconnected { attempt: 1, epoch: 2 }
        ));

        manager.send(message_event()).await.unwrap();
        assert_eq!(
            connector.sent_names(),
            vec![
                "authenticate",
                "join-order-chat",
                "authenticate",
                "join-order-chat",
                "new-message"
            ]
        );
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let connector = MockConnector::failing(u32::MAX);
        let mut manager = ConnectionManager::new(connector.clone(), config(2), test_auth());
        let mut events = manager.subscribe();

        manager.open(None).await;
        for _ in 0..3 {
            assert!(matches!(next_event(&mut events).await, TransportEvent::ConnectError(_)));
        }
        let event = next_event(&mut events).await;
        assert!(
            matches!(
                &event,
                TransportEvent::Disconnected { reason, gave_up: true } if reason.contains("after 2 attempts")
            ),
            "unexpected event {event:?}"
        );

        let state = manager.state();
        assert_eq!(state.connectivity, Connectivity::Disconnected);
        assert!(state.last_error.is_some());
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_times_out_and_retries() {
        let connector = MockConnector::hanging();
        let mut manager = ConnectionManager::new(connector.clone(), config(1), test_auth());
        let mut events = manager.subscribe();

        manager.open(Some(order_scope())).await;
        let first = next_event(&mut events).await;
        assert!(
            matches!(&first, TransportEvent::ConnectError(reason) if reason.contains("timed out")),
            "unexpected event {first:?}"
        );
        assert_eq!(manager.state().connectivity, Connectivity::Reconnecting { attempt: 1 });

        assert!(matches!(next_event(&mut events).await, TransportEvent::ConnectError(_)));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { gave_up: true, .. }
        ));
        assert_eq!(connector.connect_count(), 2);
        assert!(connector.sent_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_racing_a_lost_link_is_stale() {
        let connector = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), config(5), test_auth());
        let mut events = manager.subscribe();

        manager.open(Some(order_scope())).await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { epoch: 1 }));

        // the driver has not observed the loss yet
        connector.drop_link();
        assert!(manager.state().is_connected());
        let err = manager.send(message_event()).await.unwrap_err();

        assert!(matches!(err, ChatError::StaleConnection));
        assert!(connector.sent_names().iter().all(|name| *name != "new-message"));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { gave_up: false, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_carry_the_connection_epoch() {
        let connector = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), config(5), test_auth());
        let mut events = manager.subscribe();

        manager.open(Some(order_scope())).await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { epoch: 1 }));
        manager
            .open(Some(ConversationRef::Order(OrderId::new("o2"))))
            .await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { epoch: 2 }));

        let inbound = InboundEvent::from_event(
            "new-message",
            serde_json::json!({ "_id": "m1", "content": "hi" }),
        )
        .unwrap();
        connector.push(inbound);
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Message { epoch: 2, scope: None, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_stop_retrying() {
        let connector = MockConnector::rejecting("invalid token");
        let mut manager = ConnectionManager::new(connector.clone(), config(5), test_auth());
        let mut events = manager.subscribe();

        manager.open(None).await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::AuthFailed(reason) if reason == "invalid token"
        ));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(manager.state().connectivity, Connectivity::AuthFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_same_scope_is_a_noop() {
        let connector = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), config(5), test_auth());
        let mut events = manager.subscribe();

        manager.open(Some(order_scope())).await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { .. }));
        manager.open(Some(order_scope())).await;
        assert_eq!(connector.connect_count(), 1);

        manager
            .open(Some(ConversationRef::Order(OrderId::new("o2"))))
            .await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { epoch: 2 }));
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.closed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_events_reach_subscribers() {
        let connector = MockConnector::new();
        let mut manager = ConnectionManager::new(connector.clone(), config(5), test_auth());
        let mut events = manager.subscribe();

        manager.open(Some(order_scope())).await;
        assert!(matches!(next_event(&mut events).await, TransportEvent::Connected { .. }));

        connector.push(InboundEvent::Typing {
            user_id: crate::chat::core::ids::UserId::new("admin_1"),
            is_typing: true,
            scope: Some(order_scope()),
        });
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Typing { is_typing: true, .. }
        ));
    }
}
