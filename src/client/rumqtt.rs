//! [`AsyncMqttClient`] over `rumqttc`.
//!
//! `rumqttc` splits a connection into an `AsyncClient` (request queue) and an
//! `EventLoop` that must be polled. Connect spawns a driver task that polls
//! the event loop and turns protocol events into listener calls:
//!
//! ```text
//! publish/subscribe/unsubscribe ──push──▶ issue queue ──try_*──▶ AsyncClient
//!                                              │
//! EventLoop::poll ── Outgoing(pkid) ──pop──────┘──▶ in-flight by (kind, pkid)
//!                 ── PubAck/PubComp/SubAck/UnsubAck ──▶ ActionListener
//!                 ── Publish ──▶ matching routes ──▶ MessageListener
//! ```
//!
//! Requests are queued in the order they are handed to the `AsyncClient`,
//! which is the order the event loop writes them, so each `Outgoing` event
//! pops exactly the request it belongs to. QoS 0 publishes complete when
//! written; everything else completes on the broker's acknowledgement.
//!
//! There is no automatic reconnect. When the connection ends every pending
//! listener fails with [`OperationError::ConnectionLost`] and all routes are
//! dropped, which closes the subscribers' delivery channels.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use rumqttc::{
    mqttbytes::matches, AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop,
    MqttOptions, NetworkOptions, Outgoing, Packet, Publish, QoS, SubscribeReasonCode,
};
use tokio::{runtime::Handle, sync::watch, sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{ActionListener, AsyncMqttClient, ClientError, MessageListener};
use crate::{
    error::OperationError, message::Message, options::ConnectOptions, state::ConnectionState,
    token::Token,
};

const DEFAULT_REQUEST_CAPACITY: usize = 10;
const ALPN_PROPERTY: &str = "alpn";

/// Production client: one broker endpoint, one connection at a time.
pub struct RumqttClient {
    client_id: String,
    host: String,
    port: u16,
    request_capacity: usize,
    session: Mutex<Option<Session>>,
    shared: Arc<Shared>,
}

struct Session {
    client: AsyncClient,
    runtime: Handle,
    driver: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Session {
    fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|driver| !driver.is_finished())
    }
}

impl RumqttClient {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            session: Mutex::new(None),
            shared: Arc::new(Shared::new()),
        }
    }

    /// Creates a client with a random `mqtt-channels-<uuid>` client id.
    pub fn with_generated_id(host: impl Into<String>, port: u16) -> Self {
        Self::new(
            format!("mqtt-channels-{}", Uuid::new_v4().simple()),
            host,
            port,
        )
    }

    /// Capacity of the request queue between callers and the event loop.
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Watches the connection state; the receiver sees the current state
    /// immediately.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    fn mqtt_options(&self, options: &ConnectOptions) -> MqttOptions {
        let mut mqtt = MqttOptions::new(&self.client_id, &self.host, self.port);

        if let Some(keep_alive) = options.keep_alive() {
            mqtt.set_keep_alive(whole_seconds(keep_alive));
        }
        match (options.username(), options.password()) {
            (Some(username), password) => {
                mqtt.set_credentials(username, password.unwrap_or_default());
            }
            (None, Some(password)) => {
                mqtt.set_credentials("", password);
            }
            (None, None) => {}
        }
        if let Some(clean_session) = options.clean_session() {
            mqtt.set_clean_session(clean_session);
        }

        match options.socket_factory() {
            Some(factory) => {
                let mut factory = factory.clone();
                for (key, value) in options.tls_properties() {
                    if key == ALPN_PROPERTY {
                        let protocols = value
                            .split(',')
                            .map(str::trim)
                            .filter(|p| !p.is_empty())
                            .map(|p| p.as_bytes().to_vec())
                            .collect();
                        factory = factory.with_alpn(protocols);
                    } else {
                        debug!("Ignoring unsupported TLS property '{}'", key);
                    }
                }
                mqtt.set_transport(factory.transport());
            }
            None if !options.tls_properties().is_empty() => {
                debug!("TLS properties set without a socket factory, ignoring them");
            }
            None => {}
        }

        mqtt
    }

    /// Queues `request` and hands it to the event loop with `send`.
    ///
    /// The queue lock is held across both steps so queue order always equals
    /// the order requests reach the event loop.
    fn issue<F>(
        &self,
        request: Request,
        listener: Arc<dyn ActionListener>,
        send: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(&AsyncClient) -> Result<(), rumqttc::ClientError>,
    {
        let session = lock(&self.session);
        let session = session
            .as_ref()
            .filter(|session| session.is_running())
            .ok_or(ClientError::NotConnected)?;

        let mut tracker = lock(&self.shared.tracker);
        tracker.queue.push_back(Tracked { request, listener });
        if let Err(e) = send(&session.client) {
            tracker.queue.pop_back();
            return Err(e.into());
        }
        Ok(())
    }
}

impl AsyncMqttClient for RumqttClient {
    fn connect(
        &self,
        options: ConnectOptions,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError> {
        let runtime = Handle::try_current()
            .map_err(|e| ClientError::Setup(format!("no tokio runtime: {e}")))?;

        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(Session::is_running) {
            return Err(ClientError::AlreadyConnected);
        }

        let (client, mut event_loop) =
            AsyncClient::new(self.mqtt_options(&options), self.request_capacity);
        if let Some(timeout) = options.connection_timeout() {
            let mut network = NetworkOptions::new();
            network.set_connection_timeout(timeout.as_secs().max(1));
            event_loop.set_network_options(network);
        }

        self.shared.reset();
        *lock(&self.shared.connect) = Some(listener);
        self.shared.set_state(ConnectionState::Connecting);

        info!(
            "Connecting to {}:{} as {}",
            self.host, self.port, self.client_id
        );
        let cancel = CancellationToken::new();
        let driver = runtime.spawn(drive(event_loop, self.shared.clone(), cancel.clone()));

        *session = Some(Session {
            client,
            runtime,
            driver: Some(driver),
            cancel,
        });
        Ok(())
    }

    fn disconnect(
        &self,
        quiesce: Duration,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError> {
        let session = lock(&self.session);
        let session = session
            .as_ref()
            .filter(|session| session.is_running())
            .ok_or(ClientError::NotConnected)?;

        *lock(&self.shared.disconnect) = Some(listener);

        let client = session.client.clone();
        let shared = self.shared.clone();
        session.runtime.spawn(async move {
            if tokio::time::timeout(quiesce, shared.wait_idle()).await.is_err() {
                debug!("Quiesce period elapsed with requests still in flight");
            }
            if let Err(e) = client.try_disconnect() {
                let listener = lock(&shared.disconnect).take();
                if let Some(listener) = listener {
                    let cause = OperationError::Request(e.to_string());
                    listener.on_failure(Token::failure(cause.clone()), cause);
                }
            }
        });
        Ok(())
    }

    fn disconnect_forcibly(&self, quiesce: Duration, disconnect: Duration) {
        let Some(session) = lock(&self.session).take() else {
            debug!("Forcible disconnect without a session");
            return;
        };
        let Session {
            client,
            runtime,
            driver,
            cancel,
        } = session;
        let shared = self.shared.clone();

        runtime.block_on(async move {
            if tokio::time::timeout(quiesce, shared.wait_idle()).await.is_err() {
                debug!("Quiesce period elapsed, disconnecting anyway");
            }
            if let Err(e) = client.try_disconnect() {
                debug!("Could not queue DISCONNECT: {}", e);
            }
            if let Some(mut driver) = driver {
                if tokio::time::timeout(disconnect, &mut driver).await.is_err() {
                    warn!("DISCONNECT not written within {:?}, dropping connection", disconnect);
                    cancel.cancel();
                    driver.abort();
                }
            }
        });

        self.shared.shutdown("Disconnected forcibly");
    }

    fn publish(
        &self,
        topic: &str,
        message: Message,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError> {
        let qos = message.qos();
        let retained = message.is_retained();
        self.issue(Request::Publish { qos }, listener, |client| {
            client.try_publish(topic, qos, retained, message.into_payload())
        })
    }

    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        listener: Arc<dyn ActionListener>,
        messages: Arc<dyn MessageListener>,
    ) -> Result<(), ClientError> {
        // Routed on SUBACK success; retained messages follow it on the same loop
        let request = Request::Subscribe {
            filter: filter.to_string(),
            messages,
        };
        self.issue(request, listener, |client| client.try_subscribe(filter, qos))
    }

    fn unsubscribe(
        &self,
        filter: &str,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError> {
        let request = Request::Unsubscribe {
            filter: filter.to_string(),
        };
        self.issue(request, listener, |client| client.try_unsubscribe(filter))
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.cancel.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PacketKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

enum Request {
    Publish {
        qos: QoS,
    },
    Subscribe {
        filter: String,
        messages: Arc<dyn MessageListener>,
    },
    Unsubscribe {
        filter: String,
    },
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Publish { qos } => f.debug_struct("Publish").field("qos", qos).finish(),
            Request::Subscribe { filter, .. } => {
                f.debug_struct("Subscribe").field("filter", filter).finish()
            }
            Request::Unsubscribe { filter } => {
                f.debug_struct("Unsubscribe").field("filter", filter).finish()
            }
        }
    }
}

impl Request {
    fn kind(&self) -> PacketKind {
        match self {
            Request::Publish { .. } => PacketKind::Publish,
            Request::Subscribe { .. } => PacketKind::Subscribe,
            Request::Unsubscribe { .. } => PacketKind::Unsubscribe,
        }
    }
}

struct Tracked {
    request: Request,
    listener: Arc<dyn ActionListener>,
}

#[derive(Default)]
struct Tracker {
    queue: VecDeque<Tracked>,
    inflight: HashMap<(PacketKind, u16), Tracked>,
}

impl Tracker {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.inflight.is_empty()
    }
}

struct Route {
    filter: String,
    listener: Arc<dyn MessageListener>,
}

enum Flow {
    Continue,
    Stop,
}

/// State shared between the client handle and its driver task.
struct Shared {
    tracker: Mutex<Tracker>,
    idle: Notify,
    routes: RwLock<Vec<Route>>,
    connect: Mutex<Option<Arc<dyn ActionListener>>>,
    disconnect: Mutex<Option<Arc<dyn ActionListener>>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            tracker: Mutex::new(Tracker::default()),
            idle: Notify::new(),
            routes: RwLock::new(Vec::new()),
            connect: Mutex::new(None),
            disconnect: Mutex::new(None),
            state_tx,
        }
    }

    fn reset(&self) {
        *lock(&self.tracker) = Tracker::default();
        *lock(&self.disconnect) = None;
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            info!("Connection state changed to: {}", state);
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.tracker).is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn add_route(&self, filter: &str, listener: Arc<dyn MessageListener>) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|route| route.filter != filter);
        routes.push(Route {
            filter: filter.to_string(),
            listener,
        });
    }

    fn remove_route(&self, filter: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|route| route.filter != filter);
    }

    fn route(&self, publish: Publish) {
        let listeners: Vec<_> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|route| matches(&publish.topic, &route.filter))
            .map(|route| route.listener.clone())
            .collect();

        if listeners.is_empty() {
            trace!("No route for publish on {}", publish.topic);
            return;
        }

        let topic = publish.topic.clone();
        let message = Message::from(publish);
        for listener in listeners {
            listener.message_arrived(&topic, message.clone());
        }
    }

    /// Moves the oldest queued request of `kind` to in-flight once the event
    /// loop reports it written.
    fn dequeue(&self, kind: PacketKind, pkid: u16) {
        let mut tracker = lock(&self.tracker);
        if tracker.queue.front().map(|t| t.request.kind()) != Some(kind) {
            trace!("Untracked outgoing {:?} {}", kind, pkid);
            return;
        }
        let Some(tracked) = tracker.queue.pop_front() else {
            return;
        };

        if let Request::Publish {
            qos: QoS::AtMostOnce,
        } = tracked.request
        {
            if tracker.is_idle() {
                self.idle.notify_waiters();
            }
            drop(tracker);
            tracked.listener.on_success(Token::success());
            return;
        }

        tracker.inflight.insert((kind, pkid), tracked);
    }

    fn take_inflight(&self, kind: PacketKind, pkid: u16) -> Option<Tracked> {
        let mut tracker = lock(&self.tracker);
        let tracked = tracker.inflight.remove(&(kind, pkid));
        if tracker.is_idle() {
            self.idle.notify_waiters();
        }
        if tracked.is_none() {
            debug!("Acknowledgement for unknown {:?} {}", kind, pkid);
        }
        tracked
    }

    fn acknowledge(&self, kind: PacketKind, pkid: u16) {
        if let Some(tracked) = self.take_inflight(kind, pkid) {
            let token = Token::pending().with_message_id(pkid).completed();
            tracked.listener.on_success(token);
        }
    }

    fn subscribe_acknowledged(&self, pkid: u16, return_codes: Vec<SubscribeReasonCode>) {
        let Some(tracked) = self.take_inflight(PacketKind::Subscribe, pkid) else {
            return;
        };
        let Request::Subscribe { filter, messages } = &tracked.request else {
            return;
        };

        let granted: Option<Vec<QoS>> = return_codes
            .iter()
            .map(|code| match code {
                SubscribeReasonCode::Success(qos) => Some(*qos),
                SubscribeReasonCode::Failure => None,
            })
            .collect();

        let token = Token::pending().with_message_id(pkid);
        match granted {
            Some(granted) => {
                debug!("Subscribed to {} with {:?}", filter, granted);
                self.add_route(filter, messages.clone());
                tracked.listener.on_success(token.with_granted_qos(granted).completed());
            }
            None => {
                warn!("Broker rejected subscription to {}", filter);
                let cause = OperationError::SubscriptionRejected(filter.clone());
                tracked.listener.on_failure(token.failed(cause.clone()), cause);
            }
        }
    }

    fn unsubscribe_acknowledged(&self, pkid: u16) {
        let Some(tracked) = self.take_inflight(PacketKind::Unsubscribe, pkid) else {
            return;
        };
        if let Request::Unsubscribe { filter } = &tracked.request {
            debug!("Unsubscribed from {}", filter);
            self.remove_route(filter);
        }
        let token = Token::pending().with_message_id(pkid).completed();
        tracked.listener.on_success(token);
    }

    fn handle_event(&self, event: Event) -> Flow {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    let cause = OperationError::ConnectionRefused(format!("{:?}", ack.code));
                    self.fail_connect(cause);
                    self.shutdown(&format!("Connection refused: {:?}", ack.code));
                    return Flow::Stop;
                }
                info!("Connection established successfully.");
                self.set_state(ConnectionState::Connected);
                let listener = lock(&self.connect).take();
                if let Some(listener) = listener {
                    listener.on_success(Token::success());
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => self.acknowledge(PacketKind::Publish, ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => {
                self.acknowledge(PacketKind::Publish, comp.pkid)
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                self.subscribe_acknowledged(ack.pkid, ack.return_codes)
            }
            Event::Incoming(Packet::UnsubAck(ack)) => self.unsubscribe_acknowledged(ack.pkid),
            Event::Incoming(Packet::Publish(publish)) => self.route(publish),
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.shutdown("Disconnected by broker");
                return Flow::Stop;
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.dequeue(PacketKind::Publish, pkid),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.dequeue(PacketKind::Subscribe, pkid)
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                self.dequeue(PacketKind::Unsubscribe, pkid)
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                let listener = lock(&self.disconnect).take();
                if let Some(listener) = listener {
                    listener.on_success(Token::success());
                }
                self.shutdown("Disconnected by client");
                return Flow::Stop;
            }
            other => trace!("MQTT event: {:?}", other),
        }
        Flow::Continue
    }

    fn handle_error(&self, err: &ConnectionError) {
        let message = get_error_message(err);
        if is_fatal_error(err) {
            error!("Fatal connection error: {}", message);
        } else {
            warn!("Connection error: {}", message);
        }

        let cause = match err {
            ConnectionError::ConnectionRefused(code) => {
                OperationError::ConnectionRefused(format!("{code:?}"))
            }
            _ => OperationError::Connection(message.clone()),
        };
        self.fail_connect(cause);
        self.shutdown(&message);
    }

    fn fail_connect(&self, cause: OperationError) {
        let listener = lock(&self.connect).take();
        if let Some(listener) = listener {
            listener.on_failure(Token::failure(cause.clone()), cause);
        }
    }

    /// Fails everything still pending and drops all routes. Idempotent.
    fn shutdown(&self, reason: &str) {
        let tracker = std::mem::take(&mut *lock(&self.tracker));
        self.idle.notify_waiters();

        let lost = OperationError::ConnectionLost;
        for tracked in tracker.queue {
            tracked
                .listener
                .on_failure(Token::failure(lost.clone()), lost.clone());
        }
        for ((_, pkid), tracked) in tracker.inflight {
            let token = Token::pending().with_message_id(pkid).failed(lost.clone());
            tracked.listener.on_failure(token, lost.clone());
        }
        let waiting = [lock(&self.connect).take(), lock(&self.disconnect).take()];
        for listener in waiting.into_iter().flatten() {
            listener.on_failure(Token::failure(lost.clone()), lost.clone());
        }

        let routes = std::mem::take(
            &mut *self.routes.write().unwrap_or_else(PoisonError::into_inner),
        );
        if !routes.is_empty() {
            debug!("Closing {} subscription routes", routes.len());
        }

        if !matches!(&*self.state_tx.borrow(), ConnectionState::Disconnected(_)) {
            self.set_state(ConnectionState::Disconnected(reason.to_string()));
        }
    }
}

/// Truncates to whole seconds as rumqttc requires, keeping a sub-second
/// interval at one second instead of disabling keep-alive.
fn whole_seconds(keep_alive: Duration) -> Duration {
    if !keep_alive.is_zero() && keep_alive.as_secs() == 0 {
        warn!(
            "Keep-alive of {:?} is below one second, using 1s",
            keep_alive
        );
        return Duration::from_secs(1);
    }
    Duration::from_secs(keep_alive.as_secs())
}

async fn drive(mut event_loop: EventLoop, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Driver cancelled, dropping connection");
                shared.shutdown("Connection dropped");
                return;
            }

            event = event_loop.poll() => match event {
                Ok(event) => {
                    if let Flow::Stop = shared.handle_event(event) {
                        return;
                    }
                }
                Err(e) => {
                    shared.handle_error(&e);
                    return;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    // Retrying cannot succeed without a configuration change
    Fatal,
    Transient,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Transient,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Transient,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Transient,
        },

        #[allow(unreachable_patterns)]
        _ => Transient,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io;

    use rumqttc::{ConnAck, PubAck, PubComp, SubAck, UnsubAck};
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        outcomes: Mutex<Vec<Result<Token, OperationError>>>,
    }

    impl Recorder {
        fn outcomes(&self) -> Vec<Result<Token, OperationError>> {
            lock(&self.outcomes).clone()
        }
    }

    impl ActionListener for Recorder {
        fn on_success(&self, token: Token) {
            lock(&self.outcomes).push(Ok(token));
        }

        fn on_failure(&self, _token: Token, cause: OperationError) {
            lock(&self.outcomes).push(Err(cause));
        }
    }

    #[derive(Default)]
    struct Inbox {
        messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MessageListener for Inbox {
        fn message_arrived(&self, topic: &str, message: Message) {
            lock(&self.messages).push((topic.to_string(), message.into_payload()));
        }
    }

    struct Channel(mpsc::UnboundedSender<Result<Token, OperationError>>);

    impl ActionListener for Channel {
        fn on_success(&self, token: Token) {
            let _ = self.0.send(Ok(token));
        }

        fn on_failure(&self, _token: Token, cause: OperationError) {
            let _ = self.0.send(Err(cause));
        }
    }

    fn track(shared: &Shared, request: Request, listener: Arc<Recorder>) {
        lock(&shared.tracker).queue.push_back(Tracked { request, listener });
    }

    #[test]
    fn test_qos0_publish_completes_when_written() {
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        track(
            &shared,
            Request::Publish {
                qos: QoS::AtMostOnce,
            },
            recorder.clone(),
        );

        shared.handle_event(Event::Outgoing(Outgoing::Publish(0)));

        let outcomes = recorder.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().unwrap().is_success());
        assert!(lock(&shared.tracker).is_idle());
    }

    #[test]
    fn test_acks_complete_matching_requests() {
        let shared = Shared::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        track(
            &shared,
            Request::Publish {
                qos: QoS::AtLeastOnce,
            },
            first.clone(),
        );
        track(
            &shared,
            Request::Publish {
                qos: QoS::ExactlyOnce,
            },
            second.clone(),
        );

        shared.handle_event(Event::Outgoing(Outgoing::Publish(1)));
        shared.handle_event(Event::Outgoing(Outgoing::Publish(2)));
        assert!(first.outcomes().is_empty());

        shared.handle_event(Event::Incoming(Packet::PubComp(PubComp { pkid: 2 })));
        shared.handle_event(Event::Incoming(Packet::PubAck(PubAck { pkid: 1 })));

        assert_eq!(first.outcomes()[0].as_ref().unwrap().message_id(), Some(1));
        assert_eq!(second.outcomes()[0].as_ref().unwrap().message_id(), Some(2));
        assert!(lock(&shared.tracker).is_idle());
    }

    #[test]
    fn test_suback_failure_rejects_without_routing() {
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        let everything = Arc::new(Inbox::default());
        let sensors = Arc::new(Inbox::default());
        shared.add_route("#", everything.clone());
        track(
            &shared,
            Request::Subscribe {
                filter: "sensors/+".into(),
                messages: sensors.clone(),
            },
            recorder.clone(),
        );

        shared.handle_event(Event::Outgoing(Outgoing::Subscribe(5)));
        shared.handle_event(Event::Incoming(Packet::SubAck(SubAck {
            pkid: 5,
            return_codes: vec![SubscribeReasonCode::Failure],
        })));

        assert_eq!(
            recorder.outcomes(),
            vec![Err(OperationError::SubscriptionRejected("sensors/+".into()))]
        );
        assert_eq!(shared.routes.read().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_subscription_receives_nothing_before_suback() {
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        let everything = Arc::new(Inbox::default());
        let sensors = Arc::new(Inbox::default());
        shared.add_route("#", everything.clone());
        track(
            &shared,
            Request::Subscribe {
                filter: "sensors/+".into(),
                messages: sensors.clone(),
            },
            recorder.clone(),
        );
        shared.handle_event(Event::Outgoing(Outgoing::Subscribe(6)));

        let early = Publish::new("sensors/temp", QoS::AtMostOnce, b"21.5".to_vec());
        shared.handle_event(Event::Incoming(Packet::Publish(early)));
        assert!(lock(&sensors.messages).is_empty());
        assert_eq!(lock(&everything.messages).len(), 1);

        shared.handle_event(Event::Incoming(Packet::SubAck(SubAck {
            pkid: 6,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        })));
        let retained = Publish::new("sensors/humidity", QoS::AtMostOnce, b"40".to_vec());
        shared.handle_event(Event::Incoming(Packet::Publish(retained)));

        assert_eq!(
            *lock(&sensors.messages),
            vec![("sensors/humidity".to_string(), b"40".to_vec())]
        );
        assert!(recorder.outcomes()[0].is_ok());
    }

    #[test]
    fn test_suback_success_carries_granted_qos() {
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        track(
            &shared,
            Request::Subscribe {
                filter: "a/b".into(),
                messages: Arc::new(Inbox::default()),
            },
            recorder.clone(),
        );

        shared.handle_event(Event::Outgoing(Outgoing::Subscribe(9)));
        shared.handle_event(Event::Incoming(Packet::SubAck(SubAck {
            pkid: 9,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        })));

        let token = recorder.outcomes().remove(0).unwrap();
        assert_eq!(token.granted_qos(), Some(&[QoS::AtLeastOnce][..]));
    }

    #[test]
    fn test_publishes_routed_by_filter_in_order() {
        let shared = Shared::new();
        let sensors = Arc::new(Inbox::default());
        let everything = Arc::new(Inbox::default());
        shared.add_route("sensors/+", sensors.clone());
        shared.add_route("#", everything.clone());

        for (topic, payload) in [("sensors/a", b"1"), ("sensors/b", b"2"), ("other", b"3")] {
            let publish = Publish::new(topic, QoS::AtMostOnce, payload.to_vec());
            shared.handle_event(Event::Incoming(Packet::Publish(publish)));
        }

        assert_eq!(
            *lock(&sensors.messages),
            vec![
                ("sensors/a".to_string(), b"1".to_vec()),
                ("sensors/b".to_string(), b"2".to_vec())
            ]
        );
        assert_eq!(lock(&everything.messages).len(), 3);
    }

    #[test]
    fn test_unsuback_drops_route() {
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        shared.add_route("sensors/+", Arc::new(Inbox::default()));
        track(
            &shared,
            Request::Unsubscribe {
                filter: "sensors/+".into(),
            },
            recorder.clone(),
        );

        shared.handle_event(Event::Outgoing(Outgoing::Unsubscribe(4)));
        shared.handle_event(Event::Incoming(Packet::UnsubAck(UnsubAck { pkid: 4 })));

        assert!(recorder.outcomes()[0].is_ok());
        assert!(shared.routes.read().unwrap().is_empty());
    }

    #[test]
    fn test_connection_loss_fails_everything_pending() {
        let shared = Shared::new();
        let queued = Arc::new(Recorder::default());
        let inflight = Arc::new(Recorder::default());
        shared.add_route("sensors/+", Arc::new(Inbox::default()));
        track(
            &shared,
            Request::Publish {
                qos: QoS::AtLeastOnce,
            },
            inflight.clone(),
        );
        shared.handle_event(Event::Outgoing(Outgoing::Publish(1)));
        track(
            &shared,
            Request::Unsubscribe {
                filter: "x".into(),
            },
            queued.clone(),
        );

        shared.handle_error(&ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        )));

        assert_eq!(inflight.outcomes(), vec![Err(OperationError::ConnectionLost)]);
        assert_eq!(queued.outcomes(), vec![Err(OperationError::ConnectionLost)]);
        assert!(shared.routes.read().unwrap().is_empty());
        assert_eq!(
            *shared.state_tx.borrow(),
            ConnectionState::Disconnected("reset by peer".into())
        );
    }

    #[test]
    fn test_connack_fires_connect_listener() {
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        *lock(&shared.connect) = Some(recorder.clone() as Arc<dyn ActionListener>);

        let ack = ConnAck::new(ConnectReturnCode::Success, false);
        shared.handle_event(Event::Incoming(Packet::ConnAck(ack)));

        assert!(recorder.outcomes()[0].is_ok());
        assert!(shared.state_tx.borrow().is_connected());
    }

    #[test]
    fn test_refused_connection_is_reported() {
        let shared = Shared::new();
        let recorder = Arc::new(Recorder::default());
        *lock(&shared.connect) = Some(recorder.clone() as Arc<dyn ActionListener>);

        shared.handle_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized,
        ));

        assert_eq!(
            recorder.outcomes(),
            vec![Err(OperationError::ConnectionRefused("NotAuthorized".into()))]
        );
    }

    #[tokio::test]
    async fn test_wait_idle_returns_once_drained() {
        let shared = Arc::new(Shared::new());
        let recorder = Arc::new(Recorder::default());
        track(
            &shared,
            Request::Publish {
                qos: QoS::AtLeastOnce,
            },
            recorder,
        );
        shared.handle_event(Event::Outgoing(Outgoing::Publish(1)));

        let waiter = tokio::spawn({
            let shared = shared.clone();
            async move { shared.wait_idle().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shared.handle_event(Event::Incoming(Packet::PubAck(PubAck { pkid: 1 })));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_sub_second_keep_alive_stays_enabled() {
        let client = RumqttClient::new("keep-alive", "localhost", 1883);
        let cases = [
            (Duration::from_millis(500), Duration::from_secs(1)),
            (Duration::from_millis(2500), Duration::from_secs(2)),
            (Duration::ZERO, Duration::ZERO),
        ];

        for (requested, applied) in cases {
            let options = ConnectOptions::new().with_keep_alive(requested);
            assert_eq!(client.mqtt_options(&options).keep_alive(), applied);
        }
    }

    #[test]
    fn test_fatal_error_classification() {
        let refused = ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(!is_fatal_error(&refused));

        let denied = ConnectionError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(is_fatal_error(&denied));

        let auth = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(is_fatal_error(&auth));
    }

    #[test]
    fn test_connect_requires_runtime() {
        let client = RumqttClient::new("test", "localhost", 1883);
        let err = client
            .connect(ConnectOptions::new(), Arc::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(err, ClientError::Setup(_)));
    }

    #[test]
    fn test_requests_before_connect_are_refused() {
        let client = RumqttClient::with_generated_id("localhost", 1883);
        assert!(client.client_id().starts_with("mqtt-channels-"));

        let err = client
            .publish("a/b", Message::new(vec![1]), Arc::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_token() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = RumqttClient::new("closed-port", "127.0.0.1", port);
        let mut state_rx = client.subscribe_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .connect(
                ConnectOptions::new().with_connection_timeout(Duration::from_secs(2)),
                Arc::new(Channel(tx)),
            )
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(OperationError::Connection(_))));

        state_rx
            .wait_for(|state| matches!(state, ConnectionState::Disconnected(_)))
            .await
            .unwrap();
    }
}
