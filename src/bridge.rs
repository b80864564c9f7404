//! Channel façade over a listener-based [`AsyncMqttClient`].
//!
//! Every bridge call registers listeners with the client and returns at once:
//!
//! | Operation | Returns | Resolves |
//! |-----------|---------|----------|
//! | `connect` / `unsubscribe` | [`TokenFuture`] | once, with success or failure |
//! | `publish` | `Result<TokenFuture>` | `Err` if the value cannot be coerced |
//! | `disconnect` | [`Disconnection`] | token, or worker completion when forced |
//! | `subscribe` | [`Subscription`] | one [`Delivery`] per inbound message |
//!
//! Listener callbacks run on the client's I/O task and only perform a
//! non-blocking channel write. A result channel whose receiver was dropped is
//! ignored.

use std::{
    future::poll_fn,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{ready, Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use rumqttc::QoS;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    client::{ActionListener, AsyncMqttClient, ClientError, MessageListener},
    error::{BridgeError, OperationError},
    message::{coerce, Message, Value},
    options::ConnectOptions,
    token::{Token, TokenFuture},
};

const DEFAULT_QUIESCE_TIMEOUT: Duration = Duration::from_millis(30_000);
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Disconnect behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Disconnect on a blocking worker, bounded by both timeouts.
    pub force: bool,
    /// Time in-flight work is given to complete.
    pub quiesce_timeout: Duration,
    /// Time the DISCONNECT itself is given once quiescing ends (forced only).
    pub disconnect_timeout: Duration,
}

impl Default for DisconnectOptions {
    fn default() -> Self {
        Self {
            force: false,
            quiesce_timeout: DEFAULT_QUIESCE_TIMEOUT,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

impl DisconnectOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_quiesce_timeout(mut self, timeout: Duration) -> Self {
        self.quiesce_timeout = timeout;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}

/// Subscription settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscribeOptions {
    pub qos: QoS,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
        }
    }
}

impl SubscribeOptions {
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

/// Outcome channel of a disconnect.
#[derive(Debug)]
pub enum Disconnection {
    /// Completes with the disconnect token.
    Graceful(TokenFuture),
    /// Completes when the blocking worker finishes; it reports no token.
    Forced(JoinHandle<()>),
}

impl Disconnection {
    /// Waits for the disconnect to finish. Forced disconnects yield `None`.
    pub async fn finished(self) -> Option<Token> {
        match self {
            Disconnection::Graceful(future) => Some(future.await),
            Disconnection::Forced(worker) => {
                if let Err(e) = worker.await {
                    warn!("Forced disconnect worker failed: {}", e);
                }
                None
            }
        }
    }
}

/// One inbound message of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    topic: String,
    message: Message,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, message: Message) -> Self {
        Self {
            topic: topic.into(),
            message,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_parts(self) -> (String, Message) {
        (self.topic, self.message)
    }
}

/// Async channel façade over an [`AsyncMqttClient`].
pub struct Bridge<C: ?Sized> {
    client: Arc<C>,
}

impl<C: ?Sized> Clone for Bridge<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<C> Bridge<C>
where
    C: AsyncMqttClient + ?Sized + 'static,
{
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Connects with `options`; the token reports the broker's answer.
    pub fn connect(&self, options: ConnectOptions) -> TokenFuture {
        debug!("Bridge connect");
        let (listener, future) = completion("connect");
        let issued = self.client.connect(options, listener.clone());
        fail_unissued(listener.as_ref(), issued);
        future
    }

    /// Disconnects gracefully, or forcibly on a blocking worker.
    ///
    /// A forced disconnect must be requested from within a tokio runtime.
    pub fn disconnect(&self, options: DisconnectOptions) -> Disconnection {
        if options.force {
            debug!(
                "Bridge forced disconnect (quiesce {:?}, disconnect {:?})",
                options.quiesce_timeout, options.disconnect_timeout
            );
            let client = self.client.clone();
            let worker = tokio::task::spawn_blocking(move || {
                client.disconnect_forcibly(options.quiesce_timeout, options.disconnect_timeout)
            });
            return Disconnection::Forced(worker);
        }

        debug!("Bridge disconnect (quiesce {:?})", options.quiesce_timeout);
        let (listener, future) = completion("disconnect");
        let issued = self
            .client
            .disconnect(options.quiesce_timeout, listener.clone());
        fail_unissued(listener.as_ref(), issued);
        Disconnection::Graceful(future)
    }

    /// Publishes `value` to `topic`.
    ///
    /// # Errors
    /// Fails synchronously if `value` cannot be coerced into a message; see
    /// [`coerce`](crate::message::coerce).
    pub fn publish(&self, topic: &str, value: impl Into<Value>) -> Result<TokenFuture, BridgeError> {
        let message = coerce(value.into())?;
        trace!(
            "Bridge publish to {} ({} bytes, {:?})",
            topic,
            message.payload().len(),
            message.qos()
        );

        let (listener, future) = completion("publish");
        let issued = self.client.publish(topic, message, listener.clone());
        fail_unissued(listener.as_ref(), issued);
        Ok(future)
    }

    /// Subscribes to `topic` and streams its deliveries.
    ///
    /// A rejected subscription ends the stream without yielding anything.
    pub fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Subscription {
        debug!("Bridge subscribe to {} ({:?})", topic, options.qos);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let rejected = Arc::new(Mutex::new(None));

        let action = Arc::new(SubscribeListener {
            topic: topic.to_string(),
            events: events_tx.clone(),
            ack: Mutex::new(Some(ack_tx)),
            rejected: rejected.clone(),
        });
        let messages = Arc::new(DeliveryListener { events: events_tx });

        let issued = self
            .client
            .subscribe(topic, options.qos, action.clone(), messages);
        fail_unissued(action.as_ref(), issued);

        Subscription {
            topic: topic.to_string(),
            rx: events_rx,
            ack: Some(ack_rx),
            rejected,
            rejection: None,
            closed: false,
        }
    }

    /// Unsubscribes from `topic`; the matching subscription stream ends.
    pub fn unsubscribe(&self, topic: &str) -> TokenFuture {
        debug!("Bridge unsubscribe from {}", topic);
        let (listener, future) = completion("unsubscribe");
        let issued = self.client.unsubscribe(topic, listener.clone());
        fail_unissued(listener.as_ref(), issued);
        future
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reports a request the client refused to issue through its listener.
fn fail_unissued(listener: &dyn ActionListener, issued: Result<(), ClientError>) {
    if let Err(e) = issued {
        warn!("Client refused request: {}", e);
        listener.on_failure(Token::pending(), OperationError::Request(e.to_string()));
    }
}

fn completion(operation: &'static str) -> (Arc<CompletionListener>, TokenFuture) {
    let (tx, rx) = oneshot::channel();
    let listener = Arc::new(CompletionListener {
        operation,
        slot: Mutex::new(Some(tx)),
    });
    (listener, TokenFuture::new(operation, rx))
}

/// Single-slot listener: the first completion wins.
struct CompletionListener {
    operation: &'static str,
    slot: Mutex<Option<oneshot::Sender<Token>>>,
}

impl CompletionListener {
    fn complete(&self, token: Token) {
        let sender = lock(&self.slot).take();
        match sender {
            Some(tx) => {
                if tx.send(token).is_err() {
                    trace!("{} result dropped, nobody is waiting", self.operation);
                }
            }
            None => warn!(
                "{} completed more than once, ignoring {:?}",
                self.operation, token
            ),
        }
    }
}

impl ActionListener for CompletionListener {
    fn on_success(&self, token: Token) {
        self.complete(token.completed());
    }

    fn on_failure(&self, token: Token, cause: OperationError) {
        self.complete(token.failed(cause));
    }
}

#[derive(Debug)]
enum SubscriptionEvent {
    Message(Delivery),
    Rejected,
}

/// Action listener of a subscribe: failure ends the stream, success only
/// resolves the acknowledgement.
struct SubscribeListener {
    topic: String,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
    ack: Mutex<Option<oneshot::Sender<Token>>>,
    /// Set before `Rejected` is queued; the stream checks it ahead of
    /// anything still buffered.
    rejected: Arc<Mutex<Option<OperationError>>>,
}

impl SubscribeListener {
    fn acknowledge(&self, token: Token) {
        let sender = lock(&self.ack).take();
        match sender {
            Some(tx) => {
                let _ = tx.send(token);
            }
            None => warn!(
                "subscribe to {} completed more than once, ignoring",
                self.topic
            ),
        }
    }
}

impl ActionListener for SubscribeListener {
    fn on_success(&self, token: Token) {
        self.acknowledge(token.completed());
    }

    fn on_failure(&self, token: Token, cause: OperationError) {
        warn!("Subscription to {} failed: {}", self.topic, cause);
        self.acknowledge(token.failed(cause.clone()));
        lock(&self.rejected).get_or_insert(cause);
        let _ = self.events.send(SubscriptionEvent::Rejected);
    }
}

struct DeliveryListener {
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl MessageListener for DeliveryListener {
    fn message_arrived(&self, topic: &str, message: Message) {
        let delivery = Delivery::new(topic, message);
        if self.events.send(SubscriptionEvent::Message(delivery)).is_err() {
            trace!("Delivery on {} dropped, subscription released", topic);
        }
    }
}

/// Continuous delivery channel of one subscription.
///
/// Yields deliveries in arrival order. Ends after an unsubscribe, on
/// connection loss, or at once if the broker rejects the subscription. A
/// rejected subscription yields nothing, deliveries buffered before the
/// rejection included.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    ack: Option<oneshot::Receiver<Token>>,
    rejected: Arc<Mutex<Option<OperationError>>>,
    rejection: Option<OperationError>,
    closed: bool,
}

impl Subscription {
    /// The topic filter this subscription was made with.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        poll_fn(|cx| self.poll_recv(cx)).await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        if self.closed || self.check_rejected() {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(SubscriptionEvent::Message(delivery)) => {
                if self.check_rejected() {
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(delivery))
            }
            Some(SubscriptionEvent::Rejected) => {
                self.check_rejected();
                self.closed = true;
                self.rx.close();
                Poll::Ready(None)
            }
            None => {
                self.closed = true;
                Poll::Ready(None)
            }
        }
    }

    /// Closes the stream and drops buffered deliveries once a rejection has
    /// been recorded.
    fn check_rejected(&mut self) -> bool {
        let Some(cause) = lock(&self.rejected).take() else {
            return false;
        };
        debug!("Subscription to {} closed: {}", self.topic, cause);
        self.rejection = Some(cause);
        self.closed = true;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        true
    }

    /// Waits for the broker's answer to the subscribe.
    ///
    /// Returns the subscribe token (successful, or failed with its cause) the
    /// first time it is awaited, and `None` afterwards or if the client
    /// released the request without answering it.
    pub async fn acknowledged(&mut self) -> Option<Token> {
        let ack = self.ack.take()?;
        ack.await.ok()
    }

    /// Cause of the rejection, once the stream has ended because of one.
    pub fn rejection(&self) -> Option<&OperationError> {
        self.rejection.as_ref()
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.get_mut().poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription_parts(topic: &str) -> (SubscribeListener, DeliveryListener, Subscription) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let rejected = Arc::new(Mutex::new(None));
        let listener = SubscribeListener {
            topic: topic.into(),
            events: events_tx.clone(),
            ack: Mutex::new(Some(ack_tx)),
            rejected: rejected.clone(),
        };
        let deliveries = DeliveryListener { events: events_tx };
        let subscription = Subscription {
            topic: topic.into(),
            rx: events_rx,
            ack: Some(ack_rx),
            rejected,
            rejection: None,
            closed: false,
        };
        (listener, deliveries, subscription)
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let (listener, future) = completion("publish");
        listener.on_success(Token::pending().with_message_id(1));
        listener.on_failure(Token::pending(), OperationError::ConnectionLost);

        let token = future.await;
        assert!(token.is_success());
        assert_eq!(token.message_id(), Some(1));
    }

    #[tokio::test]
    async fn test_failure_carries_cause() {
        let (listener, future) = completion("connect");
        let cause = OperationError::ConnectionRefused("NotAuthorized".into());
        listener.on_failure(Token::pending(), cause.clone());

        let token = future.await;
        assert!(token.is_complete());
        assert_eq!(token.cause(), Some(&cause));
    }

    #[test]
    fn test_completion_after_receiver_dropped_is_ignored() {
        let (listener, future) = completion("unsubscribe");
        drop(future);
        listener.on_success(Token::pending());
    }

    #[tokio::test]
    async fn test_rejection_ends_stream_and_resolves_ack() {
        let (listener, deliveries, mut subscription) = subscription_parts("sensors/+");

        deliveries.message_arrived("sensors/temp", Message::new(b"21.5".to_vec()));
        let cause = OperationError::SubscriptionRejected("sensors/+".into());
        listener.on_failure(Token::pending(), cause.clone());
        deliveries.message_arrived("sensors/humidity", Message::new(b"40".to_vec()));

        assert!(subscription.recv().await.is_none());
        assert!(subscription.recv().await.is_none());
        assert_eq!(subscription.rejection(), Some(&cause));

        let ack = subscription.acknowledged().await.unwrap();
        assert_eq!(ack.cause(), Some(&cause));
        assert!(subscription.acknowledged().await.is_none());
    }

    #[tokio::test]
    async fn test_deliveries_before_success_are_kept() {
        let (listener, deliveries, mut subscription) = subscription_parts("sensors/+");

        deliveries.message_arrived("sensors/temp", Message::new(b"21.5".to_vec()));
        listener.on_success(Token::pending());
        drop(deliveries);
        drop(listener);

        assert_eq!(subscription.recv().await.unwrap().topic(), "sensors/temp");
        assert!(subscription.recv().await.is_none());
        assert!(subscription.rejection().is_none());
    }

    #[test]
    fn test_disconnect_defaults() {
        let options = DisconnectOptions::default();
        assert!(!options.force);
        assert_eq!(options.quiesce_timeout, Duration::from_secs(30));
        assert_eq!(options.disconnect_timeout, Duration::from_secs(30));
        assert!(DisconnectOptions::forced().force);
    }

    #[test]
    fn test_subscribe_defaults_to_qos0() {
        assert_eq!(SubscribeOptions::default().qos, QoS::AtMostOnce);
    }
}
