//! Operation tokens and the single-value result channel that carries them.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use rumqttc::QoS;
use tokio::sync::oneshot;

use crate::error::OperationError;

/// Outcome of a one-shot asynchronous operation.
///
/// A token observed through a [`TokenFuture`] is always complete. It is
/// successful if and only if it carries no failure cause.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    complete: bool,
    cause: Option<OperationError>,
    granted_qos: Option<Vec<QoS>>,
    message_id: Option<u16>,
}

impl Token {
    /// A token that is still in progress. Clients create these when an
    /// operation is issued; the bridge only ever forwards completed ones.
    pub fn pending() -> Self {
        Self {
            complete: false,
            cause: None,
            granted_qos: None,
            message_id: None,
        }
    }

    pub fn success() -> Self {
        Self {
            complete: true,
            ..Self::pending()
        }
    }

    pub fn failure(cause: OperationError) -> Self {
        Self {
            complete: true,
            cause: Some(cause),
            ..Self::pending()
        }
    }

    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_granted_qos(mut self, granted: Vec<QoS>) -> Self {
        self.granted_qos = Some(granted);
        self
    }

    /// Marks the token complete and attaches a failure cause.
    pub(crate) fn failed(mut self, cause: OperationError) -> Self {
        self.complete = true;
        self.cause = Some(cause);
        self
    }

    pub(crate) fn completed(mut self) -> Self {
        self.complete = true;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_success(&self) -> bool {
        self.complete && self.cause.is_none()
    }

    pub fn is_failure(&self) -> bool {
        self.cause.is_some()
    }

    pub fn cause(&self) -> Option<&OperationError> {
        self.cause.as_ref()
    }

    /// QoS levels granted by the broker, one per filter (subscribe only).
    pub fn granted_qos(&self) -> Option<&[QoS]> {
        self.granted_qos.as_deref()
    }

    pub fn message_id(&self) -> Option<u16> {
        self.message_id
    }
}

/// Single-value result channel of a one-shot operation.
///
/// Resolves exactly once with the operation's token. If the client releases
/// the listener without completing it, the future resolves to a failed token
/// with [`OperationError::Abandoned`]. Once the token has been handed out
/// the channel is spent: `try_take` returns `None` and the future never
/// resolves again.
#[derive(Debug)]
#[must_use = "the token future resolves with the operation outcome"]
pub struct TokenFuture {
    operation: &'static str,
    rx: Option<oneshot::Receiver<Token>>,
}

impl TokenFuture {
    pub(crate) fn new(operation: &'static str, rx: oneshot::Receiver<Token>) -> Self {
        Self {
            operation,
            rx: Some(rx),
        }
    }

    /// Name of the operation this future reports on.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Takes the token if the operation has already completed.
    pub fn try_take(&mut self) -> Option<Token> {
        let token = match self.rx.as_mut()?.try_recv() {
            Ok(token) => token,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Token::failure(OperationError::Abandoned),
        };
        self.rx = None;
        Some(token)
    }

    /// Whether the token has already been handed out.
    pub fn is_spent(&self) -> bool {
        self.rx.is_none()
    }
}

impl Future for TokenFuture {
    type Output = Token;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Token> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Pending;
        };
        let token = match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(token)) => token,
            Poll::Ready(Err(_)) => Token::failure(OperationError::Abandoned),
            Poll::Pending => return Poll::Pending,
        };
        self.rx = None;
        Poll::Ready(token)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_success_predicate_follows_cause() {
        assert!(Token::success().is_success());
        assert!(!Token::success().is_failure());

        let failed = Token::failure(OperationError::ConnectionLost);
        assert!(failed.is_complete());
        assert!(failed.is_failure());
        assert!(!failed.is_success());
        assert_eq!(failed.cause(), Some(&OperationError::ConnectionLost));
    }

    #[test]
    fn test_pending_token_is_not_success() {
        let token = Token::pending();
        assert!(!token.is_complete());
        assert!(!token.is_success());
    }

    #[test]
    fn test_token_metadata() {
        let token = Token::success()
            .with_message_id(7)
            .with_granted_qos(vec![QoS::AtLeastOnce]);
        assert_eq!(token.message_id(), Some(7));
        assert_eq!(token.granted_qos(), Some(&[QoS::AtLeastOnce][..]));
    }

    #[tokio::test]
    async fn test_future_resolves_with_sent_token() {
        let (tx, rx) = oneshot::channel();
        let future = TokenFuture::new("publish", rx);
        assert_eq!(future.operation(), "publish");

        tx.send(Token::success().with_message_id(3)).unwrap();
        let token = future.await;
        assert_eq!(token.message_id(), Some(3));
    }

    #[tokio::test]
    async fn test_dropped_sender_resolves_as_abandoned() {
        let (tx, rx) = oneshot::channel::<Token>();
        drop(tx);

        let token = TokenFuture::new("connect", rx).await;
        assert_eq!(token.cause(), Some(&OperationError::Abandoned));
    }

    #[test]
    fn test_try_take_before_and_after_completion() {
        let (tx, rx) = oneshot::channel();
        let mut future = TokenFuture::new("unsubscribe", rx);
        assert!(future.try_take().is_none());

        tx.send(Token::success()).unwrap();
        assert!(future.try_take().unwrap().is_success());
    }

    #[test]
    fn test_try_take_yields_one_token_only() {
        let (tx, rx) = oneshot::channel();
        let mut future = TokenFuture::new("publish", rx);
        tx.send(Token::success().with_message_id(9)).unwrap();

        assert_eq!(future.try_take().unwrap().message_id(), Some(9));
        assert!(future.is_spent());
        assert!(future.try_take().is_none());
        assert!(future.try_take().is_none());
    }

    #[test]
    fn test_abandoned_token_is_reported_once() {
        let (tx, rx) = oneshot::channel::<Token>();
        let mut future = TokenFuture::new("connect", rx);
        drop(tx);

        assert_eq!(
            future.try_take().unwrap().cause(),
            Some(&OperationError::Abandoned)
        );
        assert!(future.try_take().is_none());
    }

    #[tokio::test]
    async fn test_polling_spent_future_stays_pending() {
        let (tx, rx) = oneshot::channel();
        let mut future = TokenFuture::new("unsubscribe", rx);
        tx.send(Token::success()).unwrap();
        assert!(future.try_take().is_some());

        let polled = tokio::time::timeout(Duration::from_millis(20), &mut future).await;
        assert!(polled.is_err());
    }
}
