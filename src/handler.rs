//! Handler contracts
//!
//! The message handler body is supplied by the application; this module
//! only defines the boundary it is invoked across.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::types::Message;

/// A boxed, `Send` future, used for handler return types
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The error type returned by a failed [`MessageHandler`] invocation
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A user-supplied callback invoked for every message delivered to a subscription
///
/// Returning `Err` signals handler failure: the message is requeued and the
/// subscription transitions into backoff.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one delivered message
    fn handle(&self, message: Message) -> BoxFuture<'_, Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(self(message))
    }
}

/// Invoked at most once per message id that exceeds the configured
/// `max_attempts`
pub trait FailedMessageHandler: Send + Sync + 'static {
    /// Called with a message that will receive no further redelivery attempts
    fn failed(&self, message: Message) -> BoxFuture<'_, ()>;
}

impl<F, Fut> FailedMessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn failed(&self, message: Message) -> BoxFuture<'_, ()> {
        Box::pin(self(message))
    }
}

pub(crate) type SharedHandler = Arc<dyn MessageHandler>;
pub(crate) type SharedFailedHandler = Arc<dyn FailedMessageHandler>;
