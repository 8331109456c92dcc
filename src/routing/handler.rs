//! Message handler abstraction
//!
//! A handler is any `Fn(Message) -> impl Future<Output = HandlerResult>`.
//! Handlers of one dispatcher never run concurrently, so they can share
//! state without extra locking.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::message::Message;

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of one handler invocation
pub type HandlerResult = Result<(), HandlerError>;

/// Callback invoked by a dispatcher's delivery loop
pub trait MessageHandler: Send + Sync + 'static {
	/// Handles one message
	fn on_message(&self, message: Message) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> MessageHandler for F
where
	F: Fn(Message) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	fn on_message(&self, message: Message) -> BoxFuture<'static, HandlerResult> {
		Box::pin(self(message))
	}
}

/// Shared handler as stored by dispatchers
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Boxes a handler for storage
pub fn shared_handler(handler: impl MessageHandler) -> SharedHandler {
	Arc::new(handler)
}
