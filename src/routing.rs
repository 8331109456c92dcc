//! Message routing and subscription management module
//!
//! This module holds the asynchronous dispatch core: the delivery queue,
//! the subscription bookkeeping and the dispatcher whose delivery task
//! hands queued messages to handlers.

/// Routing and dispatch error types
pub mod error;
pub mod dispatcher;
pub mod handler;
pub mod message_queue;
pub mod subscription;
pub mod subscription_builder;


pub use dispatcher::Dispatcher;
pub use error::{
	ConnectionError, DeliveryError, DeliveryErrorKind, DispatchError, PushError,
	QueueError,
};
pub use handler::{
	shared_handler, HandlerError, HandlerResult, MessageHandler, SharedHandler,
};
pub use message_queue::MessageQueue;
pub use subscription::{
	Sid, Subscription, SubscriptionFactory, SubscriptionHandle,
};
pub use subscription_builder::SubscriptionBuilder;
