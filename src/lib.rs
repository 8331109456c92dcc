//! # NATS Dispatch
//!
//! The asynchronous dispatch core of a NATS-style publish/subscribe client:
//! a delivery queue, dispatchers that run message handlers on their own
//! task, and the subscription bookkeeping tying them to a connection.
//!
//! ## Features
//!
//! - **Ordered delivery**: one delivery task per dispatcher, handlers see
//!   messages in arrival order and never run concurrently
//! - **Default and per-subscription handlers**: subject-keyed default
//!   subscriptions alongside SID-keyed handler subscriptions
//! - **Auto-unsubscribe**: stop after a given number of deliveries
//! - **Graceful drain**: unsubscribe on the wire, finish the backlog, then
//!   release the dispatcher
//! - **Slow-consumer protection**: pending message and byte limits
//! - **Error isolation**: failing or panicking handlers are reported to an
//!   [`ErrorListener`] and delivery continues
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use nats_dispatch::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = LocalConnection::new(
//!         DispatchSettings::default(),
//!         Arc::new(LoggingErrorListener),
//!     )?;
//!     let dispatcher = connection.create_dispatcher()?;
//!
//!     dispatcher.subscribe_with("sensors.*", |msg: Message| async move {
//!         println!("{}: {} bytes", msg.subject(), msg.payload().len());
//!         Ok::<(), HandlerError>(())
//!     })?;
//!
//!     connection.publish(Message::new("sensors.temp", "23.5"))?;
//!     dispatcher.drain(std::time::Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Subject Matching
//!
//! - `*` matches exactly one token (e.g., `sensors.*.temp`)
//! - `>` matches one or more trailing tokens (e.g., `sensors.>`)

#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod listener;
pub mod message;
pub mod routing;
pub mod subject;

// === Core Public API ===
pub use config::DispatchSettings;
pub use connection::{Connection, LocalConnection, WireOp};
pub use listener::{ErrorListener, LoggingErrorListener};
pub use message::{Headers, Message};
pub use routing::{
	Dispatcher, HandlerError, HandlerResult, MessageHandler, Sid,
	Subscription, SubscriptionBuilder, SubscriptionHandle,
};

// === Advanced API ===
pub use routing::{MessageQueue, SubscriptionFactory};

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, routing::DispatchError>;

/// Prelude module for convenient imports
///
/// ```rust
/// use nats_dispatch::prelude::*;
/// ```
pub mod prelude {
	//! Essential types for most applications

	pub use crate::{
		Dispatcher, DispatchSettings, ErrorListener, HandlerError,
		LocalConnection, LoggingErrorListener, Message, Sid, Subscription,
	};
	pub use crate::routing::DispatchError;
}

/// Advanced types for custom connections and subscription types
///
/// ```rust
/// use nats_dispatch::advanced::*;
/// ```
pub mod advanced {
	//! Types for implementing connections and custom subscriptions

	pub use crate::{
		Connection, Headers, MessageHandler, MessageQueue, SubscriptionBuilder,
		SubscriptionFactory, SubscriptionHandle, WireOp,
	};

	pub use crate::listener::{FlowControlSource, Status};
	pub use crate::routing::{shared_handler, SharedHandler};
	pub use crate::subject::{limits, subject_matches, validation};
}

/// Error types used throughout the library
///
/// ```rust
/// use nats_dispatch::errors::*;
/// ```
pub mod errors {
	//! All error types used in the library

	pub use crate::config::ConfigError;
	pub use crate::routing::{
		ConnectionError, DeliveryError, DeliveryErrorKind, DispatchError, PushError,
		QueueError,
	};
	pub use crate::subject::SubjectError;
}
