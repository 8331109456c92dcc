use std::time::Duration;

use arcstr::ArcStr;
use thiserror::Error;

use super::handler::HandlerError;
use crate::message::Message;
use crate::routing::subscription::Sid;
use crate::subject::SubjectError;

/// Errors from the connection when it is asked to register a subscription
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
	/// The connection is closed
	#[error("Connection is closed")]
	Closed,
	/// The connection refused the request
	#[error("Connection refused the request: {0}")]
	Refused(String),
}

/// Errors returned synchronously from dispatcher operations
#[derive(Debug, Error)]
pub enum DispatchError {
	/// Subject or queue group failed validation
	#[error(transparent)]
	InvalidSubject(#[from] SubjectError),

	/// The subscription handle is not an implementation this dispatcher knows
	#[error("This subscription implementation is not known by the dispatcher")]
	UnknownSubscription,

	/// The dispatcher is stopped or was never started
	#[error("Dispatcher is closed")]
	Closed,

	/// The dispatcher is draining and accepts no new subscriptions
	#[error("Dispatcher is draining")]
	Draining,

	/// The subscription belongs to another dispatcher
	#[error("Subscription is not managed by this dispatcher")]
	NotOwner,

	/// The connection could not allocate the subscription
	#[error("Connection error: {0}")]
	Connection(#[from] ConnectionError),
}

impl DispatchError {
	/// True for malformed arguments supplied by the caller
	pub fn is_invalid_argument(&self) -> bool {
		matches!(
			self,
			DispatchError::InvalidSubject(_)
				| DispatchError::UnknownSubscription
		)
	}

	/// True for calls made while the dispatcher is in the wrong state
	pub fn is_illegal_state(&self) -> bool {
		matches!(
			self,
			DispatchError::Closed
				| DispatchError::Draining
				| DispatchError::NotOwner
		)
	}
}

/// Failures observed while delivering, reported to the error listener
#[derive(Debug, Error)]
pub enum DeliveryError {
	/// A handler returned an error
	#[error("Handler for subscription {sid} failed: {source}")]
	Handler {
		/// Subscription the message was delivered for
		sid: Sid,
		/// Error returned by the handler
		#[source]
		source: HandlerError,
	},

	/// A handler panicked
	#[error("Handler for subscription {sid} panicked: {message}")]
	HandlerPanic {
		/// Subscription the message was delivered for
		sid: Sid,
		/// Panic payload rendered as text
		message: String,
	},

	/// The delivery loop was cancelled without a stop request, or panicked
	#[error("Delivery loop of dispatcher {dispatcher_id} was interrupted")]
	Interrupted {
		/// Dispatcher whose loop was interrupted
		dispatcher_id: ArcStr,
	},

	/// Drain did not finish in time
	#[error(
		"Dispatcher {dispatcher_id} did not drain within {}ms",
		.timeout.as_millis()
	)]
	DrainTimeout {
		/// Dispatcher being drained
		dispatcher_id: ArcStr,
		/// Timeout that elapsed
		timeout: Duration,
	},
}

/// Variant of a [`DeliveryError`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryErrorKind {
	/// See [`DeliveryError::Handler`]
	Handler,
	/// See [`DeliveryError::HandlerPanic`]
	HandlerPanic,
	/// See [`DeliveryError::Interrupted`]
	Interrupted,
	/// See [`DeliveryError::DrainTimeout`]
	DrainTimeout,
}

impl DeliveryError {
	/// Which kind of failure this is
	pub fn kind(&self) -> DeliveryErrorKind {
		match self {
			| DeliveryError::Handler { .. } => DeliveryErrorKind::Handler,
			| DeliveryError::HandlerPanic { .. } => {
				DeliveryErrorKind::HandlerPanic
			}
			| DeliveryError::Interrupted { .. } => DeliveryErrorKind::Interrupted,
			| DeliveryError::DrainTimeout { .. } => {
				DeliveryErrorKind::DrainTimeout
			}
		}
	}

	/// Subscription the failure belongs to, for handler failures
	pub fn sid(&self) -> Option<Sid> {
		match self {
			| DeliveryError::Handler { sid, .. }
			| DeliveryError::HandlerPanic { sid, .. } => Some(*sid),
			| DeliveryError::Interrupted { .. }
			| DeliveryError::DrainTimeout { .. } => None,
		}
	}
}

/// Rejected push, handing the message back to the producer
#[derive(Debug, Error)]
pub enum PushError {
	/// Queue is paused for close or drain
	#[error("Queue is paused")]
	Paused(Message),
	/// Pending message or byte limit reached
	#[error("Queue pending limit reached")]
	Full(Message),
}

impl PushError {
	/// Returns the rejected message
	pub fn into_message(self) -> Message {
		match self {
			| PushError::Paused(message) | PushError::Full(message) => message,
		}
	}
}

/// Errors from waiting on the queue
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
	/// The wait was cancelled through its token
	#[error("Wait for message was cancelled")]
	Cancelled,
}
