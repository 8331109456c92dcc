//! Error listener notification surface
//!
//! The dispatch core only routes handler failures and loop interruptions
//! here; the remaining events are raised by other parts of a client and
//! passed through untouched.

use std::fmt::Display;

use tracing::{error, info, warn};

use crate::message::Message;
use crate::routing::{DeliveryError, Subscription};

/// Server status carried by control messages, passed through opaquely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
	code: u16,
	message: String,
}

impl Status {
	/// Flow control request or idle heartbeat
	pub const FLOW_OR_HEARTBEAT: u16 = 100;

	/// Creates a status
	pub fn new(code: u16, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}

	/// Status code
	pub fn code(&self) -> u16 {
		self.code
	}

	/// Status text
	pub fn message(&self) -> &str {
		&self.message
	}

	/// True for a flow-control request
	pub fn is_flow_control(&self) -> bool {
		self.code == Self::FLOW_OR_HEARTBEAT
			&& self.message.starts_with("FlowControl")
	}

	/// True for an idle heartbeat
	pub fn is_heartbeat(&self) -> bool {
		self.code == Self::FLOW_OR_HEARTBEAT
			&& self.message.starts_with("Idle")
	}
}

impl Display for Status {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} {}", self.code, self.message)
	}
}

/// What triggered a processed flow-control response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlSource {
	/// Explicit flow-control request
	FlowControl,
	/// Heartbeat carrying a flow-control subject
	Heartbeat,
}

/// Sink for asynchronous client events.
///
/// Every method defaults to doing nothing. Implementations must not block:
/// they are called inline from delivery loops and the read path.
pub trait ErrorListener: Send + Sync {
	/// A server or client error string
	fn error_occurred(&self, _error: &str) {}

	/// A failure observed while delivering messages
	fn exception_occurred(&self, _error: &DeliveryError) {}

	/// A dispatcher stopped keeping up and is dropping messages
	fn slow_consumer_detected(&self, _dispatcher_id: &str) {}

	/// A message was dropped instead of queued
	fn message_discarded(&self, _message: &Message) {}

	/// Heartbeats stopped arriving for a stream subscription
	fn heartbeat_alarm(
		&self,
		_subscription: &Subscription,
		_last_stream_sequence: u64,
		_last_consumer_sequence: u64,
	) {
	}

	/// A status message nobody handled
	fn unhandled_status(&self, _subscription: &Subscription, _status: &Status) {
	}

	/// A pull request ended with a warning status
	fn pull_status_warning(
		&self,
		_subscription: &Subscription,
		_status: &Status,
	) {
	}

	/// A pull request ended with an error status
	fn pull_status_error(&self, _subscription: &Subscription, _status: &Status) {
	}

	/// A flow-control response was sent
	fn flow_control_processed(
		&self,
		_subscription: &Subscription,
		_subject: &str,
		_source: FlowControlSource,
	) {
	}

	/// Writing to the socket timed out
	fn socket_write_timeout(&self) {}
}

/// Listener that reports every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorListener;

impl ErrorListener for LoggingErrorListener {
	fn error_occurred(&self, error: &str) {
		error!(error, "Error occurred");
	}

	fn exception_occurred(&self, error: &DeliveryError) {
		error!(error = %error, "Exception occurred");
	}

	fn slow_consumer_detected(&self, dispatcher_id: &str) {
		warn!(dispatcher_id, "Slow consumer detected");
	}

	fn message_discarded(&self, message: &Message) {
		info!(
			subject = message.subject(),
			size = message.size(),
			"Message discarded"
		);
	}

	fn heartbeat_alarm(
		&self,
		subscription: &Subscription,
		last_stream_sequence: u64,
		last_consumer_sequence: u64,
	) {
		error!(
			sid = %subscription.sid(),
			subject = subscription.subject(),
			last_stream_sequence,
			last_consumer_sequence,
			"Heartbeat alarm"
		);
	}

	fn unhandled_status(&self, subscription: &Subscription, status: &Status) {
		warn!(sid = %subscription.sid(), status = %status, "Unhandled status");
	}

	fn pull_status_warning(&self, subscription: &Subscription, status: &Status) {
		warn!(sid = %subscription.sid(), status = %status, "Pull status warning");
	}

	fn pull_status_error(&self, subscription: &Subscription, status: &Status) {
		error!(sid = %subscription.sid(), status = %status, "Pull status error");
	}

	fn flow_control_processed(
		&self,
		subscription: &Subscription,
		subject: &str,
		source: FlowControlSource,
	) {
		info!(
			sid = %subscription.sid(),
			subject,
			source = ?source,
			"Flow control processed"
		);
	}

	fn socket_write_timeout(&self) {
		error!("Socket write timeout");
	}
}
