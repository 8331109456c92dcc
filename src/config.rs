//! Settings shared by the dispatch core

use std::time::Duration;

use thiserror::Error;

/// Default number of messages a dispatcher queue may hold
pub const DEFAULT_PENDING_MESSAGE_LIMIT: usize = 512 * 1024;
/// Default number of payload bytes a dispatcher queue may hold
pub const DEFAULT_PENDING_BYTE_LIMIT: usize = 64 * 1024 * 1024;

/// Invalid configuration values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
	/// A duration that must be positive is zero
	#[error("{field} must be greater than zero")]
	ZeroDuration {
		/// Name of the offending setting
		field: &'static str,
	},
}

/// Dispatch behaviour settings
#[derive(Debug, Clone)]
pub struct DispatchSettings {
	/// How long the delivery loop waits for a message before re-checking
	/// whether it should keep running
	pub wait_for_message: Duration,
	/// Minimum time between two purges of stale queued messages
	pub request_cleanup_interval: Duration,
	/// Maximum queued messages per dispatcher, 0 for no limit
	pub pending_message_limit: usize,
	/// Maximum queued bytes per dispatcher, 0 for no limit
	pub pending_byte_limit: usize,
	/// Timeout used when draining all dispatchers of a connection
	pub drain_timeout: Duration,
}

impl Default for DispatchSettings {
	fn default() -> Self {
		Self {
			wait_for_message: Duration::from_secs(5 * 60),
			request_cleanup_interval: Duration::from_secs(5),
			pending_message_limit: DEFAULT_PENDING_MESSAGE_LIMIT,
			pending_byte_limit: DEFAULT_PENDING_BYTE_LIMIT,
			drain_timeout: Duration::from_secs(30),
		}
	}
}

impl DispatchSettings {
	/// Checks that every setting is usable
	pub fn validate(&self) -> Result<(), ConfigError> {
		let durations = [
			("wait_for_message", self.wait_for_message),
			("request_cleanup_interval", self.request_cleanup_interval),
			("drain_timeout", self.drain_timeout),
		];
		for (field, value) in durations {
			if value.is_zero() {
				return Err(ConfigError::ZeroDuration { field });
			}
		}
		Ok(())
	}

	/// Sets both pending limits
	pub fn with_pending_limits(self, messages: usize, bytes: usize) -> Self {
		Self {
			pending_message_limit: messages,
			pending_byte_limit: bytes,
			..self
		}
	}
}
