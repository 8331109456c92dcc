//! Inbound message type
//!
//! A [`Message`] is produced by the connection's read path, owned by a
//! dispatcher's queue until it is popped, and then handed by value to the
//! handler that consumes it.

use std::collections::BTreeMap;
use std::sync::Arc;

use arcstr::ArcStr;
use bytes::Bytes;
use tokio::time::Instant;

use crate::routing::Subscription;

/// Multi-valued message headers, kept in key order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
	entries: BTreeMap<String, Vec<String>>,
}

impl Headers {
	/// Creates an empty header set
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a value for `key`
	pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.entries.entry(key.into()).or_default().push(value.into());
	}

	/// Replaces all values of `key`
	pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.entries.insert(key.into(), vec![value.into()]);
	}

	/// First value stored for `key`
	pub fn first(&self, key: &str) -> Option<&str> {
		self.entries
			.get(key)
			.and_then(|values| values.first())
			.map(String::as_str)
	}

	/// All values stored for `key`
	pub fn get(&self, key: &str) -> Option<&[String]> {
		self.entries.get(key).map(Vec::as_slice)
	}

	/// Number of distinct keys
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// True if no header is set
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Iterates over `(key, values)` pairs
	pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
		self.entries
			.iter()
			.map(|(key, values)| (key.as_str(), values.as_slice()))
	}

	/// Approximate encoded size, used for pending-byte accounting
	pub fn byte_len(&self) -> usize {
		self.entries
			.iter()
			.map(|(key, values)| {
				values.iter().map(|v| key.len() + v.len() + 4).sum::<usize>()
			})
			.sum()
	}
}

/// A message delivered for a subscription
#[derive(Debug, Clone)]
pub struct Message {
	subject: ArcStr,
	reply_to: Option<ArcStr>,
	headers: Option<Headers>,
	payload: Bytes,
	subscription: Option<Arc<Subscription>>,
	expires_at: Option<Instant>,
}

impl Message {
	/// Creates a message with a subject and a payload
	pub fn new(subject: impl Into<ArcStr>, payload: impl Into<Bytes>) -> Self {
		Self {
			subject: subject.into(),
			reply_to: None,
			headers: None,
			payload: payload.into(),
			subscription: None,
			expires_at: None,
		}
	}

	/// Sets the reply subject
	pub fn with_reply_to(self, reply_to: impl Into<ArcStr>) -> Self {
		Self {
			reply_to: Some(reply_to.into()),
			..self
		}
	}

	/// Sets the headers
	pub fn with_headers(self, headers: Headers) -> Self {
		Self {
			headers: Some(headers),
			..self
		}
	}

	/// Marks the message stale after `expires_at`; stale messages are purged
	/// from the queue instead of being delivered.
	pub fn with_expiry(self, expires_at: Instant) -> Self {
		Self {
			expires_at: Some(expires_at),
			..self
		}
	}

	pub(crate) fn for_subscription(self, sub: Arc<Subscription>) -> Self {
		Self {
			subscription: Some(sub),
			..self
		}
	}

	/// Subject the message was published on
	pub fn subject(&self) -> &str {
		&self.subject
	}

	/// Reply subject, if any
	pub fn reply_to(&self) -> Option<&str> {
		self.reply_to.as_deref()
	}

	/// Headers, if any
	pub fn headers(&self) -> Option<&Headers> {
		self.headers.as_ref()
	}

	/// Payload bytes
	pub fn payload(&self) -> &Bytes {
		&self.payload
	}

	/// Subscription this message was delivered for
	pub fn subscription(&self) -> Option<&Arc<Subscription>> {
		self.subscription.as_ref()
	}

	/// Expiry instant, if any
	pub fn expires_at(&self) -> Option<Instant> {
		self.expires_at
	}

	/// True if the expiry instant is set and has passed at `now`
	pub fn is_expired(&self, now: Instant) -> bool {
		self.expires_at.is_some_and(|at| at <= now)
	}

	/// Size used for pending-byte accounting
	pub fn size(&self) -> usize {
		self.subject.len()
			+ self.reply_to.as_ref().map_or(0, |r| r.len())
			+ self.headers.as_ref().map_or(0, Headers::byte_len)
			+ self.payload.len()
	}
}
