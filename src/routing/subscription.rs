//! Subscription handles and identifiers

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arcstr::ArcStr;

use super::dispatcher::Dispatcher;

/// Subscription identifier, unique per connection.
///
/// Keys handler-bearing subscriptions and correlates wire-level
/// unsubscribe requests.
#[derive(Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Copy, Clone)]
pub struct Sid(u64);

impl Sid {
	/// Wraps a raw identifier
	pub const fn new(raw: u64) -> Self {
		Self(raw)
	}

	/// Raw identifier as sent on the wire
	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl Display for Sid {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

const NO_LIMIT: u64 = 0;

/// One subject / queue-group registration.
///
/// Created by the connection, which also owns its lifetime; the dispatcher
/// reference is weak and only used for lookups.
#[derive(Debug)]
pub struct Subscription {
	sid: AtomicU64,
	subject: ArcStr,
	queue_group: Option<ArcStr>,
	dispatcher: Weak<Dispatcher>,
	delivered: AtomicU64,
	unsub_limit: AtomicU64,
	active: AtomicBool,
}

impl Subscription {
	/// Creates an active subscription bound to `dispatcher`
	pub fn new(
		sid: Sid,
		subject: impl Into<ArcStr>,
		queue_group: Option<ArcStr>,
		dispatcher: Weak<Dispatcher>,
	) -> Self {
		Self {
			sid: AtomicU64::new(sid.as_u64()),
			subject: subject.into(),
			queue_group,
			dispatcher,
			delivered: AtomicU64::new(0),
			unsub_limit: AtomicU64::new(NO_LIMIT),
			active: AtomicBool::new(true),
		}
	}

	/// Current SID
	pub fn sid(&self) -> Sid {
		Sid(self.sid.load(Ordering::Acquire))
	}

	pub(crate) fn set_sid(&self, sid: Sid) {
		self.sid.store(sid.as_u64(), Ordering::Release);
	}

	/// Subject the subscription was registered for
	pub fn subject(&self) -> &str {
		&self.subject
	}

	/// Queue group, if any
	pub fn queue_group(&self) -> Option<&str> {
		self.queue_group.as_deref()
	}

	/// Owning dispatcher while it is alive
	pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
		self.dispatcher.upgrade()
	}

	/// True if `dispatcher` owns this subscription
	pub fn is_managed_by(&self, dispatcher: &Dispatcher) -> bool {
		std::ptr::eq(self.dispatcher.as_ptr(), dispatcher)
	}

	/// Messages handed to a handler so far
	pub fn delivered_count(&self) -> u64 {
		self.delivered.load(Ordering::Acquire)
	}

	pub(crate) fn increment_delivered(&self) -> u64 {
		self.delivered.fetch_add(1, Ordering::AcqRel) + 1
	}

	/// Sets the auto-unsubscribe limit
	pub fn set_unsub_limit(&self, max: u64) {
		self.unsub_limit.store(max, Ordering::Release);
	}

	/// Auto-unsubscribe limit, if one is set
	pub fn unsub_limit(&self) -> Option<u64> {
		match self.unsub_limit.load(Ordering::Acquire) {
			| NO_LIMIT => None,
			| max => Some(max),
		}
	}

	/// True once the delivered count reached the auto-unsubscribe limit
	pub fn reached_unsub_limit(&self) -> bool {
		self.unsub_limit()
			.is_some_and(|max| self.delivered_count() >= max)
	}

	/// False once unsubscribed, limited out, or closed with its dispatcher
	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}

	pub(crate) fn invalidate(&self) {
		self.active.store(false, Ordering::Release);
	}
}

/// A subscription handle as seen by callers of
/// [`Dispatcher::unsubscribe_handle`].
///
/// Only [`Subscription`] is known to dispatchers; other implementations
/// are rejected as invalid arguments.
pub trait SubscriptionHandle: Send + Sync {
	/// Subject of the subscription
	fn subject(&self) -> &str;

	/// Dispatcher managing the subscription
	fn dispatcher(&self) -> Option<Arc<Dispatcher>>;

	/// Downcast to the concrete subscription type
	fn as_subscription(&self) -> Option<&Subscription> {
		None
	}
}

impl SubscriptionHandle for Subscription {
	fn subject(&self) -> &str {
		Subscription::subject(self)
	}

	fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
		Subscription::dispatcher(self)
	}

	fn as_subscription(&self) -> Option<&Subscription> {
		Some(self)
	}
}

/// Builds subscriptions for the connection in place of
/// [`Subscription::new`]
pub trait SubscriptionFactory: Send + Sync {
	/// Creates the subscription for a freshly allocated SID
	fn create(
		&self,
		sid: Sid,
		subject: &str,
		queue_group: Option<&str>,
		dispatcher: Weak<Dispatcher>,
	) -> Subscription;
}
