//! Connection collaborator contract
//!
//! The dispatch core never talks to a socket. Everything it needs from a
//! connection (SID allocation, subscribe/unsubscribe transmission,
//! invalidation, registry cleanup and error routing) goes through the
//! [`Connection`] trait. [`LocalConnection`] is an in-process
//! implementation used by tests and demos.

mod local;

use std::sync::{Arc, Weak};

pub use local::{LocalConnection, WireOp};

use crate::routing::{
	ConnectionError, DeliveryError, Dispatcher, Sid, Subscription,
	SubscriptionFactory,
};

/// Operations a dispatcher requires from its connection
pub trait Connection: Send + Sync {
	/// Allocates a SID, builds the subscription (through `factory` when
	/// given) and transmits the subscribe request.
	fn create_subscription(
		&self,
		subject: &str,
		queue_group: Option<&str>,
		dispatcher: Weak<Dispatcher>,
		factory: Option<&dyn SubscriptionFactory>,
	) -> Result<Arc<Subscription>, ConnectionError>;

	/// Transmits an unsubscribe and schedules local removal: immediately
	/// when `after` is `None`, otherwise once `after` messages were
	/// delivered. Removal ends in [`Dispatcher::remove`].
	fn unsubscribe(&self, subscription: &Arc<Subscription>, after: Option<u64>);

	/// Transmits an unsubscribe without touching local bookkeeping
	fn send_unsub(&self, subscription: &Subscription, after: Option<u64>);

	/// Replays a subscribe request for an existing registration
	fn send_subscription_message(
		&self,
		sid: Sid,
		subject: &str,
		queue_group: Option<&str>,
	);

	/// Re-registers `subscription` under a fresh SID and returns it
	fn re_subscribe(
		&self,
		subscription: &Arc<Subscription>,
		subject: &str,
		queue_group: Option<&str>,
	) -> Sid;

	/// Removes a subscription right away, e.g. when its delivery limit
	/// was reached
	fn invalidate(&self, subscription: &Arc<Subscription>);

	/// Forgets a drained dispatcher
	fn cleanup_dispatcher(&self, dispatcher: &Dispatcher);

	/// Routes an asynchronous failure to the error listener
	fn process_exception(&self, error: DeliveryError);
}
