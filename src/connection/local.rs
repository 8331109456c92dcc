//! In-process connection
//!
//! Stands in for a socket-backed connection: it allocates SIDs, records
//! every subscribe/unsubscribe it would have transmitted, and routes
//! published messages to matching subscriptions through their
//! dispatchers' queues.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arcstr::ArcStr;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::Connection;
use crate::config::{ConfigError, DispatchSettings};
use crate::listener::ErrorListener;
use crate::message::Message;
use crate::routing::{
	shared_handler, ConnectionError, DeliveryError, Dispatcher,
	MessageHandler, PushError, SharedHandler, Sid, Subscription,
	SubscriptionFactory,
};
use crate::subject::validation::validate_publish_subject;
use crate::subject::{subject_matches, SubjectError};

/// A subscribe or unsubscribe request as it would go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
	/// Subscribe request
	Sub {
		/// Subscription identifier
		sid: Sid,
		/// Subject, possibly with wildcards
		subject: ArcStr,
		/// Queue group, if any
		queue_group: Option<ArcStr>,
	},
	/// Unsubscribe request
	Unsub {
		/// Subscription identifier
		sid: Sid,
		/// Deliveries still allowed, `None` for immediately
		max: Option<u64>,
	},
}

/// In-process implementation of [`Connection`]
pub struct LocalConnection {
	this: Weak<LocalConnection>,
	settings: DispatchSettings,
	listener: Arc<dyn ErrorListener>,
	next_sid: AtomicU64,
	subscriptions: DashMap<Sid, Arc<Subscription>>,
	dispatchers: DashMap<ArcStr, Arc<Dispatcher>>,
	wire: Mutex<Vec<WireOp>>,
	queue_cursor: AtomicUsize,
	connected: AtomicBool,
	closed: AtomicBool,
	shutdown: CancellationToken,
}

impl std::fmt::Debug for LocalConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LocalConnection")
			.field("subscriptions", &self.subscriptions.len())
			.field("dispatchers", &self.dispatchers.len())
			.field("connected", &self.is_connected())
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl LocalConnection {
	/// Creates a connected instance
	pub fn new(
		settings: DispatchSettings,
		listener: Arc<dyn ErrorListener>,
	) -> Result<Arc<Self>, ConfigError> {
		settings.validate()?;
		Ok(Arc::new_cyclic(|this| Self {
			this: this.clone(),
			settings,
			listener,
			next_sid: AtomicU64::new(1),
			subscriptions: DashMap::new(),
			dispatchers: DashMap::new(),
			wire: Mutex::new(Vec::new()),
			queue_cursor: AtomicUsize::new(0),
			connected: AtomicBool::new(true),
			closed: AtomicBool::new(false),
			shutdown: CancellationToken::new(),
		}))
	}

	/// Creates and starts a dispatcher without a default handler
	pub fn create_dispatcher(&self) -> Result<Arc<Dispatcher>, ConnectionError> {
		self.register_dispatcher(None)
	}

	/// Creates and starts a dispatcher with a default handler
	pub fn create_dispatcher_with(
		&self,
		handler: impl MessageHandler,
	) -> Result<Arc<Dispatcher>, ConnectionError> {
		self.register_dispatcher(Some(shared_handler(handler)))
	}

	fn register_dispatcher(
		&self,
		handler: Option<SharedHandler>,
	) -> Result<Arc<Dispatcher>, ConnectionError> {
		if self.is_closed() {
			return Err(ConnectionError::Closed);
		}
		let Some(this) = self.this.upgrade() else {
			return Err(ConnectionError::Closed);
		};
		let connection: Arc<dyn Connection> = this;

		let dispatcher = Dispatcher::new(
			connection,
			handler,
			&self.settings,
			self.shutdown.child_token(),
		);
		let id = ArcStr::from(Uuid::new_v4().simple().to_string());
		self.dispatchers.insert(id.clone(), Arc::clone(&dispatcher));
		dispatcher.start(id);
		Ok(dispatcher)
	}

	/// Stops a dispatcher, unsubscribing all of its subscriptions, and
	/// forgets it
	pub fn close_dispatcher(&self, dispatcher: &Dispatcher) {
		dispatcher.stop(true);
		if let Some(id) = dispatcher.id() {
			self.dispatchers.remove(id);
		}
	}

	/// Drains every registered dispatcher concurrently; true if all of them
	/// finished within the configured drain timeout
	pub async fn drain_dispatchers(&self) -> bool {
		let timeout = self.settings.drain_timeout;
		let drains = self
			.registered_dispatchers()
			.into_iter()
			.map(|dispatcher| async move { dispatcher.drain(timeout).await });
		futures::future::join_all(drains)
			.await
			.into_iter()
			.all(|result| matches!(result, Ok(true)))
	}

	/// Publishes a message to every matching subscription. Returns how many
	/// subscriptions accepted it.
	///
	/// Subscriptions sharing a queue group receive it round-robin, one
	/// member per group.
	pub fn publish(&self, message: Message) -> Result<usize, SubjectError> {
		validate_publish_subject(message.subject())?;
		if !self.is_connected() {
			trace!(subject = message.subject(), "Not connected, publish dropped");
			return Ok(0);
		}

		let mut targets = Vec::new();
		let mut groups: BTreeMap<ArcStr, Vec<Arc<Subscription>>> =
			BTreeMap::new();
		for entry in self.subscriptions.iter() {
			let sub = entry.value();
			if !sub.is_active() || !subject_matches(sub.subject(), message.subject())
			{
				continue;
			}
			match sub.queue_group() {
				| None => targets.push(Arc::clone(sub)),
				| Some(group) => groups
					.entry(ArcStr::from(group))
					.or_default()
					.push(Arc::clone(sub)),
			}
		}
		for members in groups.values_mut() {
			members.sort_by_key(|sub| sub.sid());
			let pick = self.queue_cursor.fetch_add(1, Ordering::Relaxed)
				% members.len();
			targets.push(Arc::clone(&members[pick]));
		}
		targets.sort_by_key(|sub| sub.sid());

		Ok(targets
			.into_iter()
			.filter(|sub| self.route(sub, message.clone()))
			.count())
	}

	/// Read-path entry: delivers a message that arrived for `sid`
	pub fn deliver(&self, sid: Sid, message: Message) -> bool {
		let sub = self
			.subscriptions
			.get(&sid)
			.map(|entry| Arc::clone(entry.value()));
		match sub {
			| Some(sub) => self.route(&sub, message),
			| None => {
				trace!(sid = %sid, "Message for unknown subscription dropped");
				false
			}
		}
	}

	fn route(&self, sub: &Arc<Subscription>, message: Message) -> bool {
		let Some(dispatcher) = sub.dispatcher() else {
			trace!(sid = %sub.sid(), "Subscription without dispatcher, dropped");
			return false;
		};
		match dispatcher.enqueue(message.for_subscription(Arc::clone(sub))) {
			| Ok(()) => true,
			| Err(PushError::Paused(message)) => {
				trace!(
					sid = %sub.sid(),
					subject = message.subject(),
					"Dispatcher paused, message dropped"
				);
				false
			}
			| Err(PushError::Full(message)) => {
				if dispatcher.mark_slow_consumer() {
					self.listener
						.slow_consumer_detected(dispatcher.id().unwrap_or_default());
				}
				self.listener.message_discarded(&message);
				false
			}
		}
	}

	/// Simulates losing the socket: nothing is transmitted until
	/// [`LocalConnection::reconnect`]
	pub fn disconnect(&self) {
		self.connected.store(false, Ordering::Release);
		info!("Connection lost");
	}

	/// Simulates a successful reconnect: every dispatcher replays its
	/// subscriptions
	pub fn reconnect(&self) {
		if self.is_closed() {
			warn!("Reconnect requested on a closed connection");
			return;
		}
		self.connected.store(true, Ordering::Release);
		let dispatchers = self.registered_dispatchers();
		info!(dispatchers = dispatchers.len(), "Reconnected");
		for dispatcher in dispatchers {
			dispatcher.resend_subscriptions();
		}
	}

	/// Closes the connection: every dispatcher is stopped without
	/// unsubscribing and every subscription is invalidated
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		for dispatcher in self.registered_dispatchers() {
			dispatcher.stop(false);
		}
		self.dispatchers.clear();
		for entry in self.subscriptions.iter() {
			entry.value().invalidate();
		}
		self.subscriptions.clear();
		self.connected.store(false, Ordering::Release);
		self.shutdown.cancel();
		info!("Connection closed");
	}

	/// Token cancelled when the connection shuts down; every dispatcher
	/// waits on a child of it
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	/// Snapshot of everything transmitted so far
	pub fn wire_ops(&self) -> Vec<WireOp> {
		self.wire.lock().clone()
	}

	/// Forgets the transmitted history
	pub fn clear_wire_ops(&self) {
		self.wire.lock().clear();
	}

	/// Number of live subscriptions
	pub fn subscription_count(&self) -> usize {
		self.subscriptions.len()
	}

	/// Live subscription with `sid`, if any
	pub fn subscription(&self, sid: Sid) -> Option<Arc<Subscription>> {
		self.subscriptions
			.get(&sid)
			.map(|entry| Arc::clone(entry.value()))
	}

	/// Number of registered dispatchers
	pub fn dispatcher_count(&self) -> usize {
		self.dispatchers.len()
	}

	/// True unless disconnected or closed
	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Acquire)
	}

	/// True once closed
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	fn registered_dispatchers(&self) -> Vec<Arc<Dispatcher>> {
		self.dispatchers
			.iter()
			.map(|entry| Arc::clone(entry.value()))
			.collect()
	}

	fn transmit(&self, op: WireOp) {
		if !self.is_connected() {
			trace!(op = ?op, "Not connected, request not transmitted");
			return;
		}
		self.wire.lock().push(op);
	}

	fn allocate_sid(&self) -> Sid {
		Sid::new(self.next_sid.fetch_add(1, Ordering::AcqRel))
	}
}

impl Connection for LocalConnection {
	fn create_subscription(
		&self,
		subject: &str,
		queue_group: Option<&str>,
		dispatcher: Weak<Dispatcher>,
		factory: Option<&dyn SubscriptionFactory>,
	) -> Result<Arc<Subscription>, ConnectionError> {
		if self.is_closed() {
			return Err(ConnectionError::Closed);
		}
		let sid = self.allocate_sid();
		let sub = match factory {
			| Some(factory) => {
				factory.create(sid, subject, queue_group, dispatcher)
			}
			| None => Subscription::new(
				sid,
				subject,
				queue_group.map(ArcStr::from),
				dispatcher,
			),
		};
		let sub = Arc::new(sub);
		self.subscriptions.insert(sid, Arc::clone(&sub));
		self.send_subscription_message(sid, subject, queue_group);
		Ok(sub)
	}

	fn unsubscribe(&self, subscription: &Arc<Subscription>, after: Option<u64>) {
		match after {
			| Some(max) if max > 0 => {
				subscription.set_unsub_limit(max);
				if subscription.reached_unsub_limit() {
					self.invalidate(subscription);
				}
			}
			| _ => self.invalidate(subscription),
		}
		self.send_unsub(subscription, after);
	}

	fn send_unsub(&self, subscription: &Subscription, after: Option<u64>) {
		self.transmit(WireOp::Unsub {
			sid: subscription.sid(),
			max: after.filter(|max| *max > 0),
		});
	}

	fn send_subscription_message(
		&self,
		sid: Sid,
		subject: &str,
		queue_group: Option<&str>,
	) {
		self.transmit(WireOp::Sub {
			sid,
			subject: ArcStr::from(subject),
			queue_group: queue_group.map(ArcStr::from),
		});
	}

	fn re_subscribe(
		&self,
		subscription: &Arc<Subscription>,
		subject: &str,
		queue_group: Option<&str>,
	) -> Sid {
		let old_sid = subscription.sid();
		self.subscriptions.remove(&old_sid);
		let sid = self.allocate_sid();
		subscription.set_sid(sid);
		self.subscriptions.insert(sid, Arc::clone(subscription));
		self.send_subscription_message(sid, subject, queue_group);
		sid
	}

	fn invalidate(&self, subscription: &Arc<Subscription>) {
		self.subscriptions.remove(&subscription.sid());
		subscription.invalidate();
		if let Some(dispatcher) = subscription.dispatcher() {
			dispatcher.remove(subscription);
		}
	}

	fn cleanup_dispatcher(&self, dispatcher: &Dispatcher) {
		if let Some(id) = dispatcher.id() {
			self.dispatchers.remove(id);
		}
		let owned: Vec<Sid> = self
			.subscriptions
			.iter()
			.filter(|entry| entry.value().is_managed_by(dispatcher))
			.map(|entry| *entry.key())
			.collect();
		for sid in owned {
			if let Some((_, sub)) = self.subscriptions.remove(&sid) {
				sub.invalidate();
			}
		}
		debug!(
			dispatcher_id = dispatcher.id().unwrap_or_default(),
			"Dispatcher cleaned up"
		);
	}

	fn process_exception(&self, error: DeliveryError) {
		self.listener.exception_occurred(&error);
	}
}
