//! Asynchronous dispatcher
//!
//! A [`Dispatcher`] owns one [`MessageQueue`] and one delivery task. The
//! task pops messages in order and runs their handlers inline, so at most
//! one handler of a dispatcher runs at any instant and handlers see
//! messages in enqueue order.
//!
//! Subscriptions come in two flavours that are tracked separately:
//! - default-handler subscriptions, keyed by subject and never duplicated;
//! - handler-bearing subscriptions, keyed by SID, any number per subject.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use arcstr::ArcStr;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::{DeliveryError, DispatchError, PushError, QueueError};
use super::handler::{shared_handler, MessageHandler, SharedHandler};
use super::message_queue::MessageQueue;
use super::subscription::{
	Sid, Subscription, SubscriptionFactory, SubscriptionHandle,
};
use super::subscription_builder::SubscriptionBuilder;
use crate::config::DispatchSettings;
use crate::connection::Connection;
use crate::message::Message;
use crate::subject::validation::{validate_queue_group, validate_subject};

/// Routes queued messages to subscription handlers on a dedicated task
pub struct Dispatcher {
	this: Weak<Dispatcher>,
	id: OnceLock<ArcStr>,
	connection: Arc<dyn Connection>,
	incoming: MessageQueue,
	default_handler: Option<SharedHandler>,
	default_subscriptions: DashMap<ArcStr, Arc<Subscription>>,
	handler_subscriptions: DashMap<Sid, Arc<Subscription>>,
	handlers: DashMap<Sid, SharedHandler>,
	running: AtomicBool,
	started: AtomicBool,
	draining: AtomicBool,
	slow_consumer: AtomicBool,
	delivered: AtomicU64,
	dropped: AtomicU64,
	cancel: CancellationToken,
	task: Mutex<Option<JoinHandle<()>>>,
	loop_active: watch::Sender<bool>,
	wait_for_message: Duration,
}

impl std::fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dispatcher")
			.field("id", &self.log_id())
			.field("running", &self.is_active())
			.field("draining", &self.is_draining())
			.field("default_subscriptions", &self.default_subscriptions.len())
			.field("handler_subscriptions", &self.handler_subscriptions.len())
			.field("incoming", &self.incoming)
			.finish()
	}
}

impl Dispatcher {
	/// Creates a dispatcher that is not started yet.
	///
	/// `cancel` is normally a child of the connection's shutdown token:
	/// cancelling it without calling [`Dispatcher::stop`] first is reported
	/// as an interruption.
	pub fn new(
		connection: Arc<dyn Connection>,
		default_handler: Option<SharedHandler>,
		settings: &DispatchSettings,
		cancel: CancellationToken,
	) -> Arc<Self> {
		let (loop_active, _) = watch::channel(false);
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			id: OnceLock::new(),
			connection,
			incoming: MessageQueue::with_limits(
				settings.request_cleanup_interval,
				settings.pending_message_limit,
				settings.pending_byte_limit,
			),
			default_handler,
			default_subscriptions: DashMap::new(),
			handler_subscriptions: DashMap::new(),
			handlers: DashMap::new(),
			running: AtomicBool::new(false),
			started: AtomicBool::new(false),
			draining: AtomicBool::new(false),
			slow_consumer: AtomicBool::new(false),
			delivered: AtomicU64::new(0),
			dropped: AtomicU64::new(0),
			cancel,
			task: Mutex::new(None),
			loop_active,
			wait_for_message: settings.wait_for_message,
		})
	}

	/// Starts the delivery task. Only the first call has any effect; a
	/// stopped dispatcher is never restarted.
	///
	/// Must be called from within a tokio runtime.
	pub fn start(&self, id: impl Into<ArcStr>) {
		if self.started.swap(true, Ordering::AcqRel) {
			return;
		}
		let id = self.id.get_or_init(|| id.into()).clone();
		let Some(this) = self.this.upgrade() else {
			return;
		};

		self.running.store(true, Ordering::Release);
		self.loop_active.send_replace(true);
		// Held while spawning so the task cannot clear the slot first.
		let mut task = self.task.lock();
		*task = Some(tokio::spawn(this.run()));
		info!(dispatcher_id = %id, "Dispatcher started");
	}

	async fn run(self: Arc<Self>) {
		// Caught so the exit bookkeeping below always runs.
		let outcome = AssertUnwindSafe(self.delivery_loop()).catch_unwind().await;
		match outcome {
			| Ok(Ok(())) => {}
			| Ok(Err(QueueError::Cancelled))
				if self.running.load(Ordering::Acquire) =>
			{
				warn!(
					dispatcher_id = %self.log_id(),
					"Delivery loop interrupted without stop request"
				);
				self.connection.process_exception(DeliveryError::Interrupted {
					dispatcher_id: self.log_id(),
				});
			}
			| Ok(Err(QueueError::Cancelled)) => {
				debug!(dispatcher_id = %self.log_id(), "Delivery loop cancelled by stop");
			}
			| Err(payload) => {
				warn!(
					dispatcher_id = %self.log_id(),
					panic = %panic_message(payload),
					"Delivery loop panicked"
				);
				self.connection.process_exception(DeliveryError::Interrupted {
					dispatcher_id: self.log_id(),
				});
			}
		}

		self.running.store(false, Ordering::Release);
		self.task.lock().take();
		self.loop_active.send_replace(false);
		debug!(dispatcher_id = %self.log_id(), "Delivery loop exited");
	}

	async fn delivery_loop(&self) -> Result<(), QueueError> {
		while self.running.load(Ordering::Acquire) {
			let next = self.incoming.pop(self.wait_for_message, &self.cancel).await?;
			if let Some(message) = next {
				self.deliver(message).await;
			}
			if self.incoming.is_drained() {
				debug!(dispatcher_id = %self.log_id(), "Queue drained");
				return Ok(());
			}
		}
		Ok(())
	}

	async fn deliver(&self, message: Message) {
		let Some(sub) = message.subscription().cloned() else {
			trace!(subject = message.subject(), "Message without subscription dropped");
			return;
		};
		if !sub.is_active() {
			trace!(sid = %sub.sid(), "Message for inactive subscription dropped");
			return;
		}

		let sid = sub.sid();
		let handler = self
			.handlers
			.get(&sid)
			.map(|entry| Arc::clone(entry.value()))
			.or_else(|| self.default_handler.clone());
		// Unsubscribe races with in-flight messages; nothing to report.
		let Some(handler) = handler else {
			trace!(sid = %sid, "No handler for message, dropped");
			return;
		};

		sub.increment_delivered();
		self.delivered.fetch_add(1, Ordering::AcqRel);

		let outcome = AssertUnwindSafe(async move { handler.on_message(message).await })
			.catch_unwind()
			.await;
		match outcome {
			| Ok(Ok(())) => {}
			| Ok(Err(source)) => {
				debug!(sid = %sid, error = %source, "Handler failed");
				self.connection
					.process_exception(DeliveryError::Handler { sid, source });
			}
			| Err(payload) => {
				let message = panic_message(payload);
				debug!(sid = %sid, panic = %message, "Handler panicked");
				self.connection
					.process_exception(DeliveryError::HandlerPanic { sid, message });
			}
		}

		if sub.reached_unsub_limit() {
			debug!(sid = %sid, delivered = sub.delivered_count(), "Delivery limit reached");
			self.connection.invalidate(&sub);
		}
	}

	/// Stops the dispatcher: intake is paused, the queued backlog is
	/// discarded and the delivery task is asked to exit. With
	/// `unsubscribe_all` every tracked subscription is unsubscribed
	/// immediately first. Subscription maps end empty either way.
	pub fn stop(&self, unsubscribe_all: bool) {
		self.running.store(false, Ordering::Release);
		self.incoming.pause();
		self.cancel.cancel();

		if unsubscribe_all {
			for sub in self.tracked_subscriptions() {
				self.connection.unsubscribe(&sub, None);
			}
		}

		self.default_subscriptions.clear();
		self.handler_subscriptions.clear();
		self.handlers.clear();
		let discarded = self.incoming.discard();
		info!(
			dispatcher_id = %self.log_id(),
			unsubscribe_all,
			discarded,
			"Dispatcher stopped"
		);
	}

	/// Removes a subscription after the connection made its removal
	/// effective. Default-handler entries are only removed when their SID
	/// matches, so a newer subscription on the same subject survives.
	pub fn remove(&self, subscription: &Subscription) {
		let sid = subscription.sid();
		if self.handler_subscriptions.remove(&sid).is_some() {
			self.handlers.remove(&sid);
		} else {
			self.default_subscriptions
				.remove_if(subscription.subject(), |_, stored| stored.sid() == sid);
		}
	}

	/// Replays the subscribe request of every tracked subscription with its
	/// current SID. Local bookkeeping is left untouched.
	pub fn resend_subscriptions(&self) {
		let subscriptions = self.tracked_subscriptions();
		debug!(
			dispatcher_id = %self.log_id(),
			count = subscriptions.len(),
			"Resending subscriptions"
		);
		for sub in subscriptions {
			self.connection.send_subscription_message(
				sub.sid(),
				sub.subject(),
				sub.queue_group(),
			);
		}
	}

	/// Subscribes `subject` with the default handler, reusing an existing
	/// default-handler subscription for the same subject
	pub fn subscribe(
		&self,
		subject: &str,
	) -> Result<Arc<Subscription>, DispatchError> {
		validate_subject(subject)?;
		self.subscribe_default(subject, None)
	}

	/// Queue-group variant of [`Dispatcher::subscribe`]
	pub fn queue_subscribe(
		&self,
		subject: &str,
		queue_group: &str,
	) -> Result<Arc<Subscription>, DispatchError> {
		validate_subject(subject)?;
		validate_queue_group(queue_group)?;
		self.subscribe_default(subject, Some(queue_group))
	}

	/// Subscribes `subject` with its own handler. Every call creates a new
	/// subscription with a new SID.
	pub fn subscribe_with(
		&self,
		subject: &str,
		handler: impl MessageHandler,
	) -> Result<Arc<Subscription>, DispatchError> {
		self.subscribe_handler(subject, None, shared_handler(handler), None)
	}

	/// Queue-group variant of [`Dispatcher::subscribe_with`]
	pub fn queue_subscribe_with(
		&self,
		subject: &str,
		queue_group: &str,
		handler: impl MessageHandler,
	) -> Result<Arc<Subscription>, DispatchError> {
		self.subscribe_handler(
			subject,
			Some(queue_group),
			shared_handler(handler),
			None,
		)
	}

	/// Handler-bearing subscribe where `factory` builds the subscription
	pub fn subscribe_with_factory(
		&self,
		subject: &str,
		queue_group: Option<&str>,
		handler: impl MessageHandler,
		factory: &dyn SubscriptionFactory,
	) -> Result<Arc<Subscription>, DispatchError> {
		self.subscribe_handler(
			subject,
			queue_group,
			shared_handler(handler),
			Some(factory),
		)
	}

	/// Starts a subscription builder for `subject`
	pub fn subscription(&self, subject: impl Into<ArcStr>) -> SubscriptionBuilder<'_> {
		SubscriptionBuilder::new(self, subject.into())
	}

	pub(crate) fn subscribe_handler(
		&self,
		subject: &str,
		queue_group: Option<&str>,
		handler: SharedHandler,
		factory: Option<&dyn SubscriptionFactory>,
	) -> Result<Arc<Subscription>, DispatchError> {
		validate_subject(subject)?;
		if let Some(queue_group) = queue_group {
			validate_queue_group(queue_group)?;
		}
		self.check_before_subscribe()?;

		let sub = self.connection.create_subscription(
			subject,
			queue_group,
			self.this.clone(),
			factory,
		)?;
		let sid = sub.sid();
		self.handlers.insert(sid, handler);
		self.handler_subscriptions.insert(sid, Arc::clone(&sub));
		debug!(sid = %sid, subject, "Handler subscription created");
		Ok(sub)
	}

	fn subscribe_default(
		&self,
		subject: &str,
		queue_group: Option<&str>,
	) -> Result<Arc<Subscription>, DispatchError> {
		self.check_before_subscribe()?;

		if let Some(existing) = self.default_subscriptions.get(subject) {
			return Ok(Arc::clone(existing.value()));
		}

		let sub = self.connection.create_subscription(
			subject,
			queue_group,
			self.this.clone(),
			None,
		)?;
		let winner = match self.default_subscriptions.entry(ArcStr::from(subject)) {
			| Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
			| Entry::Vacant(entry) => {
				entry.insert(Arc::clone(&sub));
				None
			}
		};

		match winner {
			| Some(winner) => {
				debug!(
					subject,
					winner = %winner.sid(),
					loser = %sub.sid(),
					"Concurrent default subscribe lost, unsubscribing duplicate"
				);
				self.connection.unsubscribe(&sub, None);
				Ok(winner)
			}
			| None => {
				debug!(sid = %sub.sid(), subject, "Default subscription created");
				Ok(sub)
			}
		}
	}

	/// Moves a handler-bearing subscription to a fresh SID, e.g. to reset a
	/// consumer, and returns the new SID
	pub fn re_subscribe(
		&self,
		subscription: &Arc<Subscription>,
		subject: &str,
		queue_group: Option<&str>,
		handler: impl MessageHandler,
	) -> Result<Sid, DispatchError> {
		validate_subject(subject)?;
		if let Some(queue_group) = queue_group {
			validate_queue_group(queue_group)?;
		}
		self.check_before_subscribe()?;
		if !subscription.is_managed_by(self) {
			return Err(DispatchError::NotOwner);
		}

		let old_sid = subscription.sid();
		self.handler_subscriptions.remove(&old_sid);
		self.handlers.remove(&old_sid);

		let sid = self.connection.re_subscribe(subscription, subject, queue_group);
		self.handlers.insert(sid, shared_handler(handler));
		self.handler_subscriptions.insert(sid, Arc::clone(subscription));
		debug!(old_sid = %old_sid, sid = %sid, subject, "Resubscribed");
		Ok(sid)
	}

	fn check_before_subscribe(&self) -> Result<(), DispatchError> {
		if !self.running.load(Ordering::Acquire) {
			return Err(DispatchError::Closed);
		}
		if self.is_draining() {
			return Err(DispatchError::Draining);
		}
		Ok(())
	}

	/// Unsubscribes the default-handler subscription of `subject`
	pub fn unsubscribe(&self, subject: &str) -> Result<(), DispatchError> {
		self.unsubscribe_subject(subject, None)
	}

	/// Unsubscribes the default-handler subscription of `subject` once it
	/// received `after` more messages
	pub fn unsubscribe_after(
		&self,
		subject: &str,
		after: u64,
	) -> Result<(), DispatchError> {
		self.unsubscribe_subject(subject, Some(after))
	}

	/// Unsubscribes a subscription of this dispatcher
	pub fn unsubscribe_handle(
		&self,
		handle: &dyn SubscriptionHandle,
	) -> Result<(), DispatchError> {
		self.unsubscribe_handle_impl(handle, None)
	}

	/// Unsubscribes a subscription of this dispatcher once it received
	/// `after` more messages
	pub fn unsubscribe_handle_after(
		&self,
		handle: &dyn SubscriptionHandle,
		after: u64,
	) -> Result<(), DispatchError> {
		self.unsubscribe_handle_impl(handle, Some(after))
	}

	fn unsubscribe_subject(
		&self,
		subject: &str,
		after: Option<u64>,
	) -> Result<(), DispatchError> {
		if !self.running.load(Ordering::Acquire) {
			return Err(DispatchError::Closed);
		}
		if self.is_draining() {
			trace!(subject, "Unsubscribe ignored while draining");
			return Ok(());
		}
		if subject.trim().is_empty() {
			return Err(crate::subject::SubjectError::EmptySubject.into());
		}

		let sub = self
			.default_subscriptions
			.get(subject)
			.map(|entry| Arc::clone(entry.value()));
		if let Some(sub) = sub {
			// The connection calls back into `remove` when it is effective.
			self.connection.unsubscribe(&sub, after);
		}
		Ok(())
	}

	fn unsubscribe_handle_impl(
		&self,
		handle: &dyn SubscriptionHandle,
		after: Option<u64>,
	) -> Result<(), DispatchError> {
		if !self.running.load(Ordering::Acquire) {
			return Err(DispatchError::Closed);
		}
		if self.is_draining() {
			trace!(subject = handle.subject(), "Unsubscribe ignored while draining");
			return Ok(());
		}
		let owned = handle
			.dispatcher()
			.is_some_and(|owner| std::ptr::eq(Arc::as_ptr(&owner), self));
		if !owned {
			return Err(DispatchError::NotOwner);
		}
		let Some(subscription) = handle.as_subscription() else {
			return Err(DispatchError::UnknownSubscription);
		};

		let sid = subscription.sid();
		let tracked = self
			.handler_subscriptions
			.get(&sid)
			.map(|entry| Arc::clone(entry.value()))
			.or_else(|| {
				self.default_subscriptions
					.get(subscription.subject())
					.filter(|entry| entry.value().sid() == sid)
					.map(|entry| Arc::clone(entry.value()))
			});
		if let Some(sub) = tracked {
			self.connection.unsubscribe(&sub, after);
		}
		Ok(())
	}

	/// Drains the dispatcher: unsubscribes everything on the wire, lets the
	/// delivery task finish what is already queued, then releases the
	/// dispatcher from its connection.
	///
	/// Returns `Ok(false)` if the backlog was not finished within
	/// `timeout`; the dispatcher is then stopped and its backlog dropped.
	pub async fn drain(&self, timeout: Duration) -> Result<bool, DispatchError> {
		if !self.is_active() {
			return Err(DispatchError::Closed);
		}
		if !self.mark_draining() {
			info!(dispatcher_id = %self.log_id(), "Draining dispatcher");
			self.send_unsub_for_drain();
			self.mark_unsubed_for_drain();
		}

		let drained = tokio::time::timeout(timeout, self.stopped()).await.is_ok();
		if !drained {
			warn!(
				dispatcher_id = %self.log_id(),
				timeout = ?timeout,
				"Drain timed out"
			);
			self.connection.process_exception(DeliveryError::DrainTimeout {
				dispatcher_id: self.log_id(),
				timeout,
			});
			self.stop(false);
		}
		self.clean_up_after_drain();
		Ok(drained)
	}

	/// Flags the dispatcher as draining; returns the previous flag
	pub fn mark_draining(&self) -> bool {
		self.draining.swap(true, Ordering::AcqRel)
	}

	/// Transmits an unsubscribe for every tracked subscription without
	/// touching local maps, so queued messages are still delivered
	pub fn send_unsub_for_drain(&self) {
		for sub in self.tracked_subscriptions() {
			self.connection.send_unsub(&sub, None);
		}
	}

	/// Pauses intake once the drain unsubscribes went out; the delivery
	/// task exits as soon as the backlog is consumed
	pub fn mark_unsubed_for_drain(&self) {
		self.incoming.pause();
	}

	/// Lets the connection forget this dispatcher
	pub fn clean_up_after_drain(&self) {
		self.connection.cleanup_dispatcher(self);
	}

	/// Queues a message from the read path.
	///
	/// A successful push clears the slow-consumer flag, a push over the
	/// pending limits counts as dropped.
	pub fn enqueue(&self, message: Message) -> Result<(), PushError> {
		match self.incoming.push(message) {
			| Ok(()) => {
				self.slow_consumer.store(false, Ordering::Release);
				Ok(())
			}
			| Err(PushError::Full(message)) => {
				self.dropped.fetch_add(1, Ordering::AcqRel);
				Err(PushError::Full(message))
			}
			| Err(err) => Err(err),
		}
	}

	/// Flags the dispatcher as a slow consumer; true only on the transition
	pub fn mark_slow_consumer(&self) -> bool {
		!self.slow_consumer.swap(true, Ordering::AcqRel)
	}

	/// True while the last push was rejected for pending limits
	pub fn is_slow_consumer(&self) -> bool {
		self.slow_consumer.load(Ordering::Acquire)
	}

	/// Resolves once the delivery task has exited (immediately if it never
	/// started)
	pub async fn stopped(&self) {
		let mut active = self.loop_active.subscribe();
		let _ = active.wait_for(|active| !*active).await;
	}

	/// True between `start` and `stop` or the end of a drain
	pub fn is_active(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	/// True once draining has begun
	pub fn is_draining(&self) -> bool {
		self.draining.load(Ordering::Acquire)
	}

	/// True once the delivery task is gone and the queue is paused and
	/// empty; stays true from then on
	pub fn is_drained(&self) -> bool {
		!self.is_active()
			&& !*self.loop_active.borrow()
			&& self.incoming.is_drained()
	}

	/// Identifier assigned at start
	pub fn id(&self) -> Option<&str> {
		self.id.get().map(ArcStr::as_str)
	}

	fn log_id(&self) -> ArcStr {
		self.id
			.get()
			.cloned()
			.unwrap_or_else(|| arcstr::literal!("unstarted"))
	}

	/// Messages handed to handlers so far
	pub fn delivered_count(&self) -> u64 {
		self.delivered.load(Ordering::Acquire)
	}

	/// Messages rejected for pending limits
	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Acquire)
	}

	/// Resets the dropped counter
	pub fn clear_dropped_count(&self) {
		self.dropped.store(0, Ordering::Release);
	}

	/// Messages waiting in the queue
	pub fn pending_message_count(&self) -> usize {
		self.incoming.len()
	}

	/// Bytes waiting in the queue
	pub fn pending_byte_count(&self) -> usize {
		self.incoming.size_bytes()
	}

	/// Changes the queue's pending limits (0 = unlimited)
	pub fn set_pending_limits(&self, max_messages: usize, max_bytes: usize) {
		self.incoming.set_pending_limits(max_messages, max_bytes);
	}

	/// Current `(max_messages, max_bytes)` pending limits
	pub fn pending_limits(&self) -> (usize, usize) {
		self.incoming.pending_limits()
	}

	/// Default-handler subscription for `subject`, if any
	pub fn default_subscription(&self, subject: &str) -> Option<Arc<Subscription>> {
		self.default_subscriptions
			.get(subject)
			.map(|entry| Arc::clone(entry.value()))
	}

	/// Handler-bearing subscription with `sid`, if any
	pub fn handler_subscription(&self, sid: Sid) -> Option<Arc<Subscription>> {
		self.handler_subscriptions
			.get(&sid)
			.map(|entry| Arc::clone(entry.value()))
	}

	/// Number of tracked subscriptions of both kinds
	pub fn subscription_count(&self) -> usize {
		self.default_subscriptions.len() + self.handler_subscriptions.len()
	}

	/// Number of registered per-subscription handlers
	pub fn handler_count(&self) -> usize {
		self.handlers.len()
	}

	// Snapshot so callbacks into the connection never run under a map guard.
	fn tracked_subscriptions(&self) -> Vec<Arc<Subscription>> {
		let mut subscriptions: Vec<Arc<Subscription>> = self
			.default_subscriptions
			.iter()
			.map(|entry| Arc::clone(entry.value()))
			.collect();
		subscriptions.extend(
			self.handler_subscriptions
				.iter()
				.map(|entry| Arc::clone(entry.value())),
		);
		subscriptions
	}
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		return (*message).to_string();
	}
	if let Some(message) = payload.downcast_ref::<String>() {
		return message.clone();
	}
	"non-string panic payload".to_string()
}
