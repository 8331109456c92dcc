//! Delivery queue between the connection's read path and one delivery loop
//!
//! Producers push concurrently, a single consumer pops. Pausing stops
//! intake but keeps the backlog, so close (pause, then discard) and drain
//! (pause, then consume what is left) share one mechanism. A paused queue
//! that is empty is drained and stays drained: there is no way to resume.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::{PushError, QueueError};
use crate::message::Message;

struct QueueState {
	messages: VecDeque<Message>,
	size_bytes: usize,
	last_cleanup: Instant,
}

/// Thread-safe, size-accounted, pausable FIFO of inbound messages
pub struct MessageQueue {
	state: Mutex<QueueState>,
	available: Notify,
	paused: AtomicBool,
	max_messages: AtomicUsize,
	max_bytes: AtomicUsize,
	cleanup_interval: Duration,
}

impl std::fmt::Debug for MessageQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MessageQueue")
			.field("len", &self.len())
			.field("size_bytes", &self.size_bytes())
			.field("paused", &self.is_paused())
			.finish()
	}
}

impl MessageQueue {
	/// Creates an unbounded queue
	pub fn new(cleanup_interval: Duration) -> Self {
		Self::with_limits(cleanup_interval, 0, 0)
	}

	/// Creates a queue bounded by message count and bytes (0 = unlimited)
	pub fn with_limits(
		cleanup_interval: Duration,
		max_messages: usize,
		max_bytes: usize,
	) -> Self {
		Self {
			state: Mutex::new(QueueState {
				messages: VecDeque::new(),
				size_bytes: 0,
				last_cleanup: Instant::now(),
			}),
			available: Notify::new(),
			paused: AtomicBool::new(false),
			max_messages: AtomicUsize::new(max_messages),
			max_bytes: AtomicUsize::new(max_bytes),
			cleanup_interval,
		}
	}

	/// Appends a message to the tail.
	///
	/// A paused queue rejects with [`PushError::Paused`]; a queue at one of
	/// its pending limits rejects with [`PushError::Full`]. Either way the
	/// message is handed back untouched.
	pub fn push(&self, message: Message) -> Result<(), PushError> {
		let mut state = self.state.lock();
		if self.paused.load(Ordering::Acquire) {
			return Err(PushError::Paused(message));
		}

		let max_messages = self.max_messages.load(Ordering::Relaxed);
		if max_messages > 0 && state.messages.len() >= max_messages {
			return Err(PushError::Full(message));
		}
		let size = message.size();
		let max_bytes = self.max_bytes.load(Ordering::Relaxed);
		if max_bytes > 0 && state.size_bytes + size > max_bytes {
			return Err(PushError::Full(message));
		}

		state.size_bytes += size;
		state.messages.push_back(message);
		drop(state);
		self.available.notify_one();
		Ok(())
	}

	/// Waits for the next message.
	///
	/// Returns `Ok(None)` when `timeout` elapses or when the queue is paused
	/// and empty; callers check [`MessageQueue::is_drained`] afterwards.
	/// Returns [`QueueError::Cancelled`] as soon as `cancel` fires.
	pub async fn pop(
		&self,
		timeout: Duration,
		cancel: &CancellationToken,
	) -> Result<Option<Message>, QueueError> {
		// `None` when the timeout is too large to represent: wait unbounded.
		let deadline = Instant::now().checked_add(timeout);
		loop {
			if cancel.is_cancelled() {
				return Err(QueueError::Cancelled);
			}

			// Registered before checking so a concurrent push or pause
			// cannot slip between the check and the wait.
			let notified = self.available.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(message) = self.try_pop() {
				return Ok(Some(message));
			}
			if self.is_paused() {
				return Ok(None);
			}

			let expired = async {
				match deadline {
					| Some(deadline) => tokio::time::sleep_until(deadline).await,
					| None => std::future::pending().await,
				}
			};

			tokio::select! {
				biased;
				_ = cancel.cancelled() => return Err(QueueError::Cancelled),
				_ = &mut notified => {}
				_ = expired => return Ok(None),
			}
		}
	}

	/// Takes the head message without waiting
	pub fn try_pop(&self) -> Option<Message> {
		let mut state = self.state.lock();
		self.purge_if_due(&mut state, Instant::now());
		let message = state.messages.pop_front()?;
		state.size_bytes = state.size_bytes.saturating_sub(message.size());
		Some(message)
	}

	/// Stops accepting messages. Queued messages stay available to `pop`.
	pub fn pause(&self) {
		let state = self.state.lock();
		self.paused.store(true, Ordering::Release);
		drop(state);
		self.available.notify_waiters();
	}

	/// Drops every queued message, returning how many were dropped
	pub fn discard(&self) -> usize {
		let mut state = self.state.lock();
		let dropped = state.messages.len();
		state.messages.clear();
		state.size_bytes = 0;
		if dropped > 0 {
			debug!(dropped, "Discarded queued messages");
		}
		dropped
	}

	/// Removes stale messages now, regardless of the cleanup interval
	pub fn purge_expired(&self) -> usize {
		let mut state = self.state.lock();
		let now = Instant::now();
		state.last_cleanup = now;
		Self::purge(&mut state, now)
	}

	fn purge_if_due(&self, state: &mut QueueState, now: Instant) {
		if now.duration_since(state.last_cleanup) < self.cleanup_interval {
			return;
		}
		state.last_cleanup = now;
		Self::purge(state, now);
	}

	fn purge(state: &mut QueueState, now: Instant) -> usize {
		let before = state.messages.len();
		state.messages.retain(|m| !m.is_expired(now));
		let purged = before - state.messages.len();
		if purged > 0 {
			state.size_bytes = state.messages.iter().map(Message::size).sum();
			trace!(purged, "Purged stale messages");
		}
		purged
	}

	/// Updates the pending limits (0 = unlimited)
	pub fn set_pending_limits(&self, max_messages: usize, max_bytes: usize) {
		self.max_messages.store(max_messages, Ordering::Relaxed);
		self.max_bytes.store(max_bytes, Ordering::Relaxed);
	}

	/// Current `(max_messages, max_bytes)` limits
	pub fn pending_limits(&self) -> (usize, usize) {
		(
			self.max_messages.load(Ordering::Relaxed),
			self.max_bytes.load(Ordering::Relaxed),
		)
	}

	/// True once `pause` was called
	pub fn is_paused(&self) -> bool {
		self.paused.load(Ordering::Acquire)
	}

	/// True iff paused and empty; never reverts once true
	pub fn is_drained(&self) -> bool {
		let state = self.state.lock();
		self.is_paused() && state.messages.is_empty()
	}

	/// Number of queued messages
	pub fn len(&self) -> usize {
		self.state.lock().messages.len()
	}

	/// True if nothing is queued
	pub fn is_empty(&self) -> bool {
		self.state.lock().messages.is_empty()
	}

	/// Accounted bytes of all queued messages
	pub fn size_bytes(&self) -> usize {
		self.state.lock().size_bytes
	}
}
