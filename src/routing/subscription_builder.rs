//! Fluent construction of dispatcher subscriptions

use std::sync::Arc;

use arcstr::ArcStr;

use super::dispatcher::Dispatcher;
use super::error::DispatchError;
use super::handler::{shared_handler, MessageHandler, SharedHandler};
use super::subscription::Subscription;

/// Immutable builder for dispatcher subscriptions.
///
/// Without a handler the subscription uses the dispatcher's default
/// handler and is deduplicated by subject; with one, every `subscribe`
/// creates a new subscription.
#[derive(Clone)]
pub struct SubscriptionBuilder<'a> {
	dispatcher: &'a Dispatcher,
	subject: ArcStr,
	queue_group: Option<ArcStr>,
	handler: Option<SharedHandler>,
	max_messages: Option<u64>,
}

impl<'a> SubscriptionBuilder<'a> {
	pub(crate) fn new(dispatcher: &'a Dispatcher, subject: ArcStr) -> Self {
		Self {
			dispatcher,
			subject,
			queue_group: None,
			handler: None,
			max_messages: None,
		}
	}

	/// Join a queue group
	pub fn queue_group(self, queue_group: impl Into<ArcStr>) -> Self {
		Self {
			queue_group: Some(queue_group.into()),
			..self
		}
	}

	/// Use a dedicated handler instead of the dispatcher default
	pub fn handler(self, handler: impl MessageHandler) -> Self {
		Self {
			handler: Some(shared_handler(handler)),
			..self
		}
	}

	/// Unsubscribe automatically after `max` deliveries
	pub fn max_messages(self, max: u64) -> Self {
		Self {
			max_messages: Some(max),
			..self
		}
	}

	/// Subscribe using the configured options
	pub fn subscribe(self) -> Result<Arc<Subscription>, DispatchError> {
		let dispatcher = self.dispatcher;
		let subscription = match (self.queue_group.as_deref(), self.handler) {
			| (None, None) => dispatcher.subscribe(&self.subject)?,
			| (Some(queue_group), None) => {
				dispatcher.queue_subscribe(&self.subject, queue_group)?
			}
			| (queue_group, Some(handler)) => dispatcher.subscribe_handler(
				&self.subject,
				queue_group,
				handler,
				None,
			)?,
		};

		if let Some(max) = self.max_messages {
			dispatcher.unsubscribe_handle_after(&*subscription, max)?;
		}
		Ok(subscription)
	}
}
