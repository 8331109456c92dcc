//! End-to-end dispatch scenarios
//!
//! Every test runs a real delivery task against the in-process connection
//! and observes handlers, wire requests and error-listener events.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nats_dispatch::errors::{DeliveryError, DeliveryErrorKind, DispatchError};
use nats_dispatch::prelude::*;
use nats_dispatch::{HandlerResult, MessageHandler, WireOp};
use parking_lot::Mutex;
use tokio::sync::{Barrier, Semaphore};

/// Enables log output when `RUST_LOG` is set
fn init_tracing() {
	if std::env::var("RUST_LOG").is_err() {
		return;
	}
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

#[derive(Default)]
struct Events {
	exceptions: Mutex<Vec<DeliveryErrorKind>>,
	slow_consumers: Mutex<Vec<String>>,
	discarded: AtomicUsize,
}

impl ErrorListener for Events {
	fn exception_occurred(&self, error: &DeliveryError) {
		self.exceptions.lock().push(error.kind());
	}

	fn slow_consumer_detected(&self, dispatcher_id: &str) {
		self.slow_consumers.lock().push(dispatcher_id.to_string());
	}

	fn message_discarded(&self, _message: &Message) {
		self.discarded.fetch_add(1, Ordering::SeqCst);
	}
}

fn setup_with(
	settings: DispatchSettings,
) -> (Arc<LocalConnection>, Arc<Events>) {
	init_tracing();
	let events = Arc::new(Events::default());
	let connection = LocalConnection::new(
		settings,
		Arc::clone(&events) as Arc<dyn ErrorListener>,
	)
	.expect("valid settings");
	(connection, events)
}

fn setup() -> (Arc<LocalConnection>, Arc<Events>) {
	setup_with(DispatchSettings::default())
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
	let waited = tokio::time::timeout(Duration::from_secs(5), async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await;
	assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Handler that records every received subject
fn recorder(log: &Arc<Mutex<Vec<String>>>) -> impl MessageHandler {
	let log = Arc::clone(log);
	move |msg: Message| {
		log.lock().push(msg.subject().to_string());
		std::future::ready(HandlerResult::Ok(()))
	}
}

fn ignore() -> impl MessageHandler {
	|_: Message| std::future::ready(HandlerResult::Ok(()))
}

#[tokio::test]
async fn test_queue_subscription_receives_matching_message() {
	let (connection, _) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let received = Arc::new(Mutex::new(Vec::new()));

	dispatcher
		.queue_subscribe_with("orders.*", "workers", recorder(&received))
		.unwrap();
	assert_eq!(connection.publish(Message::new("orders.created", "{}")), Ok(1));

	eventually("delivery", || received.lock().len() == 1).await;
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(*received.lock(), vec!["orders.created".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_default_subscribes_register_once() {
	let (connection, _) = setup();
	let dispatcher = connection
		.create_dispatcher_with(ignore())
		.unwrap();
	let barrier = Arc::new(Barrier::new(2));

	let tasks: Vec<_> = (0..2)
		.map(|_| {
			let dispatcher = Arc::clone(&dispatcher);
			let barrier = Arc::clone(&barrier);
			tokio::spawn(async move {
				barrier.wait().await;
				dispatcher.subscribe("events")
			})
		})
		.collect();

	let mut subs = Vec::new();
	for task in tasks {
		subs.push(task.await.unwrap().unwrap());
	}

	assert!(Arc::ptr_eq(&subs[0], &subs[1]));
	assert_eq!(connection.subscription_count(), 1);
	assert_eq!(dispatcher.subscription_count(), 1);
	assert!(subs[0].is_active());
}

#[tokio::test]
async fn test_auto_unsubscribe_limits_deliveries() {
	let (connection, _) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let received = Arc::new(Mutex::new(Vec::new()));

	let sub = dispatcher
		.subscription("limited")
		.handler(recorder(&received))
		.max_messages(3)
		.subscribe()
		.unwrap();
	for _ in 0..5 {
		connection.publish(Message::new("limited", "x")).unwrap();
	}

	eventually("backlog consumed", || {
		dispatcher.pending_message_count() == 0 && !sub.is_active()
	})
	.await;
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert_eq!(received.lock().len(), 3);
	assert_eq!(sub.delivered_count(), 3);
	assert_eq!(dispatcher.handler_count(), 0);
	assert_eq!(connection.publish(Message::new("limited", "x")), Ok(0));
}

#[tokio::test]
async fn test_close_with_unsubscribe_all() {
	let (connection, _) = setup();
	let dispatcher = connection
		.create_dispatcher_with(ignore())
		.unwrap();
	let a = dispatcher.subscribe("a").unwrap();
	let b = dispatcher.subscribe_with("b", ignore()).unwrap();
	connection.clear_wire_ops();

	connection.close_dispatcher(&dispatcher);

	let mut ops = connection.wire_ops();
	ops.sort_by_key(|op| match op {
		| WireOp::Sub { sid, .. } | WireOp::Unsub { sid, .. } => *sid,
	});
	assert_eq!(
		ops,
		vec![
			WireOp::Unsub { sid: a.sid(), max: None },
			WireOp::Unsub { sid: b.sid(), max: None },
		]
	);
	assert_eq!(dispatcher.subscription_count(), 0);
	assert_eq!(dispatcher.handler_count(), 0);
	assert_eq!(connection.dispatcher_count(), 0);

	eventually("drained", || dispatcher.is_drained()).await;
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(dispatcher.is_drained());
	assert!(matches!(dispatcher.subscribe("c"), Err(DispatchError::Closed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handlers_run_in_order_without_overlap() {
	let (connection, _) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let order = Arc::new(Mutex::new(Vec::new()));
	let busy = Arc::new(AtomicBool::new(false));
	let overlaps = Arc::new(AtomicUsize::new(0));

	for subject in ["left", "right"] {
		let order = Arc::clone(&order);
		let busy = Arc::clone(&busy);
		let overlaps = Arc::clone(&overlaps);
		dispatcher
			.subscribe_with(subject, move |msg: Message| {
				let order = Arc::clone(&order);
				let busy = Arc::clone(&busy);
				let overlaps = Arc::clone(&overlaps);
				async move {
					if busy.swap(true, Ordering::SeqCst) {
						overlaps.fetch_add(1, Ordering::SeqCst);
					}
					tokio::time::sleep(Duration::from_millis(1)).await;
					order.lock().push(msg.payload().clone());
					busy.store(false, Ordering::SeqCst);
					Ok::<(), HandlerError>(())
				}
			})
			.unwrap();
	}

	for i in 0..40 {
		let subject = if i % 2 == 0 { "left" } else { "right" };
		connection
			.publish(Message::new(subject, i.to_string()))
			.unwrap();
	}

	eventually("all delivered", || order.lock().len() == 40).await;
	let expected: Vec<_> = (0..40).map(|i| i.to_string()).collect();
	let actual: Vec<_> = order
		.lock()
		.iter()
		.map(|payload| String::from_utf8_lossy(payload).into_owned())
		.collect();
	assert_eq!(actual, expected);
	assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_errors_do_not_stop_delivery() {
	let (connection, events) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let handled = Arc::new(AtomicUsize::new(0));

	let counter = Arc::clone(&handled);
	dispatcher
		.subscribe_with("jobs", move |msg: Message| {
			counter.fetch_add(1, Ordering::SeqCst);
			let payload = msg.payload().clone();
			async move {
				match &payload[..] {
					| b"error" => Err::<(), HandlerError>("rejected".into()),
					| b"panic" => panic!("bad job"),
					| _ => Ok(()),
				}
			}
		})
		.unwrap();

	for payload in ["error", "panic", "fine", "error"] {
		connection.publish(Message::new("jobs", payload)).unwrap();
	}

	eventually("all handled", || handled.load(Ordering::SeqCst) == 4).await;
	eventually("reports", || events.exceptions.lock().len() == 3).await;
	assert_eq!(
		*events.exceptions.lock(),
		vec![
			DeliveryErrorKind::Handler,
			DeliveryErrorKind::HandlerPanic,
			DeliveryErrorKind::Handler,
		]
	);
	assert!(dispatcher.is_active());
}

#[tokio::test]
async fn test_unexpected_interruption_is_reported() {
	let (connection, events) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();

	connection.shutdown_token().cancel();

	eventually("loop exit", || !dispatcher.is_active()).await;
	dispatcher.stopped().await;
	assert_eq!(
		*events.exceptions.lock(),
		vec![DeliveryErrorKind::Interrupted]
	);
}

#[tokio::test]
async fn test_requested_stop_is_not_reported() {
	let (connection, events) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();

	dispatcher.stop(false);
	dispatcher.stopped().await;

	assert!(events.exceptions.lock().is_empty());
	assert!(dispatcher.is_drained());
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions() {
	let (connection, _) = setup();
	let dispatcher = connection
		.create_dispatcher_with(ignore())
		.unwrap();
	let a = dispatcher.subscribe("a.>").unwrap();

	connection.disconnect();
	let b = dispatcher.queue_subscribe("b", "q").unwrap();
	assert_eq!(
		connection.publish(Message::new("a.x", "lost")),
		Ok(0)
	);
	let sent_while_down: Vec<_> = connection
		.wire_ops()
		.into_iter()
		.filter(|op| matches!(op, WireOp::Sub { sid, .. } if *sid == b.sid()))
		.collect();
	assert!(sent_while_down.is_empty());

	connection.clear_wire_ops();
	connection.reconnect();

	let mut ops = connection.wire_ops();
	ops.sort_by_key(|op| match op {
		| WireOp::Sub { sid, .. } | WireOp::Unsub { sid, .. } => *sid,
	});
	assert_eq!(
		ops,
		vec![
			WireOp::Sub {
				sid: a.sid(),
				subject: "a.>".into(),
				queue_group: None,
			},
			WireOp::Sub {
				sid: b.sid(),
				subject: "b".into(),
				queue_group: Some("q".into()),
			},
		]
	);
}

#[tokio::test]
async fn test_slow_consumer_drops_and_recovers() {
	let settings = DispatchSettings::default().with_pending_limits(1, 0);
	let (connection, events) = setup_with(settings);
	let dispatcher = connection.create_dispatcher().unwrap();
	let gate = Arc::new(Semaphore::new(0));
	let handled = Arc::new(AtomicUsize::new(0));

	let (handler_gate, counter) = (Arc::clone(&gate), Arc::clone(&handled));
	dispatcher
		.subscribe_with("feed", move |_: Message| {
			let gate = Arc::clone(&handler_gate);
			let counter = Arc::clone(&counter);
			async move {
				let permit = gate.acquire().await?;
				permit.forget();
				counter.fetch_add(1, Ordering::SeqCst);
				Ok::<(), HandlerError>(())
			}
		})
		.unwrap();

	connection.publish(Message::new("feed", "1")).unwrap();
	eventually("first in handler", || dispatcher.delivered_count() == 1).await;

	assert_eq!(connection.publish(Message::new("feed", "2")), Ok(1));
	assert_eq!(connection.publish(Message::new("feed", "3")), Ok(0));
	assert_eq!(connection.publish(Message::new("feed", "4")), Ok(0));

	assert!(dispatcher.is_slow_consumer());
	assert_eq!(dispatcher.dropped_count(), 2);
	assert_eq!(events.discarded.load(Ordering::SeqCst), 2);
	assert_eq!(events.slow_consumers.lock().len(), 1);
	assert_eq!(
		events.slow_consumers.lock()[0],
		dispatcher.id().unwrap().to_string()
	);

	gate.add_permits(10);
	eventually("backlog handled", || handled.load(Ordering::SeqCst) == 2).await;
	assert_eq!(connection.publish(Message::new("feed", "5")), Ok(1));
	assert!(!dispatcher.is_slow_consumer());
	dispatcher.clear_dropped_count();
	assert_eq!(dispatcher.dropped_count(), 0);
}

#[tokio::test]
async fn test_drain_finishes_backlog_and_releases_dispatcher() {
	let (connection, _) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let received = Arc::new(Mutex::new(Vec::new()));
	let sub = dispatcher
		.subscribe_with("work", recorder(&received))
		.unwrap();
	for _ in 0..10 {
		connection.publish(Message::new("work", "job")).unwrap();
	}

	let drained = dispatcher.drain(Duration::from_secs(5)).await.unwrap();

	assert!(drained);
	assert_eq!(received.lock().len(), 10);
	assert!(dispatcher.is_drained());
	assert!(!sub.is_active());
	assert_eq!(connection.dispatcher_count(), 0);
	assert_eq!(connection.subscription_count(), 0);
	assert!(connection
		.wire_ops()
		.contains(&WireOp::Unsub { sid: sub.sid(), max: None }));
	assert!(matches!(
		dispatcher.drain(Duration::from_secs(1)).await,
		Err(DispatchError::Closed)
	));
}

#[tokio::test]
async fn test_drain_timeout_stops_dispatcher() {
	let (connection, events) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let gate = Arc::new(Semaphore::new(0));

	let handler_gate = Arc::clone(&gate);
	dispatcher
		.subscribe_with("stuck", move |_: Message| {
			let gate = Arc::clone(&handler_gate);
			async move {
				let _permit = gate.acquire().await?;
				Ok::<(), HandlerError>(())
			}
		})
		.unwrap();
	connection.publish(Message::new("stuck", "1")).unwrap();
	connection.publish(Message::new("stuck", "2")).unwrap();
	eventually("first in handler", || dispatcher.delivered_count() == 1).await;

	let drained = dispatcher.drain(Duration::from_millis(50)).await.unwrap();

	assert!(!drained);
	assert!(!dispatcher.is_active());
	assert_eq!(dispatcher.pending_message_count(), 0);
	assert_eq!(
		*events.exceptions.lock(),
		vec![DeliveryErrorKind::DrainTimeout]
	);
	gate.add_permits(1);
	eventually("drained", || dispatcher.is_drained()).await;
}

#[tokio::test]
async fn test_connection_drains_all_dispatchers() {
	let (connection, _) = setup();
	let first = connection.create_dispatcher().unwrap();
	let second = connection.create_dispatcher().unwrap();
	first.subscribe_with("a", ignore()).unwrap();
	second.subscribe_with("b", ignore()).unwrap();
	connection.publish(Message::new("a", "1")).unwrap();
	connection.publish(Message::new("b", "2")).unwrap();

	assert!(connection.drain_dispatchers().await);
	assert!(first.is_drained());
	assert!(second.is_drained());
	assert_eq!(connection.dispatcher_count(), 0);
}

#[tokio::test]
async fn test_draining_dispatcher_rejects_subscribe_and_ignores_unsubscribe() {
	let (connection, _) = setup();
	let dispatcher = connection
		.create_dispatcher_with(ignore())
		.unwrap();
	let sub = dispatcher.subscribe("a").unwrap();
	dispatcher.mark_draining();

	assert!(matches!(dispatcher.subscribe("b"), Err(DispatchError::Draining)));
	assert!(dispatcher.unsubscribe("a").is_ok());
	assert!(dispatcher.unsubscribe_handle(&*sub).is_ok());
	assert!(sub.is_active());
}

#[tokio::test]
async fn test_queue_group_members_share_messages() {
	let (connection, _) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let first = Arc::new(Mutex::new(Vec::new()));
	let second = Arc::new(Mutex::new(Vec::new()));
	let observer = Arc::new(Mutex::new(Vec::new()));

	dispatcher
		.queue_subscribe_with("jobs.>", "workers", recorder(&first))
		.unwrap();
	dispatcher
		.queue_subscribe_with("jobs.>", "workers", recorder(&second))
		.unwrap();
	dispatcher
		.subscribe_with("jobs.*", recorder(&observer))
		.unwrap();

	for _ in 0..4 {
		assert_eq!(connection.publish(Message::new("jobs.build", "x")), Ok(2));
	}

	eventually("observer saw all", || observer.lock().len() == 4).await;
	eventually("workers saw all", || {
		first.lock().len() + second.lock().len() == 4
	})
	.await;
	assert_eq!(first.lock().len(), 2);
	assert_eq!(second.lock().len(), 2);
}

#[tokio::test]
async fn test_closed_connection_rejects_dispatchers() {
	let (connection, _) = setup();
	let dispatcher = connection.create_dispatcher().unwrap();
	let sub = dispatcher
		.subscribe_with("a", ignore())
		.unwrap();

	connection.close();

	assert!(connection.is_closed());
	assert!(!sub.is_active());
	assert!(connection.create_dispatcher().is_err());
	assert!(matches!(
		dispatcher.subscribe_with("b", ignore()),
		Err(DispatchError::Closed)
	));
	dispatcher.stopped().await;
	assert!(dispatcher.is_drained());
}

#[tokio::test]
async fn test_publish_rejects_wildcards() {
	let (connection, _) = setup();
	assert!(connection.publish(Message::new("a.*", "")).is_err());
	assert!(connection.publish(Message::new("a.>", "")).is_err());
	assert!(connection.publish(Message::new("", "")).is_err());
}
