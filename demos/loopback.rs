//! # Loopback - NATS Dispatch
//!
//! Runs a dispatcher against the in-process connection:
//! - a default handler plus per-subscription handlers
//! - a queue group splitting work between two members
//! - auto-unsubscribe after a fixed number of messages
//! - a graceful drain
//!
//! `RUST_LOG=debug cargo run --example loopback` shows the dispatcher logs.

use std::sync::Arc;
use std::time::Duration;

use nats_dispatch::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes tracing when `RUST_LOG` is set, silent otherwise
fn setup_tracing() {
	let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env()
	else {
		return;
	};
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_target(true).compact())
		.init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	setup_tracing();

	// === 1. CONNECTION ===
	let settings =
		DispatchSettings::default().with_pending_limits(1_000, 1024 * 1024);
	let connection =
		LocalConnection::new(settings, Arc::new(LoggingErrorListener))?;

	// === 2. DISPATCHER WITH DEFAULT HANDLER ===
	let dispatcher = connection.create_dispatcher_with(|msg: Message| async move {
		println!("[default] {} -> {:?}", msg.subject(), msg.payload());
		Ok::<(), HandlerError>(())
	})?;
	dispatcher.subscribe("greetings.>")?;

	// === 3. QUEUE GROUP ===
	for worker in ["alpha", "beta"] {
		dispatcher.queue_subscribe_with(
			"jobs.*",
			"workers",
			move |msg: Message| async move {
				println!("[{worker}] took {}", msg.subject());
				Ok::<(), HandlerError>(())
			},
		)?;
	}

	// === 4. AUTO-UNSUBSCRIBE ===
	let limited = dispatcher
		.subscription("ticks")
		.handler(|msg: Message| async move {
			println!("[ticks] {:?}", msg.payload());
			Ok::<(), HandlerError>(())
		})
		.max_messages(2)
		.subscribe()?;

	// === 5. PUBLISH ===
	connection.publish(Message::new("greetings.rust.alice", "hello"))?;
	for job in ["jobs.build", "jobs.test", "jobs.deploy", "jobs.notify"] {
		connection.publish(Message::new(job, "run"))?;
	}
	for tick in 0..4 {
		let accepted =
			connection.publish(Message::new("ticks", tick.to_string()))?;
		println!("tick {tick} accepted by {accepted} subscription(s)");
	}

	tokio::time::sleep(Duration::from_millis(100)).await;
	println!(
		"ticks subscription active: {}, delivered: {}",
		limited.is_active(),
		limited.delivered_count()
	);

	// === 6. DRAIN ===
	let drained = dispatcher.drain(Duration::from_secs(5)).await?;
	println!(
		"drained: {drained}, handled {} message(s)",
		dispatcher.delivered_count()
	);

	connection.close();
	Ok(())
}
