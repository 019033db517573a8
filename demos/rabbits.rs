//! Rabbit registry demo.
//!
//! Adds a few rabbits, runs a pipeline that reports every even rabbit count
//! to a singleton aggregate, and prints the resulting state.
//!
//! Run with `cargo run --example rabbits`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use eventpipe_es::{
    Aggregate, Dispatcher, EventHandler, EventLog, EventType, HANDLERS_ORIGIN, HandlerRegistry,
    MemoryEventLog, PendingEvent, Pipeline, Repository, SINGLETON_ID, SingletonAggregate,
    StoredEvent, WorkerPool,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
struct Rabbit {
    name: String,
    removed: bool,
}

impl Aggregate for Rabbit {
    const ORIGIN: &'static str = "rabbit";

    fn create(_id: &str) -> Self {
        Rabbit::default()
    }
}

#[derive(Debug, Default)]
struct Rabbits {
    even_counts: Vec<u64>,
}

impl Aggregate for Rabbits {
    const ORIGIN: &'static str = "rabbits";

    fn create(_id: &str) -> Self {
        Rabbits::default()
    }
}

impl SingletonAggregate for Rabbits {}

#[derive(Debug, Serialize, Deserialize)]
struct RabbitAdded {
    name: String,
}

impl EventType for RabbitAdded {
    const EVENT_TYPE: &'static str = "added";
    const ORIGIN: &'static str = "rabbit";
}

#[derive(Debug, Serialize, Deserialize)]
struct RabbitRemoved {}

impl EventType for RabbitRemoved {
    const EVENT_TYPE: &'static str = "removed";
    const ORIGIN: &'static str = "rabbit";
}

#[derive(Debug, Serialize, Deserialize)]
struct RabbitNumberIsEven {
    count: u64,
}

impl EventType for RabbitNumberIsEven {
    const EVENT_TYPE: &'static str = "number_is_even";
    const ORIGIN: &'static str = "rabbits";
}

/// Counts added rabbits and reports every even total.
///
/// Keeps a running count, so re-running it over the same history is not
/// idempotent; the pipeline's `handled` markers make that visible.
#[derive(Default)]
struct RabbitCounter {
    seen: AtomicU64,
}

impl EventHandler<RabbitAdded> for RabbitCounter {
    fn handle(&self, _meta: &StoredEvent, _added: &RabbitAdded) -> Vec<PendingEvent> {
        let count = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if count % 2 == 0 {
            vec![PendingEvent::of(SINGLETON_ID, RabbitNumberIsEven { count })]
        } else {
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log = Arc::new(MemoryEventLog::new());
    let dispatcher = Dispatcher::new(log.clone(), WorkerPool::current()?);

    let rabbits = HandlerRegistry::<Rabbit>::builder()
        .on::<RabbitAdded, _>(|rabbit, _, added| rabbit.name = added.name.clone())
        .on::<RabbitRemoved, _>(|rabbit, _, _| rabbit.removed = true)
        .on_marker("init", |_, meta| println!("rabbit {} initialized", meta.aggregate_id))
        .build()?;
    let singleton = HandlerRegistry::<Rabbits>::builder()
        .on::<RabbitNumberIsEven, _>(|rabbits, _, even| rabbits.even_counts.push(even.count))
        .build()?;

    // History from before the pipeline started.
    log.append("rabbit", "r1", "init", String::new())?;
    dispatcher.store("rabbit", "r1", &RabbitAdded { name: "Bill".into() })?;

    let pipeline = Pipeline::<RabbitAdded, _>::builder("counter", dispatcher.clone(), RabbitCounter::default())
        .spawn();
    pipeline.wait_live().await?;

    for (id, name) in [("r2", "Jack"), ("r3", "Bugs"), ("r4", "Peter")] {
        dispatcher.store("rabbit", id, &RabbitAdded { name: name.into() })?;
    }
    dispatcher.store("rabbit", "r2", &RabbitRemoved {})?;
    dispatcher.pool().idle().await;
    pipeline.shutdown();

    let repo = Repository::new(dispatcher.clone(), rabbits);
    for id in ["r1", "r2", "r3", "r4"] {
        let root = repo.load(id)?;
        println!(
            "{id}: {:<6} removed={:<5} last_applied_sequence={:?}",
            root.state().name,
            root.state().removed,
            root.last_applied_sequence()
        );
    }

    let counts = Repository::new(dispatcher.clone(), singleton).load_singleton()?;
    println!("even counts reported: {:?}", counts.state().even_counts);

    let markers = dispatcher.read(HANDLERS_ORIGIN, "counter", 0)?;
    println!("handled markers: {}", markers.len());
    Ok(())
}
