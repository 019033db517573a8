//! Catch-up + live processing pipeline for one event handler.
//!
//! A pipeline subscribes a handler to one `(origin, event_type)` pair. It
//! first replays recent history in timestamp order, then switches to live
//! delivery once the log confirms nothing is left to replay. Every processed
//! event produces one atomic batch: the handler's derived events plus a
//! `handled` marker on the `("handlers", handler_id)` bookkeeping stream.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{Dispatcher, LiveSubscription, TypedCatchUp};
use crate::error::{DispatchError, PipelineError};
use crate::event::{EventId, EventType, PendingEvent, StoredEvent, TypedEvent};

/// Origin of the bookkeeping streams that record processed events.
pub const HANDLERS_ORIGIN: &str = "handlers";

/// Event type of the completion marker written for every processed event.
pub const HANDLED_EVENT_TYPE: &str = "handled";

const CLOCK_POLL: Duration = Duration::from_millis(1);

/// Turns one committed event into the events it causes.
///
/// Must be a pure function of the event metadata and payload: after a crash
/// an event can be delivered again, and only the bookkeeping marker may
/// differ between runs.
pub trait EventHandler<T>: Send + Sync + 'static {
    /// Derive the events caused by `payload`.
    fn handle(&self, meta: &StoredEvent, payload: &T) -> Vec<PendingEvent>;
}

impl<T, F> EventHandler<T> for F
where
    F: Fn(&StoredEvent, &T) -> Vec<PendingEvent> + Send + Sync + 'static,
{
    fn handle(&self, meta: &StoredEvent, payload: &T) -> Vec<PendingEvent> {
        self(meta, payload)
    }
}

/// Tuning for a [`Pipeline`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventpipe_es::PipelineConfig;
///
/// let config = PipelineConfig {
///     lookback: Duration::from_secs(3600),
///     ..PipelineConfig::default()
/// };
/// assert!(!config.skip_handled);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How far back catch-up starts, relative to the pipeline clock.
    ///
    /// Default: one day.
    pub lookback: Duration,

    /// Skip events that already have a `handled` marker from this handler.
    ///
    /// When `false`, markers are written but not consulted, so restarting a
    /// pipeline re-runs the handler over the lookback window.
    ///
    /// Default: `false`.
    pub skip_handled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(24 * 60 * 60),
            skip_handled: false,
        }
    }
}

/// Lifecycle of a running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    /// Replaying history.
    CatchingUp,
    /// Subscribed; new events are processed as they are committed.
    Live,
    /// Catch-up failed with the given reason. No subscription is active.
    Failed(String),
    /// Shut down; deliveries are ignored.
    Stopped,
}

struct Shared {
    state: watch::Sender<PipelineState>,
    stopped: AtomicBool,
    handled: Mutex<HashSet<EventId>>,
    subscription: Mutex<Option<LiveSubscription>>,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn handled(&self) -> std::sync::MutexGuard<'_, HashSet<EventId>> {
        self.handled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The subscription's callback holds the pipeline, which holds this
    // struct; cancelling breaks that cycle.
    fn cancel_subscription(&self) {
        let taken = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = taken {
            subscription.cancel();
        }
    }
}

/// One handler bound to one `(origin, event_type)` subscription.
///
/// Built with [`Pipeline::builder`] and started with [`Pipeline::spawn`].
pub struct Pipeline<T, H> {
    handler_id: String,
    origin: String,
    dispatcher: Dispatcher,
    handler: H,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    _payload: PhantomData<fn(T)>,
}

impl<T, H> Pipeline<T, H>
where
    T: EventType,
    H: EventHandler<T>,
{
    /// Start configuring a pipeline.
    ///
    /// # Arguments
    ///
    /// * `handler_id` - Names the bookkeeping stream `("handlers", handler_id)`.
    ///   Must be unique per handler.
    /// * `dispatcher` - Source of events and sink of derived batches. Its
    ///   worker pool runs catch-up, live deliveries, and batch appends.
    /// * `handler` - The event handler.
    pub fn builder(
        handler_id: impl Into<String>,
        dispatcher: Dispatcher,
        handler: H,
    ) -> PipelineBuilder<T, H> {
        PipelineBuilder {
            handler_id: handler_id.into(),
            dispatcher,
            handler,
            config: PipelineConfig::default(),
            clock: Arc::new(SystemClock),
            origin: T::ORIGIN.to_owned(),
            _payload: PhantomData,
        }
    }

    /// Handler id.
    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// The batch one event produces: the handler's output followed by the
    /// `handled` marker. Does not touch the log.
    pub fn derive(&self, event: &TypedEvent<T>) -> Vec<PendingEvent> {
        let mut batch = self.handler.handle(&event.meta, &event.payload);
        batch.push(PendingEvent::marker(
            HANDLERS_ORIGIN,
            self.handler_id.clone(),
            HANDLED_EVENT_TYPE,
        ));
        batch
    }

    /// Process one event: derive its batch and submit the append to the
    /// worker pool. The append records `cause_id = event.id` and
    /// `corr_id = event.corr_id`.
    pub fn process(&self, event: &TypedEvent<T>) {
        let cause = event.meta.id;
        if self.config.skip_handled && self.shared.handled().contains(&cause) {
            tracing::debug!(
                handler_id = %self.handler_id,
                event_id = %cause,
                "event already handled; skipping"
            );
            return;
        }

        let batch = self.derive(event);
        let corr = event.meta.corr_id;
        let dispatcher = self.dispatcher.clone();
        let shared = Arc::clone(&self.shared);
        let handler_id = self.handler_id.clone();
        let remember = self.config.skip_handled;
        self.dispatcher.pool().submit(move || {
            match dispatcher.store_batch(Some(cause), Some(corr), batch) {
                Ok(count) => {
                    if remember {
                        shared.handled().insert(cause);
                    }
                    tracing::debug!(%handler_id, event_id = %cause, count, "derived batch stored");
                }
                Err(e) => {
                    tracing::error!(
                        %handler_id,
                        event_id = %cause,
                        error = %e,
                        "failed to store derived batch"
                    );
                }
            }
        });
    }

    /// Start catch-up on the dispatcher's worker pool.
    pub fn spawn(self) -> PipelineHandle {
        let handle = PipelineHandle {
            handler_id: self.handler_id.clone(),
            shared: Arc::clone(&self.shared),
            state: self.shared.state.subscribe(),
        };
        let pipeline = Arc::new(self);
        let pool = pipeline.dispatcher.pool().clone();
        pool.submit(move || pipeline.run_catch_up());
        handle
    }

    fn run_catch_up(self: &Arc<Self>) {
        let span = tracing::debug_span!(
            "catch_up",
            handler_id = %self.handler_id,
            origin = %self.origin,
            event_type = T::EVENT_TYPE,
        );
        let _enter = span.enter();

        match self.catch_up() {
            Ok(()) => {
                let went_live = self.shared.state.send_if_modified(|state| {
                    if *state == PipelineState::CatchingUp {
                        *state = PipelineState::Live;
                        true
                    } else {
                        false
                    }
                });
                if went_live {
                    tracing::info!(handler_id = %self.handler_id, "pipeline live");
                }
            }
            Err(PipelineError::Stopped) => {
                tracing::info!(handler_id = %self.handler_id, "pipeline stopped during catch-up");
            }
            Err(e) => {
                tracing::error!(
                    handler_id = %self.handler_id,
                    error = %e,
                    "pipeline catch-up failed"
                );
                self.shared
                    .state
                    .send_replace(PipelineState::Failed(e.to_string()));
            }
        }
    }

    fn catch_up(self: &Arc<Self>) -> Result<(), PipelineError> {
        if self.config.skip_handled {
            self.load_handled()?;
        }

        let lookback = u64::try_from(self.config.lookback.as_millis()).unwrap_or(u64::MAX);
        let mut since = self.clock.now_millis().saturating_sub(lookback);
        // Ids already processed at the `since` instant.
        let mut seen: HashSet<EventId> = HashSet::new();

        loop {
            if self.shared.is_stopped() {
                return Err(PipelineError::Stopped);
            }

            // Read before replaying: commits after this point are stamped at
            // or past `horizon`.
            let horizon = self.dispatcher.log().now();
            let live = Arc::clone(self);
            let outcome = self.dispatcher.catch_up_typed::<T, _>(
                &self.origin,
                since,
                move |delivery| live.on_live(delivery),
            )?;
            let mut batch = match outcome {
                TypedCatchUp::Replay(batch) => batch,
                TypedCatchUp::Subscribed(subscription) => {
                    *self
                        .shared
                        .subscription
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
                    // A shutdown that ran before the slot was filled missed it.
                    if self.shared.is_stopped() {
                        self.shared.cancel_subscription();
                        return Err(PipelineError::Stopped);
                    }
                    tracing::debug!(since, "subscribed");
                    return Ok(());
                }
            };
            if batch.is_empty() {
                tracing::error!(since, "log returned an empty replay batch");
                return Err(PipelineError::EmptyReplay {
                    origin: self.origin.clone(),
                    event_type: T::EVENT_TYPE.to_owned(),
                });
            }

            batch.sort_by_key(|event| (event.meta.stored_at, event.meta.id));
            let mut fresh = 0usize;
            for event in &batch {
                if event.meta.stored_at == since && seen.contains(&event.meta.id) {
                    continue;
                }
                if self.shared.is_stopped() {
                    return Err(PipelineError::Stopped);
                }
                self.process(event);
                fresh += 1;
            }
            tracing::debug!(since, count = batch.len(), fresh, "replay batch processed");

            if fresh == 0 {
                // Everything at `since` is done. Step past it only when no
                // later commit can land there; otherwise look again.
                if horizon > since {
                    since += 1;
                    seen.clear();
                } else {
                    std::thread::sleep(CLOCK_POLL);
                }
                continue;
            }

            let newest = batch[batch.len() - 1].meta.stored_at;
            if newest != since {
                seen.clear();
                since = newest;
            }
            seen.extend(
                batch
                    .iter()
                    .filter(|event| event.meta.stored_at == newest)
                    .map(|event| event.meta.id),
            );
        }
    }

    fn load_handled(&self) -> Result<(), PipelineError> {
        let markers = self
            .dispatcher
            .read(HANDLERS_ORIGIN, &self.handler_id, 0)?;
        let mut handled = self.shared.handled();
        handled.extend(
            markers
                .iter()
                .filter(|marker| marker.event_type == HANDLED_EVENT_TYPE)
                .filter_map(|marker| marker.cause_id),
        );
        tracing::debug!(count = handled.len(), "loaded handled markers");
        Ok(())
    }

    fn on_live(&self, delivery: Result<TypedEvent<T>, DispatchError>) {
        if self.shared.is_stopped() {
            return;
        }
        match delivery {
            Ok(event) => self.process(&event),
            Err(e) => {
                tracing::error!(
                    handler_id = %self.handler_id,
                    error = %e,
                    "failed to decode live event"
                );
            }
        }
    }
}

impl<T, H> fmt::Debug for Pipeline<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handler_id", &self.handler_id)
            .field("origin", &self.origin)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<T, H> {
    handler_id: String,
    dispatcher: Dispatcher,
    handler: H,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    origin: String,
    _payload: PhantomData<fn(T)>,
}

impl<T, H> PipelineBuilder<T, H>
where
    T: EventType,
    H: EventHandler<T>,
{
    /// Replace the whole configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// How far back catch-up starts.
    pub fn lookback(mut self, lookback: Duration) -> Self {
        self.config.lookback = lookback;
        self
    }

    /// Consult `handled` markers during catch-up.
    pub fn skip_handled(mut self, skip: bool) -> Self {
        self.config.skip_handled = skip;
        self
    }

    /// Clock used to compute the initial watermark.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Subscribe to an origin other than `T::ORIGIN`.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Finish without starting.
    pub fn build(self) -> Pipeline<T, H> {
        let (state, _) = watch::channel(PipelineState::CatchingUp);
        Pipeline {
            handler_id: self.handler_id,
            origin: self.origin,
            dispatcher: self.dispatcher,
            handler: self.handler,
            config: self.config,
            clock: self.clock,
            shared: Arc::new(Shared {
                state,
                stopped: AtomicBool::new(false),
                handled: Mutex::new(HashSet::new()),
                subscription: Mutex::new(None),
            }),
            _payload: PhantomData,
        }
    }

    /// Build and start catch-up.
    pub fn spawn(self) -> PipelineHandle {
        self.build().spawn()
    }
}

/// Control handle for a running pipeline.
///
/// `Clone` is cheap. Dropping every handle does **not** stop the pipeline;
/// call [`shutdown`](PipelineHandle::shutdown).
#[derive(Clone)]
pub struct PipelineHandle {
    handler_id: String,
    shared: Arc<Shared>,
    state: watch::Receiver<PipelineState>,
}

impl PipelineHandle {
    /// Handler id of the pipeline.
    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        PipelineState::clone(&self.state.borrow())
    }

    /// Returns `true` once catch-up finished and the subscription is active.
    pub fn is_live(&self) -> bool {
        *self.state.borrow() == PipelineState::Live
    }

    /// Wait until catch-up has finished.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CatchUpFailed`] if catch-up failed, or
    /// [`PipelineError::Stopped`] if the pipeline was shut down first.
    pub async fn wait_live(&self) -> Result<(), PipelineError> {
        let mut rx = self.state.clone();
        let state = PipelineState::clone(
            &*rx.wait_for(|state| *state != PipelineState::CatchingUp)
                .await
                .map_err(|_| PipelineError::Stopped)?,
        );
        match state {
            PipelineState::Live => Ok(()),
            PipelineState::Failed(reason) => Err(PipelineError::CatchUpFailed(reason)),
            PipelineState::Stopped | PipelineState::CatchingUp => Err(PipelineError::Stopped),
        }
    }

    /// Stop the pipeline. Pending catch-up stops at the next event and the
    /// live subscription is removed from the log; a delivery already in
    /// flight is ignored. Batches already submitted still commit.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.cancel_subscription();
        self.shared.state.send_replace(PipelineState::Stopped);
        tracing::info!(handler_id = %self.handler_id, "pipeline shut down");
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("handler_id", &self.handler_id)
            .field("state", &self.state())
            .finish()
    }
}
