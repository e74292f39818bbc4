//! Per-partition aggregation engine
//!
//! The engine owns the open windows of one partition. Processing an event
//! happens in three steps that the consumer drives through its workflow:
//!
//! 1. [`AggregationEngine::assign_window`] picks the tumbling window and
//!    rejects events whose window has already closed (`LateEvent`).
//! 2. [`AggregationEngine::aggregate`] folds the event into every matching
//!    metric's state in memory, skipping redelivered events.
//! 3. [`AggregationEngine::persist`] writes the changed states with retry.
//!
//! Only after `persist` succeeds may the checkpoint advance. If any step
//! fails the in-memory state may be ahead of the store, so the owner must
//! drop the engine and load a new one.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use rollup_common::config::{AggregationConfig, MetricSpec};
use rollup_common::error::{AggregationError, Error, Result};
use rollup_common::event::Event;
use rollup_common::metrics;
use rollup_common::types::{AggregateRecord, Offset, Timestamp, WindowBounds, WindowStatus};
use rollup_storage::{decode, keys, DurableStore};

use crate::clock::SharedClock;
use crate::combine::contribution;
use crate::dedup::SeenEvents;
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::state::{self, AggregateState};
use crate::window::TumblingWindows;

/// (metric name, window start)
type StateKey = (String, Timestamp);

/// Effect of one event on the engine's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub offset: Offset,
    /// Metric windows whose state changed and must be persisted
    pub changed: Vec<(String, Timestamp)>,
    /// Metric windows that had already applied this event
    pub duplicates: usize,
}

impl ProcessOutcome {
    /// Outcome of an event that changed nothing
    pub fn empty(offset: Offset) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.changed.is_empty() && self.duplicates > 0
    }
}

pub struct AggregationEngine {
    partition_key: String,
    windows: TumblingWindows,
    metrics: Vec<MetricSpec>,
    dedup_capacity: usize,
    store: Arc<dyn DurableStore>,
    retry: RetryPolicy,
    clock: SharedClock,
    /// Windows not yet closed
    open: BTreeMap<StateKey, AggregateState>,
    /// Last offset handed to `aggregate`
    last_offset: Option<Offset>,
}

impl AggregationEngine {
    /// Load the open windows of `partition_key` from the store
    pub async fn load(
        partition_key: &str,
        config: &AggregationConfig,
        retry: RetryPolicy,
        store: Arc<dyn DurableStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        let windows = TumblingWindows::from_config(config)?;

        let states = retry_with_backoff(&retry, "load_partition", || {
            state::load_partition(store.as_ref(), partition_key)
        })
        .await
        .map_err(|e| e.error)?;

        let open: BTreeMap<StateKey, AggregateState> = states
            .into_iter()
            .filter(|s| !s.is_closed())
            .map(|s| ((s.record.metric_name.clone(), s.window_start()), s))
            .collect();

        info!(
            "Loaded aggregation engine for partition {} with {} open windows",
            partition_key,
            open.len()
        );

        Ok(Self {
            partition_key: partition_key.to_string(),
            windows,
            metrics: config.metrics.clone(),
            dedup_capacity: config.dedup_capacity,
            store,
            retry,
            clock,
            open,
            last_offset: None,
        })
    }

    // ========================================================================
    // Event Processing
    // ========================================================================

    /// Assign, aggregate and persist one event
    pub async fn process(&mut self, offset: Offset, event: &Event) -> Result<ProcessOutcome> {
        let window = self.assign_window(event)?;
        let outcome = self.aggregate(offset, event, window)?;
        self.persist(&outcome).await?;
        Ok(outcome)
    }

    /// Window of `event`, or `LateEvent` if that window has closed
    pub fn assign_window(&self, event: &Event) -> Result<WindowBounds> {
        if event.partition_key != self.partition_key {
            return Err(Error::Internal(format!(
                "event {} belongs to partition {}, not {}",
                event.event_id, event.partition_key, self.partition_key
            )));
        }

        let window = self.windows.assign(event.timestamp);
        let now = self.clock.now_millis();
        if self.windows.is_closed(&window, now) {
            metrics::record_late_event(&self.partition_key);
            return Err(Error::Aggregation(AggregationError::LateEvent {
                event_id: event.event_id.clone(),
                window_start: window.start,
                window_end: window.end,
                closed_at: self.windows.close_time(&window),
            }));
        }

        Ok(window)
    }

    /// Fold `event` into the in-memory state of every matching metric
    pub fn aggregate(
        &mut self,
        offset: Offset,
        event: &Event,
        window: WindowBounds,
    ) -> Result<ProcessOutcome> {
        if let Some(last) = self.last_offset {
            if offset <= last {
                return Err(Error::Aggregation(AggregationError::OutOfOrder {
                    partition_key: self.partition_key.clone(),
                    expected: last + 1,
                    got: offset,
                }));
            }
        }
        self.last_offset = Some(offset);

        let mut outcome = ProcessOutcome::empty(offset);

        for spec in &self.metrics {
            let Some(contribution) = contribution(spec, event) else {
                continue;
            };

            let key = (spec.name.clone(), window.start);
            let state = self.open.entry(key.clone()).or_insert_with(|| {
                AggregateState::new(&self.partition_key, &spec.name, window, spec.function)
            });

            // Already folded in before a crash, or redelivered by the producer
            let replayed = offset <= state.last_offset;
            let repeated = !spec.function.is_idempotent()
                && !state.seen.insert(&event.event_id, self.dedup_capacity);
            if replayed || repeated {
                outcome.duplicates += 1;
                continue;
            }

            state.accumulator.apply(&contribution);
            state.record.update_count += 1;
            state.last_offset = offset;
            state.sync_value();
            outcome.changed.push(key);
        }

        if outcome.is_duplicate() {
            debug!(
                "Skipped duplicate event {} at offset {} of partition {}",
                event.event_id, offset, self.partition_key
            );
            metrics::record_duplicate_event();
        } else if !outcome.changed.is_empty() {
            metrics::record_event_processed(&self.partition_key);
        }

        Ok(outcome)
    }

    /// Write the states changed by `outcome`
    pub async fn persist(&self, outcome: &ProcessOutcome) -> Result<()> {
        for key in &outcome.changed {
            let Some(state) = self.open.get(key) else {
                return Err(Error::Internal(format!(
                    "no open state for metric {} window {}",
                    key.0, key.1
                )));
            };
            self.write(state, outcome.offset).await?;
        }
        Ok(())
    }

    async fn write(&self, state: &AggregateState, offset: Offset) -> Result<()> {
        retry_with_backoff(&self.retry, "put_aggregate", || {
            state::save(self.store.as_ref(), state)
        })
        .await
        .map(|_| ())
        .map_err(|failure| self.persist_error(failure, offset))
    }

    fn persist_error(&self, failure: RetryError, offset: Offset) -> Error {
        if failure.exhausted() {
            metrics::record_persist_failure(&self.partition_key);
            Error::Aggregation(AggregationError::PersistFailure {
                partition_key: self.partition_key.clone(),
                offset,
                attempts: failure.attempts,
                reason: failure.error.to_string(),
            })
        } else {
            failure.error
        }
    }

    // ========================================================================
    // Window Closure
    // ========================================================================

    /// Mark every window with `window_end + lateness < now` as closed and
    /// persist it. Returns the closed records in window order.
    pub async fn close_due_windows(&mut self, now: Timestamp) -> Result<Vec<AggregateRecord>> {
        let due = self.due_windows(now);

        let mut closed = Vec::with_capacity(due.len());
        for key in due {
            let Some(mut state) = self.open.get(&key).cloned() else {
                continue;
            };
            state.record.status = WindowStatus::Closed;
            // Closed windows reject every event as late
            state.seen = SeenEvents::new();

            if let Err(e) = self.write(&state, state.last_offset).await {
                warn!(
                    "Failed to close window {} of {}/{}: {}",
                    state.window_start(),
                    self.partition_key,
                    key.0,
                    e
                );
                return Err(e);
            }

            self.open.remove(&key);
            metrics::record_window_closed(&key.0);
            debug!(
                "Closed window [{}, {}) of {}/{} with value {}",
                state.record.window_start,
                state.record.window_end,
                self.partition_key,
                key.0,
                state.record.value
            );
            closed.push(state.record);
        }

        closed.sort_by_key(|r| (r.window_start, r.metric_name.clone()));
        Ok(closed)
    }

    /// (metric, window start) of open windows due to close at `now`
    pub fn due_windows(&self, now: Timestamp) -> Vec<(String, Timestamp)> {
        self.open
            .iter()
            .filter(|(_, s)| self.windows.is_closed(&s.window(), now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Stored record of a window, if that window has been closed
    pub async fn closed_record(
        &self,
        metric_name: &str,
        window_start: Timestamp,
    ) -> Result<Option<AggregateRecord>> {
        let key = keys::aggregate(&self.partition_key, metric_name, window_start);
        let stored = retry_with_backoff(&self.retry, "get_aggregate", || self.store.get(&key))
            .await
            .map_err(|e| e.error)?;

        let Some(stored) = stored else {
            return Ok(None);
        };
        let state: AggregateState = decode(&stored.value)?;
        Ok(state.is_closed().then_some(state.record))
    }

    /// Close windows due at the engine clock's current time
    pub async fn close_expired(&mut self) -> Result<Vec<AggregateRecord>> {
        let now = self.clock.now_millis();
        self.close_due_windows(now).await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn windows(&self) -> &TumblingWindows {
        &self.windows
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    /// In-memory record of an open window
    pub fn open_record(&self, metric_name: &str, window_start: Timestamp) -> Option<&AggregateRecord> {
        self.open
            .get(&(metric_name.to_string(), window_start))
            .map(|s| &s.record)
    }
}
