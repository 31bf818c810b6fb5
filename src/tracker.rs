//! Deadline-based redelivery trigger over outstanding message ids.
//!
//! A coarse time wheel: ids land in the newest bucket, the wheel rotates on
//! a fixed tick, and ids still present when their bucket reaches the front
//! are posted to the core actor as a redelivery event. The tracker never
//! touches the consumer's queues itself.

use crate::core::CoreEvent;
use crate::message::MessageId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Wheel {
    buckets: VecDeque<HashSet<MessageId>>,
    live: HashSet<MessageId>,
}

impl Wheel {
    fn new(bucket_count: usize) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| HashSet::new()).collect(),
            live: HashSet::new(),
        }
    }

    /// Rotate one tick; returns the ids whose deadline expired.
    fn rotate(&mut self) -> HashSet<MessageId> {
        let expired_bucket = self.buckets.pop_front().unwrap_or_default();
        self.buckets.push_back(HashSet::new());

        let mut expired = HashSet::new();
        for id in expired_bucket {
            if self.live.remove(&id) {
                expired.insert(id);
            }
        }
        expired
    }
}

pub(crate) struct UnackedTracker {
    wheel: Option<Arc<Mutex<Wheel>>>,
    stop_token: CancellationToken,
}

impl UnackedTracker {
    /// Tracker with redelivery disabled; every operation is a no-op.
    pub fn disabled() -> Self {
        Self {
            wheel: None,
            stop_token: CancellationToken::new(),
        }
    }

    /// Start a tracker that redelivers ids unacknowledged for `ack_timeout`,
    /// checked at `tick` granularity.
    pub fn start(
        ack_timeout: Duration,
        tick: Duration,
        events: mpsc::UnboundedSender<CoreEvent>,
    ) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let bucket_count = (ack_timeout.as_millis() / tick.as_millis()).max(1) as usize + 1;
        let wheel = Arc::new(Mutex::new(Wheel::new(bucket_count)));
        let stop_token = CancellationToken::new();

        let timer_wheel = wheel.clone();
        let timer_token = stop_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let expired = timer_wheel.lock().rotate();
                if expired.is_empty() {
                    continue;
                }
                debug!(count = expired.len(), "ack timeout expired, requesting redelivery");
                if events
                    .send(CoreEvent::Redeliver {
                        ids: expired,
                        reply: None,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        Self {
            wheel: Some(wheel),
            stop_token,
        }
    }

    /// Track a message delivered to the caller.
    pub fn add(&self, id: MessageId) {
        let Some(wheel) = &self.wheel else { return };
        let mut wheel = wheel.lock();
        if wheel.live.insert(id.clone()) {
            wheel.buckets.back_mut().expect("wheel has buckets").insert(id);
        }
    }

    /// Stop tracking one id. Idempotent.
    pub fn remove(&self, id: &MessageId) {
        if let Some(wheel) = &self.wheel {
            wheel.lock().live.remove(id);
        }
    }

    /// Stop tracking every id on `id`'s (topic, partition) up to and
    /// including `id`.
    pub fn remove_until(&self, id: &MessageId) {
        let Some(wheel) = &self.wheel else { return };
        wheel
            .lock()
            .live
            .retain(|tracked| !matches!(tracked.partial_cmp(id), Some(o) if o.is_le()));
    }

    /// Drop every tracked id.
    pub fn clear(&self) {
        let Some(wheel) = &self.wheel else { return };
        let mut wheel = wheel.lock();
        wheel.live.clear();
        for bucket in &mut wheel.buckets {
            bucket.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.wheel.as_ref().map_or(0, |w| w.lock().live.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the tick task.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }
}

impl Drop for UnackedTracker {
    fn drop(&mut self) {
        self.stop_token.cancel();
    }
}
