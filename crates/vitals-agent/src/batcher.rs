//! Batcher: turns the head of a category's buffer into an upload batch once
//! the upload quota allows it.

use crate::buffer::EventBuffer;
use crate::config::DeviceIdentity;
use crate::event::{Batch, Category, Event};
use crate::governor::{Activity, RateGovernor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Why no batch was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReady {
    /// Nothing buffered for the category.
    Empty,
    /// Upload quota for the current window is used up.
    QuotaExceeded,
}

/// Result of [`Batcher::build_next_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum NextBatch {
    Ready(Batch),
    NoBatchReady(NotReady),
}

#[derive(Debug)]
pub struct Batcher {
    buffer: Arc<EventBuffer>,
    governor: Arc<RateGovernor>,
    device: DeviceIdentity,
    batch_size: usize,
    /// Length of the last batch per category that failed transiently.
    retry: Mutex<HashMap<Category, usize>>,
}

impl Batcher {
    pub fn new(
        buffer: Arc<EventBuffer>,
        governor: Arc<RateGovernor>,
        device: DeviceIdentity,
        batch_size: usize,
    ) -> Self {
        Self {
            buffer,
            governor,
            device,
            batch_size: batch_size.max(1),
            retry: Mutex::new(HashMap::new()),
        }
    }

    /// Next batch for `category`, oldest events first.
    ///
    /// An empty category never spends upload quota. Partial batches are
    /// returned as-is rather than held back for a full one.
    pub fn build_next_batch(&self, category: Category) -> NextBatch {
        if self.buffer.is_empty(category) {
            return NextBatch::NoBatchReady(NotReady::Empty);
        }
        if !self.governor.try_consume(Activity::Upload) {
            return NextBatch::NoBatchReady(NotReady::QuotaExceeded);
        }
        let limit = self
            .retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .map_or(self.batch_size, |len| (*len).min(self.batch_size));
        let events = contiguous_prefix(self.buffer.peek_batch(category, limit));
        match Batch::new(self.device.as_str(), category, events) {
            Some(batch) => NextBatch::Ready(batch),
            None => NextBatch::NoBatchReady(NotReady::Empty),
        }
    }

    /// Remember a transiently failed batch so the next attempt re-forms the
    /// same sequence range.
    pub fn mark_retry(&self, batch: &Batch) {
        self.retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch.category(), batch.len());
    }

    pub fn clear_retry(&self, category: Category) {
        self.retry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&category);
    }
}

/// Longest run of consecutive sequence ids at the front of `events`.
fn contiguous_prefix(events: Vec<Event>) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    for event in events {
        if let Some(prev) = out.last()
            && event.sequence_id != prev.sequence_id + 1
        {
            break;
        }
        out.push(event);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::OverflowPolicy;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        buffer: Arc<EventBuffer>,
        batcher: Batcher,
    }

    fn fixture(uploads_per_hour: u32) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let buffer = Arc::new(EventBuffer::in_memory(100, OverflowPolicy::RejectNew));
        let governor = Arc::new(RateGovernor::new(clock.clone(), 60, 60, uploads_per_hour));
        let batcher = Batcher::new(buffer.clone(), governor, DeviceIdentity::new("crib-1"), 25);
        Fixture {
            clock,
            buffer,
            batcher,
        }
    }

    fn fill(buffer: &EventBuffer, category: Category, n: usize) {
        for i in 0..n {
            buffer.enqueue(category, json!({ "i": i }), Utc::now()).unwrap();
        }
    }

    fn ready(next: NextBatch) -> Batch {
        match next {
            NextBatch::Ready(batch) => batch,
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[test]
    fn thirty_events_make_a_full_then_partial_batch() {
        let f = fixture(4);
        fill(&f.buffer, Category::Vitals, 30);

        let first = ready(f.batcher.build_next_batch(Category::Vitals));
        assert_eq!(first.len(), 25);
        assert_eq!((first.first_sequence_id(), first.last_sequence_id()), (1, 25));
        f.buffer.commit(Category::Vitals, first.last_sequence_id()).unwrap();

        let second = ready(f.batcher.build_next_batch(Category::Vitals));
        assert_eq!(second.len(), 5);
        assert_eq!((second.first_sequence_id(), second.last_sequence_id()), (26, 30));
    }

    #[test]
    fn batches_never_mix_categories() {
        let f = fixture(4);
        fill(&f.buffer, Category::Vitals, 3);
        fill(&f.buffer, Category::Feeding, 2);
        let vitals = ready(f.batcher.build_next_batch(Category::Vitals));
        let feedings = ready(f.batcher.build_next_batch(Category::Feeding));
        assert!(vitals.events().iter().all(|e| e.category == Category::Vitals));
        assert!(feedings.events().iter().all(|e| e.category == Category::Feeding));
        assert_eq!(feedings.batch_id(), "crib-1-feedings-1-2");
    }

    #[test]
    fn empty_buffer_spends_no_quota() {
        let f = fixture(1);
        assert_eq!(
            f.batcher.build_next_batch(Category::Vitals),
            NextBatch::NoBatchReady(NotReady::Empty)
        );
        fill(&f.buffer, Category::Vitals, 1);
        assert!(matches!(
            f.batcher.build_next_batch(Category::Vitals),
            NextBatch::Ready(_)
        ));
    }

    #[test]
    fn exhausted_quota_holds_batches_until_rollover() {
        let f = fixture(4);
        fill(&f.buffer, Category::Vitals, 10);
        for _ in 0..4 {
            assert!(matches!(
                f.batcher.build_next_batch(Category::Vitals),
                NextBatch::Ready(_)
            ));
        }
        assert_eq!(
            f.batcher.build_next_batch(Category::Vitals),
            NextBatch::NoBatchReady(NotReady::QuotaExceeded)
        );
        f.clock.advance(Duration::from_secs(3600));
        assert!(matches!(
            f.batcher.build_next_batch(Category::Vitals),
            NextBatch::Ready(_)
        ));
    }

    #[test]
    fn retry_reforms_the_same_batch() {
        let f = fixture(4);
        fill(&f.buffer, Category::Vitals, 5);
        let failed = ready(f.batcher.build_next_batch(Category::Vitals));
        f.batcher.mark_retry(&failed);
        fill(&f.buffer, Category::Vitals, 3);

        let again = ready(f.batcher.build_next_batch(Category::Vitals));
        assert_eq!(again, failed);

        f.batcher.clear_retry(Category::Vitals);
        let widened = ready(f.batcher.build_next_batch(Category::Vitals));
        assert_eq!(widened.len(), 8);
    }

    #[test]
    fn batch_stops_at_a_sequence_gap() {
        let event = |seq| Event {
            category: Category::Vitals,
            sequence_id: seq,
            captured_at: Utc::now(),
            payload: json!({}),
        };
        let prefix = contiguous_prefix(vec![event(4), event(5), event(7), event(8)]);
        let ids: Vec<u64> = prefix.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }
}
