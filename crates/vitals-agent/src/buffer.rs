//! Local event buffer: one ordered, bounded, persisted queue per category.
//!
//! Each category lives behind its own mutex and is mirrored to a JSON
//! snapshot in the state directory. Every mutation first writes the new
//! snapshot (temp file + fsync + rename) and only then updates memory, so a
//! failed write leaves both copies at the previous state.
//!
//! Events leave the buffer only through [`EventBuffer::commit`], which the
//! scheduler calls after a confirmed upload or a permanent rejection.

use crate::config::OverflowPolicy;
use crate::error::BufferError;
use crate::event::{Category, Event};
use crate::paths::{self, StatePaths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// Gaps beyond this many are counted but not listed individually.
const MAX_REPORTED_GAPS: usize = 32;

// ---------------------------------------------------------------------------
// Snapshot format
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    version: u32,
    category: Category,
    next_sequence_id: u64,
    committed_through: u64,
    dropped_through: u64,
    dropped: u64,
    events: Vec<&'a Event>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: u32,
    category: Category,
    next_sequence_id: u64,
    committed_through: u64,
    #[serde(default)]
    dropped_through: u64,
    #[serde(default)]
    dropped: u64,
    events: Vec<Event>,
}

/// Missing sequence ids found on reload: everything strictly between
/// `after` and `before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceGap {
    pub after: u64,
    pub before: u64,
}

impl SequenceGap {
    pub fn missing(&self) -> u64 {
        self.before.saturating_sub(self.after).saturating_sub(1)
    }
}

/// What reloading one category found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub restored: usize,
    pub gaps: Vec<SequenceGap>,
    pub missing: u64,
    pub recovered_from_corruption: bool,
}

/// Point-in-time view of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub category: Category,
    pub pending: usize,
    /// Zero in status files written before capacity was recorded.
    #[serde(default)]
    pub capacity: usize,
    pub next_sequence_id: u64,
    pub committed_through: u64,
    pub dropped: u64,
}

// ---------------------------------------------------------------------------
// Per-category queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CategoryQueue {
    category: Category,
    path: Option<PathBuf>,
    events: VecDeque<Event>,
    next_sequence_id: u64,
    committed_through: u64,
    dropped_through: u64,
    dropped: u64,
    report: ReloadReport,
}

impl CategoryQueue {
    fn empty(category: Category, path: Option<PathBuf>) -> Self {
        Self {
            category,
            path,
            events: VecDeque::new(),
            next_sequence_id: 1,
            committed_through: 0,
            dropped_through: 0,
            dropped: 0,
            report: ReloadReport::default(),
        }
    }

    fn load(category: Category, path: PathBuf) -> Self {
        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Self::empty(category, Some(path));
            }
            Err(e) => {
                error!(category = %category, path = %path.display(), error = %e, "cannot read buffer snapshot");
                return Self::recover(category, path);
            }
        };
        let snapshot = match serde_json::from_slice::<Snapshot>(&content) {
            Ok(s) if s.version == SNAPSHOT_VERSION && s.category == category => s,
            Ok(s) => {
                error!(
                    category = %category,
                    version = s.version,
                    stored_category = %s.category,
                    "buffer snapshot does not match this category or format version"
                );
                return Self::recover(category, path);
            }
            Err(e) => {
                error!(category = %category, path = %path.display(), error = %e, "corrupt buffer snapshot");
                return Self::recover(category, path);
            }
        };

        let mut events = snapshot.events;
        events.retain(|e| e.category == category && e.sequence_id > snapshot.committed_through);
        events.sort_by_key(|e| e.sequence_id);
        events.dedup_by_key(|e| e.sequence_id);

        let last_stored = events.last().map(|e| e.sequence_id).unwrap_or(0);
        let floor = snapshot.committed_through.max(snapshot.dropped_through);
        let next_sequence_id = snapshot
            .next_sequence_id
            .max(last_stored + 1)
            .max(floor + 1);

        let report = detect_gaps(floor, &events);
        let mut queue = Self {
            category,
            path: Some(path),
            events: events.into(),
            next_sequence_id,
            committed_through: snapshot.committed_through,
            dropped_through: snapshot.dropped_through,
            dropped: snapshot.dropped,
            report,
        };
        queue.report.restored = queue.events.len();
        queue
    }

    /// Move an unreadable snapshot aside and start the category empty.
    fn recover(category: Category, path: PathBuf) -> Self {
        let mut aside = path.clone().into_os_string();
        aside.push(".corrupt");
        if let Err(e) = std::fs::rename(&path, &aside) {
            warn!(category = %category, error = %e, "could not move corrupt snapshot aside");
        }
        let mut queue = Self::empty(category, Some(path));
        queue.report.recovered_from_corruption = true;
        queue
    }

    fn persist<'a>(
        &self,
        events: impl Iterator<Item = &'a Event>,
        next_sequence_id: u64,
        committed_through: u64,
        dropped_through: u64,
        dropped: u64,
    ) -> Result<(), BufferError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            category: self.category,
            next_sequence_id,
            committed_through,
            dropped_through,
            dropped,
            events: events.collect(),
        };
        let bytes = serde_json::to_vec(&snapshot).map_err(|source| BufferError::Encode {
            category: self.category,
            source,
        })?;
        paths::write_atomic(path, &bytes).map_err(|source| BufferError::Persist {
            path: path.display().to_string(),
            source,
        })
    }

    fn stats(&self, capacity: usize) -> BufferStats {
        BufferStats {
            category: self.category,
            pending: self.events.len(),
            capacity,
            next_sequence_id: self.next_sequence_id,
            committed_through: self.committed_through,
            dropped: self.dropped,
        }
    }
}

/// Gaps between `floor` (last id known to be gone) and the stored events.
fn detect_gaps(floor: u64, events: &[Event]) -> ReloadReport {
    let mut report = ReloadReport::default();
    let mut previous = floor;
    for event in events {
        if event.sequence_id > previous + 1 {
            let gap = SequenceGap {
                after: previous,
                before: event.sequence_id,
            };
            report.missing += gap.missing();
            if report.gaps.len() < MAX_REPORTED_GAPS {
                report.gaps.push(gap);
            }
        }
        previous = event.sequence_id;
    }
    report
}

// ---------------------------------------------------------------------------
// Public buffer
// ---------------------------------------------------------------------------

/// Bounded per-category event queues shared by ingestion and upload.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    policy: OverflowPolicy,
    vitals: Mutex<CategoryQueue>,
    feedings: Mutex<CategoryQueue>,
}

impl EventBuffer {
    /// Open (or create) the persisted buffer under `paths`, reloading any
    /// events left by a previous run.
    pub fn open(
        paths: &StatePaths,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<Self, BufferError> {
        std::fs::create_dir_all(paths.root()).map_err(|source| BufferError::Persist {
            path: paths.root().display().to_string(),
            source,
        })?;
        let buffer = Self {
            capacity,
            policy,
            vitals: Mutex::new(CategoryQueue::load(
                Category::Vitals,
                paths.buffer_snapshot(Category::Vitals),
            )),
            feedings: Mutex::new(CategoryQueue::load(
                Category::Feeding,
                paths.buffer_snapshot(Category::Feeding),
            )),
        };
        for category in Category::ALL {
            let queue = buffer.lock(category);
            let report = &queue.report;
            if report.missing > 0 {
                warn!(
                    category = %category,
                    missing = report.missing,
                    gaps = report.gaps.len(),
                    "sequence gaps detected in reloaded buffer"
                );
            }
            if report.restored > 0 {
                info!(
                    category = %category,
                    restored = report.restored,
                    next_sequence_id = queue.next_sequence_id,
                    "buffer reloaded"
                );
            }
        }
        Ok(buffer)
    }

    /// Buffer with no backing files.
    pub fn in_memory(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            policy,
            vitals: Mutex::new(CategoryQueue::empty(Category::Vitals, None)),
            feedings: Mutex::new(CategoryQueue::empty(Category::Feeding, None)),
        }
    }

    fn lock(&self, category: Category) -> MutexGuard<'_, CategoryQueue> {
        let queue = match category {
            Category::Vitals => &self.vitals,
            Category::Feeding => &self.feedings,
        };
        queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `enqueue` would currently accept an event for `category`.
    pub fn accepts(&self, category: Category) -> bool {
        self.policy == OverflowPolicy::DropOldest || self.len(category) < self.capacity
    }

    /// Sequence `payload` as the next event of `category` and append it.
    pub fn enqueue(
        &self,
        category: Category,
        payload: serde_json::Value,
        captured_at: DateTime<Utc>,
    ) -> Result<Event, BufferError> {
        let mut q = self.lock(category);
        let evict = q.events.len() >= self.capacity;
        if evict && self.policy == OverflowPolicy::RejectNew {
            return Err(BufferError::BufferFull {
                category,
                capacity: self.capacity,
            });
        }

        let event = Event {
            category,
            sequence_id: q.next_sequence_id,
            captured_at,
            payload,
        };
        let skip = usize::from(evict);
        let (dropped_through, dropped) = match q.events.front() {
            Some(oldest) if evict => (oldest.sequence_id, q.dropped + 1),
            _ => (q.dropped_through, q.dropped),
        };
        q.persist(
            q.events.iter().skip(skip).chain(std::iter::once(&event)),
            event.sequence_id + 1,
            q.committed_through,
            dropped_through,
            dropped,
        )?;

        if evict && let Some(oldest) = q.events.pop_front() {
            warn!(
                category = %category,
                sequence_id = oldest.sequence_id,
                "buffer full, dropped oldest event"
            );
        }
        q.events.push_back(event.clone());
        q.next_sequence_id = event.sequence_id + 1;
        q.dropped_through = dropped_through;
        q.dropped = dropped;
        Ok(event)
    }

    /// Up to `max_size` oldest events, left in place.
    pub fn peek_batch(&self, category: Category, max_size: usize) -> Vec<Event> {
        self.lock(category)
            .events
            .iter()
            .take(max_size)
            .cloned()
            .collect()
    }

    /// Remove every event with `sequence_id <= up_to`. Returns how many were
    /// removed; replaying a commit is a no-op that returns 0.
    pub fn commit(&self, category: Category, up_to: u64) -> Result<usize, BufferError> {
        let mut q = self.lock(category);
        let last_issued = q.next_sequence_id.saturating_sub(1);
        let committed_through = q.committed_through.max(up_to.min(last_issued));
        let removed = q
            .events
            .iter()
            .take_while(|e| e.sequence_id <= up_to)
            .count();
        if removed == 0 && committed_through == q.committed_through {
            return Ok(0);
        }
        q.persist(
            q.events.iter().skip(removed),
            q.next_sequence_id,
            committed_through,
            q.dropped_through,
            q.dropped,
        )?;
        q.events.drain(..removed);
        q.committed_through = committed_through;
        Ok(removed)
    }

    /// Put `events` back at the head in their original order. Events that are
    /// still buffered or already committed are skipped. Returns how many were
    /// reinserted.
    pub fn requeue(&self, category: Category, events: Vec<Event>) -> Result<usize, BufferError> {
        let mut q = self.lock(category);
        let present: BTreeSet<u64> = q.events.iter().map(|e| e.sequence_id).collect();
        let mut restored: Vec<Event> = events
            .into_iter()
            .filter(|e| {
                e.category == category
                    && e.sequence_id > q.committed_through
                    && !present.contains(&e.sequence_id)
            })
            .collect();
        if restored.is_empty() {
            return Ok(0);
        }
        restored.sort_by_key(|e| e.sequence_id);
        restored.dedup_by_key(|e| e.sequence_id);

        let mut merged: Vec<Event> = restored
            .iter()
            .cloned()
            .chain(q.events.iter().cloned())
            .collect();
        merged.sort_by_key(|e| e.sequence_id);
        q.persist(
            merged.iter(),
            q.next_sequence_id,
            q.committed_through,
            q.dropped_through,
            q.dropped,
        )?;
        q.events = merged.into();
        Ok(restored.len())
    }

    pub fn len(&self, category: Category) -> usize {
        self.lock(category).events.len()
    }

    pub fn is_empty(&self, category: Category) -> bool {
        self.lock(category).events.is_empty()
    }

    pub fn stats(&self, category: Category) -> BufferStats {
        self.lock(category).stats(self.capacity)
    }

    pub fn reload_report(&self, category: Category) -> ReloadReport {
        self.lock(category).report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fill(buffer: &EventBuffer, category: Category, n: u64) {
        for i in 0..n {
            buffer
                .enqueue(category, json!({ "n": i }), Utc::now())
                .unwrap();
        }
    }

    fn ids(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.sequence_id).collect()
    }

    fn pending_ids(buffer: &EventBuffer, category: Category) -> Vec<u64> {
        ids(&buffer.peek_batch(category, usize::MAX))
    }

    #[test]
    fn enqueue_assigns_per_category_sequence() {
        let buffer = EventBuffer::in_memory(10, OverflowPolicy::RejectNew);
        let a = buffer.enqueue(Category::Vitals, json!(1), Utc::now()).unwrap();
        let b = buffer.enqueue(Category::Vitals, json!(2), Utc::now()).unwrap();
        let c = buffer.enqueue(Category::Feeding, json!(3), Utc::now()).unwrap();
        assert_eq!((a.sequence_id, b.sequence_id, c.sequence_id), (1, 2, 1));
        assert_eq!(buffer.len(Category::Vitals), 2);
        assert_eq!(buffer.len(Category::Feeding), 1);
    }

    #[test]
    fn reject_new_fails_when_full() {
        let buffer = EventBuffer::in_memory(3, OverflowPolicy::RejectNew);
        fill(&buffer, Category::Vitals, 3);
        let err = buffer
            .enqueue(Category::Vitals, json!(4), Utc::now())
            .unwrap_err();
        assert!(matches!(err, BufferError::BufferFull { capacity: 3, .. }));
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![1, 2, 3]);
        // A rejected event does not burn a sequence id.
        assert_eq!(buffer.stats(Category::Vitals).next_sequence_id, 4);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let buffer = EventBuffer::in_memory(3, OverflowPolicy::DropOldest);
        fill(&buffer, Category::Vitals, 5);
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![3, 4, 5]);
        assert_eq!(buffer.stats(Category::Vitals).dropped, 2);
    }

    #[test]
    fn peek_does_not_remove() {
        let buffer = EventBuffer::in_memory(10, OverflowPolicy::RejectNew);
        fill(&buffer, Category::Vitals, 4);
        assert_eq!(ids(&buffer.peek_batch(Category::Vitals, 2)), vec![1, 2]);
        assert_eq!(ids(&buffer.peek_batch(Category::Vitals, 2)), vec![1, 2]);
        assert_eq!(buffer.len(Category::Vitals), 4);
    }

    #[test]
    fn commit_removes_exactly_the_batch() {
        for total in 1..12u64 {
            for up_to in 0..=total {
                let buffer = EventBuffer::in_memory(32, OverflowPolicy::RejectNew);
                fill(&buffer, Category::Vitals, total);
                fill(&buffer, Category::Feeding, 2);
                let removed = buffer.commit(Category::Vitals, up_to).unwrap();
                assert_eq!(removed as u64, up_to);
                let expected: Vec<u64> = (up_to + 1..=total).collect();
                assert_eq!(pending_ids(&buffer, Category::Vitals), expected);
                assert_eq!(buffer.len(Category::Feeding), 2);
            }
        }
    }

    #[test]
    fn commit_replay_is_noop() {
        let buffer = EventBuffer::in_memory(10, OverflowPolicy::RejectNew);
        fill(&buffer, Category::Vitals, 5);
        assert_eq!(buffer.commit(Category::Vitals, 3).unwrap(), 3);
        assert_eq!(buffer.commit(Category::Vitals, 3).unwrap(), 0);
        assert_eq!(buffer.commit(Category::Vitals, 2).unwrap(), 0);
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![4, 5]);
        assert_eq!(buffer.stats(Category::Vitals).committed_through, 3);
    }

    #[test]
    fn commit_beyond_issued_ids_is_clamped() {
        let buffer = EventBuffer::in_memory(10, OverflowPolicy::RejectNew);
        fill(&buffer, Category::Vitals, 2);
        buffer.commit(Category::Vitals, 99).unwrap();
        assert_eq!(buffer.stats(Category::Vitals).committed_through, 2);
        let next = buffer.enqueue(Category::Vitals, json!(0), Utc::now()).unwrap();
        assert_eq!(next.sequence_id, 3);
    }

    #[test]
    fn requeue_restores_head_order() {
        let buffer = EventBuffer::in_memory(3, OverflowPolicy::DropOldest);
        fill(&buffer, Category::Vitals, 3);
        let in_flight = buffer.peek_batch(Category::Vitals, 2);
        // Two newer events evict the in-flight ones while the upload runs.
        fill(&buffer, Category::Vitals, 2);
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![3, 4, 5]);

        let restored = buffer.requeue(Category::Vitals, in_flight).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn requeue_skips_present_and_committed() {
        let buffer = EventBuffer::in_memory(10, OverflowPolicy::RejectNew);
        fill(&buffer, Category::Vitals, 4);
        let batch = buffer.peek_batch(Category::Vitals, 4);
        assert_eq!(buffer.requeue(Category::Vitals, batch.clone()).unwrap(), 0);
        buffer.commit(Category::Vitals, 2).unwrap();
        assert_eq!(buffer.requeue(Category::Vitals, batch).unwrap(), 0);
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![3, 4]);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path().to_path_buf());
        {
            let buffer = EventBuffer::open(&paths, 10, OverflowPolicy::RejectNew).unwrap();
            fill(&buffer, Category::Vitals, 6);
            fill(&buffer, Category::Feeding, 1);
            buffer.commit(Category::Vitals, 2).unwrap();
        }
        let buffer = EventBuffer::open(&paths, 10, OverflowPolicy::RejectNew).unwrap();
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![3, 4, 5, 6]);
        assert_eq!(pending_ids(&buffer, Category::Feeding), vec![1]);
        let report = buffer.reload_report(Category::Vitals);
        assert_eq!(report.restored, 4);
        assert!(report.gaps.is_empty());
        let next = buffer.enqueue(Category::Vitals, json!(0), Utc::now()).unwrap();
        assert_eq!(next.sequence_id, 7);
    }

    #[test]
    fn committed_everything_keeps_sequence_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path().to_path_buf());
        {
            let buffer = EventBuffer::open(&paths, 10, OverflowPolicy::RejectNew).unwrap();
            fill(&buffer, Category::Vitals, 3);
            buffer.commit(Category::Vitals, 3).unwrap();
        }
        let buffer = EventBuffer::open(&paths, 10, OverflowPolicy::RejectNew).unwrap();
        assert!(buffer.is_empty(Category::Vitals));
        let next = buffer.enqueue(Category::Vitals, json!(0), Utc::now()).unwrap();
        assert_eq!(next.sequence_id, 4);
    }

    #[test]
    fn corrupt_snapshot_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path().to_path_buf());
        std::fs::write(paths.buffer_snapshot(Category::Vitals), b"{not json").unwrap();

        let buffer = EventBuffer::open(&paths, 10, OverflowPolicy::RejectNew).unwrap();
        assert!(buffer.is_empty(Category::Vitals));
        assert!(buffer.reload_report(Category::Vitals).recovered_from_corruption);
        assert!(dir.path().join("buffer-vitals.json.corrupt").exists());
    }

    #[test]
    fn reload_reports_sequence_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path().to_path_buf());
        let snapshot = json!({
            "version": 1,
            "category": "vitals",
            "nextSequenceId": 9,
            "committedThrough": 2,
            "events": [
                { "category": "vitals", "sequenceId": 3, "capturedAt": "2024-01-01T00:00:00Z", "payload": {} },
                { "category": "vitals", "sequenceId": 6, "capturedAt": "2024-01-01T00:00:00Z", "payload": {} },
                { "category": "vitals", "sequenceId": 8, "capturedAt": "2024-01-01T00:00:00Z", "payload": {} }
            ]
        });
        std::fs::write(
            paths.buffer_snapshot(Category::Vitals),
            serde_json::to_vec(&snapshot).unwrap(),
        )
        .unwrap();

        let buffer = EventBuffer::open(&paths, 10, OverflowPolicy::RejectNew).unwrap();
        let report = buffer.reload_report(Category::Vitals);
        assert_eq!(
            report.gaps,
            vec![
                SequenceGap { after: 3, before: 6 },
                SequenceGap { after: 6, before: 8 }
            ]
        );
        assert_eq!(report.missing, 3);
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![3, 6, 8]);
    }

    #[test]
    fn dropped_head_is_not_a_gap() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path().to_path_buf());
        {
            let buffer = EventBuffer::open(&paths, 2, OverflowPolicy::DropOldest).unwrap();
            fill(&buffer, Category::Vitals, 5);
        }
        let buffer = EventBuffer::open(&paths, 2, OverflowPolicy::DropOldest).unwrap();
        assert_eq!(pending_ids(&buffer, Category::Vitals), vec![4, 5]);
        assert!(buffer.reload_report(Category::Vitals).gaps.is_empty());
        assert_eq!(buffer.stats(Category::Vitals).dropped, 3);
    }
}
