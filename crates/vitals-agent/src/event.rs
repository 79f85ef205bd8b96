//! Event model: categories, readings from the source, buffered events and
//! upload batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event category. Each category has its own buffer, sequence and route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "vitals")]
    Vitals,
    #[serde(rename = "feedings", alias = "feeding")]
    Feeding,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Vitals, Category::Feeding];

    /// Route segment appended to the API path.
    pub fn route(self) -> &'static str {
        match self {
            Category::Vitals => "vitals",
            Category::Feeding => "feedings",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vitals" => Ok(Category::Vitals),
            "feedings" | "feeding" => Ok(Category::Feeding),
            other => Err(format!(
                "unknown category '{other}' (expected 'vitals' or 'feedings')"
            )),
        }
    }
}

/// Raw input from a sensor or manual entry, before it is sequenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub category: Category,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

/// A sequenced event. Immutable once the buffer has created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub category: Category,
    pub sequence_id: u64,
    pub captured_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A contiguous run of same-category events uploaded together.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    category: Category,
    batch_id: String,
    events: Vec<Event>,
}

impl Batch {
    /// Build a batch from events already known to be contiguous and of
    /// `category`. Returns `None` for an empty slice.
    pub fn new(device_id: &str, category: Category, events: Vec<Event>) -> Option<Self> {
        let first = events.first()?.sequence_id;
        let last = events.last()?.sequence_id;
        Some(Self {
            category,
            batch_id: format!("{device_id}-{}-{first}-{last}", category.route()),
            events,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_sequence_id(&self) -> u64 {
        self.events.first().map(|e| e.sequence_id).unwrap_or(0)
    }

    pub fn last_sequence_id(&self) -> u64 {
        self.events.last().map(|e| e.sequence_id).unwrap_or(0)
    }
}
