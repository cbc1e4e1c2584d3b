//! Instance records.

use crate::definition::{FINAL, INITIAL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The durable representation of one machine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Caller-chosen identity, unique per store.
    pub id: String,

    /// Name of the current state.
    pub state: String,

    /// Composite accumulators by field name.
    #[serde(default)]
    pub accumulators: BTreeMap<String, u32>,

    /// Caller-defined payload mutated by behaviors.
    #[serde(default)]
    pub ctx: Value,

    /// Number of events applied so far.
    #[serde(default)]
    pub events_applied: u64,

    /// Commit counter, bumped by every successful commit.
    #[serde(default)]
    pub version: u64,

    /// Creation timestamp (Unix millis).
    pub created_at: i64,

    /// Last update timestamp (Unix millis).
    pub updated_at: i64,
}

impl InstanceRecord {
    /// Creates a fresh record in `Initial` with an empty payload.
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            state: INITIAL.to_string(),
            accumulators: BTreeMap::new(),
            ctx: Value::Object(Default::default()),
            events_applied: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a fresh record with an initial payload.
    pub fn with_ctx(id: impl Into<String>, ctx: Value) -> Self {
        Self {
            ctx,
            ..Self::new(id)
        }
    }

    /// Returns the value of an accumulator field, zero when never set.
    pub fn accumulator(&self, field: &str) -> u32 {
        self.accumulators.get(field).copied().unwrap_or(0)
    }

    /// Reads a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.ctx.get(name)
    }

    pub fn is_initial(&self) -> bool {
        self.state == INITIAL
    }

    pub fn is_final(&self) -> bool {
        self.state == FINAL
    }

    /// Returns true until the first event has been applied.
    pub fn is_fresh(&self) -> bool {
        self.events_applied == 0
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
