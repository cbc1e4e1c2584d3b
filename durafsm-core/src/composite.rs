//! Composite event tracking.
//!
//! Every constituent of a composite owns one bit in an accumulator field on
//! the instance. Recording an occurrence ORs the bit in; a composite fires on
//! the occurrence that first makes its whole mask present. Bits are never
//! cleared, so a composite fires at most once per instance.

use crate::definition::{CompositeEvent, MachineDefinition};
use std::collections::BTreeMap;

/// Decides which composites an event occurrence completes.
#[derive(Debug, Clone, Copy)]
pub struct CompositeEventTracker<'a> {
    definition: &'a MachineDefinition,
}

impl<'a> CompositeEventTracker<'a> {
    pub fn new(definition: &'a MachineDefinition) -> Self {
        Self { definition }
    }

    /// Records an occurrence of `event` in `accumulators` and returns the
    /// composites it completed, in declaration order.
    ///
    /// `first_event` is true when no event has ever been applied to the
    /// instance; composites with `include_initial` then also count their
    /// first constituent as having occurred.
    pub fn record(
        &self,
        event: &str,
        accumulators: &mut BTreeMap<String, u32>,
        first_event: bool,
    ) -> Vec<&'a CompositeEvent> {
        let definition = self.definition;
        let tracked = definition.tracked_bits(event);
        if tracked.is_empty() {
            return Vec::new();
        }

        let before: BTreeMap<&str, u32> = tracked
            .iter()
            .map(|t| {
                let value = accumulators.get(&t.accumulator).copied().unwrap_or(0);
                (t.accumulator.as_str(), value)
            })
            .collect();

        for t in tracked {
            *accumulators.entry(t.accumulator.clone()).or_insert(0) |= 1 << t.bit;
        }

        if first_event {
            for composite in definition.composites_tracking(event) {
                if composite.include_initial {
                    *accumulators
                        .entry(composite.accumulator.clone())
                        .or_insert(0) |= composite.initial_bit();
                }
            }
        }

        definition
            .composites_tracking(event)
            .filter(|composite| {
                let field = composite.accumulator.as_str();
                let was = before.get(field).copied().unwrap_or(0);
                let now = accumulators.get(field).copied().unwrap_or(0);
                composite.is_satisfied_by(now) && !composite.is_satisfied_by(was)
            })
            .collect()
    }
}
