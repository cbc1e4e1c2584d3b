//! Event application engine.
//!
//! Applying an event to a record:
//! 1. Run the state chain for (current state, event), then the any-state
//!    chain for the event. Having neither is not an error.
//! 2. Record the occurrence with the composite tracker, against the state
//!    reached in step 1, even if no chain ran.
//! 3. Run the chains of every composite the occurrence completed, in
//!    declaration order.
//!
//! All of this happens on a working copy; the record is only replaced when
//! every action succeeded.

use crate::behavior::{run_chain, BehaviorContext};
use crate::composite::CompositeEventTracker;
use crate::definition::{EventKind, MachineDefinition, State};
use crate::error::CoreError;
use crate::instance::InstanceRecord;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResult {
    pub from_state: String,
    pub to_state: String,
    /// Whether a chain ran for the raised event itself.
    pub handled: bool,
    /// Composites fired by this event, in firing order.
    pub fired_composites: Vec<String>,
    pub accumulators: BTreeMap<String, u32>,
}

impl ApplyResult {
    pub fn transitioned(&self) -> bool {
        self.from_state != self.to_state
    }
}

/// Applies events to instance records. Holds no per-instance state.
#[derive(Debug, Clone)]
pub struct EventEngine {
    definition: Arc<MachineDefinition>,
}

impl EventEngine {
    pub fn new(definition: Arc<MachineDefinition>) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &Arc<MachineDefinition> {
        &self.definition
    }

    /// Applies `event` to `record`.
    ///
    /// Unknown events and directly raised composites fail without touching
    /// the record. An event with no chain in the current state is accepted
    /// and only updates composite accumulators.
    pub fn apply(
        &self,
        record: &mut InstanceRecord,
        event: &str,
        data: &Value,
    ) -> Result<ApplyResult, CoreError> {
        let definition = &*self.definition;

        match definition.event_kind(event) {
            None => {
                return Err(CoreError::UnknownEvent {
                    event: event.to_string(),
                })
            }
            Some(EventKind::Composite) => {
                return Err(CoreError::CompositeRaised {
                    event: event.to_string(),
                })
            }
            Some(EventKind::Simple) => {}
        }

        if !definition.has_state(&record.state) {
            return Err(CoreError::UnknownState {
                state: record.state.clone(),
            });
        }

        let mut working = record.clone();
        let from_state = working.state.clone();

        let handled = self.dispatch(&mut working, event, data)?;

        let tracker = CompositeEventTracker::new(definition);
        let first_event = working.is_fresh();
        let completed = tracker.record(event, &mut working.accumulators, first_event);

        let mut fired_composites = Vec::with_capacity(completed.len());
        for composite in completed {
            tracing::debug!(
                instance = %working.id,
                composite = %composite.name,
                trigger = event,
                "composite event fired"
            );
            self.dispatch(&mut working, &composite.name, &Value::Null)?;
            fired_composites.push(composite.name.clone());
        }

        working.events_applied += 1;
        working.touch();

        let result = ApplyResult {
            from_state,
            to_state: working.state.clone(),
            handled,
            fired_composites,
            accumulators: working.accumulators.clone(),
        };
        *record = working;

        Ok(result)
    }

    /// Runs the chains for `event` in the record's current state. Returns
    /// whether any chain was registered.
    fn dispatch(
        &self,
        record: &mut InstanceRecord,
        event: &str,
        data: &Value,
    ) -> Result<bool, CoreError> {
        let state = record.state.clone();
        let chains = [
            self.definition.handler(&state, event),
            self.definition.any_handler(event),
        ];

        if chains.iter().all(Option::is_none) {
            tracing::debug!(
                instance = %record.id,
                state = %state,
                event,
                "no handler, event ignored"
            );
            return Ok(false);
        }

        let mut next: Option<State> = None;
        for chain in chains.into_iter().flatten() {
            let mut cx = BehaviorContext {
                instance_id: &record.id,
                state: &state,
                event,
                data,
                ctx: &mut record.ctx,
            };
            let target = run_chain(chain, &mut cx).map_err(|reason| CoreError::ActionFailed {
                state: state.clone(),
                event: event.to_string(),
                reason,
            })?;
            if target.is_some() {
                next = target;
            }
        }

        if let Some(next) = next {
            tracing::debug!(
                instance = %record.id,
                event,
                from = %state,
                to = %next,
                "transition"
            );
            record.state = next.0;
        }

        Ok(true)
    }
}
