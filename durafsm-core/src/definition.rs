//! State machine definition types.
//!
//! A definition is built once, validated, and shared read-only by every
//! event application. It can be assembled in code with
//! [`MachineDefinitionBuilder`] or parsed from a JSON/YAML document:
//!
//! ```yaml
//! name: super_shopper
//! states: [OnTheWayToTheStore]
//! events: [ExitFrontDoor, GotHitByCar]
//! composites:
//!   - name: EndOfTheWorld
//!     events: [ExitFrontDoor, GotHitByCar]
//!     accumulator: everything
//!     include_initial: true
//! handlers:
//!   - during: Initial
//!     event: ExitFrontDoor
//!     actions: [{log: "Leaving!"}, {transition_to: OnTheWayToTheStore}]
//!   - during: OnTheWayToTheStore
//!     event: GotHitByCar
//!     actions: [{log: "Ouch!!"}, finalize]
//!   - during_any: true
//!     event: EndOfTheWorld
//!     actions: [{assign: {field: screwed, value: true}}]
//! ```
//!
//! `Initial` and `Final` always exist and may not be redeclared.

use crate::behavior::{Action, ActionSpec, When};
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Name of the state every fresh instance starts in.
pub const INITIAL: &str = "Initial";

/// Name of the terminal state.
pub const FINAL: &str = "Final";

/// Maximum constituents one accumulator field can track. Bits 0..=30 are
/// used so the value always fits a signed 32-bit column.
pub const MAX_CONSTITUENTS: usize = 31;

/// Accumulator field used when a composite does not name one.
pub const DEFAULT_ACCUMULATOR: &str = "composite_status";

/// A state in the machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn initial() -> Self {
        Self(INITIAL.to_string())
    }

    pub fn final_state() -> Self {
        Self(FINAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_initial(&self) -> bool {
        self.0 == INITIAL
    }

    pub fn is_final(&self) -> bool {
        self.0 == FINAL
    }
}

impl Borrow<str> for State {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether an event is raised by callers or fired by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Simple,
    Composite,
}

/// Options for a composite event.
#[derive(Debug, Clone, Default)]
pub struct CompositeOptions {
    /// Accumulator field; [`DEFAULT_ACCUMULATOR`] when unset.
    pub accumulator: Option<String>,
    /// Counts entry into `Initial` as an occurrence of the first constituent.
    pub include_initial: bool,
}

impl CompositeOptions {
    pub fn accumulator(mut self, field: impl Into<String>) -> Self {
        self.accumulator = Some(field.into());
        self
    }

    pub fn include_initial(mut self) -> Self {
        self.include_initial = true;
        self
    }
}

/// A validated composite event.
#[derive(Debug, Clone)]
pub struct CompositeEvent {
    pub name: String,
    /// Constituent events in declaration order.
    pub constituents: Vec<String>,
    pub accumulator: String,
    pub include_initial: bool,
    mask: u32,
    initial_bit: u32,
}

impl CompositeEvent {
    /// Bits of every constituent within the accumulator field.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Bit implied by the instance entering `Initial`.
    pub fn initial_bit(&self) -> u32 {
        self.initial_bit
    }

    /// Returns true once every constituent bit is present in `value`.
    pub fn is_satisfied_by(&self, value: u32) -> bool {
        value & self.mask == self.mask
    }
}

/// Bit assigned to an event within one accumulator field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedBit {
    pub accumulator: String,
    pub bit: u32,
}

#[derive(Debug, Clone)]
struct EventInfo {
    kind: EventKind,
    /// Accumulator bits set when this event occurs.
    tracked: Vec<TrackedBit>,
    /// Indices into `composites` that list this event, in declaration order.
    composites: Vec<usize>,
}

/// Raw composite declaration as stored/transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeRaw {
    pub name: String,
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulator: Option<String>,
    #[serde(default)]
    pub include_initial: bool,
}

/// Raw handler declaration as stored/transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRaw {
    /// State(s) the handler applies in. Can be a single state or multiple.
    #[serde(default, deserialize_with = "deserialize_states")]
    pub during: Vec<State>,

    /// Applies in every state.
    #[serde(default)]
    pub during_any: bool,

    pub event: String,

    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

fn deserialize_states<'de, D>(deserializer: D) -> Result<Vec<State>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct StatesVisitor;

    impl<'de> Visitor<'de> for StatesVisitor {
        type Value = Vec<State>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a state name or a list of state names")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![State::from(v)])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut states = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                states.push(State(s));
            }
            Ok(states)
        }
    }

    deserializer.deserialize_any(StatesVisitor)
}

/// Raw machine definition as stored/transmitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineDefinitionRaw {
    #[serde(default)]
    pub name: String,

    /// User states; `Initial` and `Final` are implicit.
    #[serde(default)]
    pub states: Vec<String>,

    /// Simple events.
    #[serde(default)]
    pub events: Vec<String>,

    #[serde(default)]
    pub composites: Vec<CompositeRaw>,

    #[serde(default)]
    pub handlers: Vec<HandlerRaw>,
}

/// Validated and indexed machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    name: String,

    /// All states in declaration order, `Initial` first and `Final` last.
    states: Vec<State>,

    events: HashMap<String, EventInfo>,

    /// Event names in declaration order, simple before composite.
    event_order: Vec<String>,

    composites: Vec<CompositeEvent>,

    /// State-specific chains indexed by state, then event.
    handlers: HashMap<State, HashMap<String, Vec<Action>>>,

    /// Chains that run in every state, indexed by event.
    any_handlers: HashMap<String, Vec<Action>>,
}

impl MachineDefinition {
    pub fn builder(name: impl Into<String>) -> MachineDefinitionBuilder {
        MachineDefinitionBuilder::new(name)
    }

    /// Parses and validates a definition from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: MachineDefinitionRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Parses and validates a definition from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        // Going through JSON keeps the action syntax identical in both formats.
        let json: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_json(&json)
    }

    /// Creates a definition from raw parts.
    pub fn from_raw(raw: MachineDefinitionRaw) -> Result<Self, CoreError> {
        let mut builder = MachineDefinitionBuilder::new(raw.name)
            .states(raw.states)
            .events(raw.events);

        for c in raw.composites {
            let options = CompositeOptions {
                accumulator: c.accumulator,
                include_initial: c.include_initial,
            };
            builder = builder.composite_event(c.name, options, c.events);
        }

        for h in raw.handlers {
            let when = h
                .actions
                .into_iter()
                .fold(When::event(h.event.clone()), |w, a| w.action(a.into()));
            builder = match (h.during_any, h.during.is_empty()) {
                (true, true) => builder.during_any(when),
                (false, false) => builder.during_states(h.during, when),
                (true, false) => {
                    return Err(CoreError::invalid(format!(
                        "handler for '{}' sets both during and during_any",
                        h.event
                    )))
                }
                (false, true) => {
                    return Err(CoreError::invalid(format!(
                        "handler for '{}' needs during or during_any",
                        h.event
                    )))
                }
            };
        }

        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All states in declaration order.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s.as_str() == state)
    }

    /// Event names in declaration order.
    pub fn events(&self) -> &[String] {
        &self.event_order
    }

    pub fn event_kind(&self, event: &str) -> Option<EventKind> {
        self.events.get(event).map(|e| e.kind)
    }

    /// Looks up the chain registered for the given state and event.
    pub fn handler(&self, state: &str, event: &str) -> Option<&[Action]> {
        self.handlers
            .get(state)
            .and_then(|by_event| by_event.get(event))
            .map(Vec::as_slice)
    }

    /// Looks up the chain registered for the event in every state.
    pub fn any_handler(&self, event: &str) -> Option<&[Action]> {
        self.any_handlers.get(event).map(Vec::as_slice)
    }

    /// Returns all events with a handler in the given state.
    pub fn events_from(&self, state: &str) -> Vec<&str> {
        self.event_order
            .iter()
            .filter(|e| self.handler(state, e).is_some() || self.any_handler(e).is_some())
            .map(String::as_str)
            .collect()
    }

    /// All composite events in declaration order.
    pub fn composites(&self) -> &[CompositeEvent] {
        &self.composites
    }

    pub fn composite(&self, name: &str) -> Option<&CompositeEvent> {
        self.composites.iter().find(|c| c.name == name)
    }

    /// Composites listing `event` as a constituent, in declaration order.
    pub fn composites_tracking<'a>(
        &'a self,
        event: &str,
    ) -> impl Iterator<Item = &'a CompositeEvent> + 'a {
        self.events
            .get(event)
            .map(|e| e.composites.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&i| &self.composites[i])
    }

    /// Accumulator bits set when `event` occurs.
    pub fn tracked_bits(&self, event: &str) -> &[TrackedBit] {
        self.events
            .get(event)
            .map(|e| e.tracked.as_slice())
            .unwrap_or(&[])
    }

    /// Names of all accumulator fields used by composites.
    pub fn accumulator_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self
            .composites
            .iter()
            .map(|c| c.accumulator.as_str())
            .collect();
        fields.sort_unstable();
        fields.dedup();
        fields
    }
}

enum Scope {
    States(Vec<State>),
    Any,
}

struct HandlerDecl {
    scope: Scope,
    when: When,
}

struct CompositeDecl {
    name: String,
    constituents: Vec<String>,
    options: CompositeOptions,
}

/// Builder for [`MachineDefinition`]. Nothing is validated until
/// [`build`](MachineDefinitionBuilder::build).
pub struct MachineDefinitionBuilder {
    name: String,
    states: Vec<String>,
    events: Vec<String>,
    composites: Vec<CompositeDecl>,
    handlers: Vec<HandlerDecl>,
}

impl MachineDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            events: Vec::new(),
            composites: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn state(mut self, name: impl Into<String>) -> Self {
        self.states.push(name.into());
        self
    }

    pub fn states<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.events.push(name.into());
        self
    }

    pub fn events<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declares a composite event over the given constituents.
    pub fn composite_event<I, S>(
        mut self,
        name: impl Into<String>,
        options: CompositeOptions,
        constituents: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.composites.push(CompositeDecl {
            name: name.into(),
            constituents: constituents.into_iter().map(Into::into).collect(),
            options,
        });
        self
    }

    /// Registers a chain for the `Initial` state.
    pub fn initially(self, when: When) -> Self {
        self.during(INITIAL, when)
    }

    pub fn during(self, state: impl Into<State>, when: When) -> Self {
        self.during_states([state.into()], when)
    }

    pub fn during_states<I>(mut self, states: I, when: When) -> Self
    where
        I: IntoIterator<Item = State>,
    {
        self.handlers.push(HandlerDecl {
            scope: Scope::States(states.into_iter().collect()),
            when,
        });
        self
    }

    /// Registers a chain that runs in every state, after any state-specific chain.
    pub fn during_any(mut self, when: When) -> Self {
        self.handlers.push(HandlerDecl {
            scope: Scope::Any,
            when,
        });
        self
    }

    /// Validates and indexes the definition.
    pub fn build(self) -> Result<MachineDefinition, CoreError> {
        let states = build_states(&self.states)?;

        let mut events: HashMap<String, EventInfo> = HashMap::new();
        let mut event_order = Vec::new();
        for name in &self.events {
            check_name("event", name)?;
            if states.iter().any(|s| s.as_str() == name) {
                return Err(CoreError::invalid(format!(
                    "event '{}' collides with a state name",
                    name
                )));
            }
            if events.contains_key(name) {
                return Err(CoreError::invalid(format!("duplicate event '{}'", name)));
            }
            events.insert(
                name.clone(),
                EventInfo {
                    kind: EventKind::Simple,
                    tracked: Vec::new(),
                    composites: Vec::new(),
                },
            );
            event_order.push(name.clone());
        }

        let composite_names: HashSet<String> =
            self.composites.iter().map(|c| c.name.clone()).collect();

        // Bits per accumulator field, assigned in first-appearance order.
        let mut bits: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut composites = Vec::with_capacity(self.composites.len());

        for decl in self.composites {
            check_name("composite event", &decl.name)?;
            if states.iter().any(|s| s.as_str() == decl.name) {
                return Err(CoreError::invalid(format!(
                    "composite event '{}' collides with a state name",
                    decl.name
                )));
            }
            if events.contains_key(&decl.name) {
                return Err(CoreError::invalid(format!(
                    "duplicate event '{}'",
                    decl.name
                )));
            }
            if decl.constituents.len() < 2 {
                return Err(CoreError::invalid(format!(
                    "composite event '{}' needs at least two constituents",
                    decl.name
                )));
            }

            let accumulator = decl
                .options
                .accumulator
                .unwrap_or_else(|| DEFAULT_ACCUMULATOR.to_string());
            check_name("accumulator", &accumulator)?;
            let field_bits = bits.entry(accumulator.clone()).or_default();

            let mut mask = 0u32;
            let mut seen = HashSet::new();
            for constituent in &decl.constituents {
                if composite_names.contains(constituent.as_str()) {
                    return Err(CoreError::invalid(format!(
                        "composite event '{}' lists composite event '{}' as a constituent",
                        decl.name, constituent
                    )));
                }
                if !events.contains_key(constituent) {
                    return Err(CoreError::invalid(format!(
                        "composite event '{}' references unknown event '{}'",
                        decl.name, constituent
                    )));
                }
                if !seen.insert(constituent.as_str()) {
                    return Err(CoreError::invalid(format!(
                        "composite event '{}' lists '{}' twice",
                        decl.name, constituent
                    )));
                }

                let bit = match field_bits.iter().position(|e| e == constituent) {
                    Some(pos) => pos,
                    None => {
                        if field_bits.len() == MAX_CONSTITUENTS {
                            return Err(CoreError::invalid(format!(
                                "accumulator '{}' tracks more than {} events",
                                accumulator, MAX_CONSTITUENTS
                            )));
                        }
                        field_bits.push(constituent.clone());
                        field_bits.len() - 1
                    }
                } as u32;
                mask |= 1 << bit;

                if let Some(info) = events.get_mut(constituent) {
                    let tracked = TrackedBit {
                        accumulator: accumulator.clone(),
                        bit,
                    };
                    if !info.tracked.contains(&tracked) {
                        info.tracked.push(tracked);
                    }
                    info.composites.push(composites.len());
                }
            }

            let initial_bit = field_bits
                .iter()
                .position(|e| *e == decl.constituents[0])
                .map(|pos| 1u32 << pos)
                .unwrap_or(0);

            events.insert(
                decl.name.clone(),
                EventInfo {
                    kind: EventKind::Composite,
                    tracked: Vec::new(),
                    composites: Vec::new(),
                },
            );
            event_order.push(decl.name.clone());
            composites.push(CompositeEvent {
                name: decl.name,
                constituents: decl.constituents,
                accumulator,
                include_initial: decl.options.include_initial,
                mask,
                initial_bit,
            });
        }

        let mut handlers: HashMap<State, HashMap<String, Vec<Action>>> = HashMap::new();
        let mut any_handlers: HashMap<String, Vec<Action>> = HashMap::new();

        for decl in self.handlers {
            let (event, actions) = decl.when.into_parts();
            if !events.contains_key(&event) {
                return Err(CoreError::invalid(format!(
                    "handler references unknown event '{}'",
                    event
                )));
            }
            for action in &actions {
                if let Action::TransitionTo(target) = action {
                    if !states.contains(target) {
                        return Err(CoreError::invalid(format!(
                            "transition target '{}' not in states list",
                            target
                        )));
                    }
                }
            }

            match decl.scope {
                Scope::Any => {
                    if any_handlers.contains_key(&event) {
                        return Err(CoreError::invalid(format!(
                            "duplicate during-any handler for event '{}'",
                            event
                        )));
                    }
                    any_handlers.insert(event, actions);
                }
                Scope::States(scope) => {
                    if scope.is_empty() {
                        return Err(CoreError::invalid(format!(
                            "handler for '{}' names no states",
                            event
                        )));
                    }
                    for state in scope {
                        if !states.contains(&state) {
                            return Err(CoreError::invalid(format!(
                                "handler state '{}' not in states list",
                                state
                            )));
                        }
                        let by_event = handlers.entry(state.clone()).or_default();
                        if by_event.contains_key(&event) {
                            return Err(CoreError::invalid(format!(
                                "duplicate handler in state '{}' for event '{}'",
                                state, event
                            )));
                        }
                        by_event.insert(event.clone(), actions.clone());
                    }
                }
            }
        }

        Ok(MachineDefinition {
            name: self.name,
            states,
            events,
            event_order,
            composites,
            handlers,
            any_handlers,
        })
    }
}

fn check_name(kind: &str, name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::invalid(format!("{} name is empty", kind)));
    }
    Ok(())
}

fn build_states(declared: &[String]) -> Result<Vec<State>, CoreError> {
    let mut states = Vec::with_capacity(declared.len() + 2);
    states.push(State::initial());
    for name in declared {
        check_name("state", name)?;
        if name == INITIAL || name == FINAL {
            return Err(CoreError::invalid(format!(
                "state '{}' is reserved and always present",
                name
            )));
        }
        let state = State::from(name.as_str());
        if states.contains(&state) {
            return Err(CoreError::invalid(format!("duplicate state '{}'", name)));
        }
        states.push(state);
    }
    states.push(State::final_state());
    Ok(states)
}
