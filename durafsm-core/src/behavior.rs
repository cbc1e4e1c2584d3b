//! Behavior chains.
//!
//! A behavior chain is the ordered list of actions run when an event is
//! accepted in a state. Chains are assembled with [`When`]:
//!
//! ```
//! use durafsm_core::When;
//!
//! let chain = When::event("ExitFrontDoor")
//!     .log("Leaving!")
//!     .assign("left", true)
//!     .transition_to("OnTheWayToTheStore");
//! assert_eq!(chain.event_name(), "ExitFrontDoor");
//! ```

use crate::definition::State;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Caller-supplied action body.
pub type CustomAction =
    Arc<dyn Fn(&mut BehaviorContext<'_>) -> Result<(), String> + Send + Sync + 'static>;

/// View of the instance handed to actions.
pub struct BehaviorContext<'a> {
    /// Identity of the instance being mutated.
    pub instance_id: &'a str,
    /// State the instance was in when the chain started.
    pub state: &'a str,
    /// Event being handled.
    pub event: &'a str,
    /// Data raised with the event.
    pub data: &'a Value,
    /// Instance payload.
    pub ctx: &'a mut Value,
}

impl BehaviorContext<'_> {
    /// Reads a payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.ctx.get(field)
    }

    /// Sets a payload field, turning a null payload into an empty object first.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Result<(), String> {
        payload_object(self.ctx)?.insert(field.into(), value.into());
        Ok(())
    }
}

fn payload_object(ctx: &mut Value) -> Result<&mut Map<String, Value>, String> {
    if ctx.is_null() {
        *ctx = Value::Object(Map::new());
    }
    ctx.as_object_mut()
        .ok_or_else(|| "instance payload is not an object".to_string())
}

/// One step of a behavior chain.
#[derive(Clone)]
pub enum Action {
    /// Sets a payload field to a fixed value.
    Assign { field: String, value: Value },
    /// Shallow-merges the event data object into the payload.
    MergeData,
    /// Emits a trace line.
    Log { message: String },
    /// Runs a caller-supplied closure.
    Custom(CustomAction),
    /// Moves the instance to the given state once the chain completes.
    TransitionTo(State),
    /// Moves the instance to `Final` once the chain completes.
    Finalize,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Assign { field, value } => f
                .debug_struct("Assign")
                .field("field", field)
                .field("value", value)
                .finish(),
            Action::MergeData => f.write_str("MergeData"),
            Action::Log { message } => f.debug_struct("Log").field("message", message).finish(),
            Action::Custom(_) => f.write_str("Custom(..)"),
            Action::TransitionTo(state) => f.debug_tuple("TransitionTo").field(state).finish(),
            Action::Finalize => f.write_str("Finalize"),
        }
    }
}

/// Declarative form of an action, as written in definition files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    Assign { field: String, value: Value },
    MergeData,
    Log(String),
    TransitionTo(String),
    Finalize,
}

impl From<ActionSpec> for Action {
    fn from(spec: ActionSpec) -> Self {
        match spec {
            ActionSpec::Assign { field, value } => Action::Assign { field, value },
            ActionSpec::MergeData => Action::MergeData,
            ActionSpec::Log(message) => Action::Log { message },
            ActionSpec::TransitionTo(state) => Action::TransitionTo(State(state)),
            ActionSpec::Finalize => Action::Finalize,
        }
    }
}

/// Runs a chain in order and returns the state it transitions to, if any.
/// When several actions name a target, the last one wins.
pub(crate) fn run_chain(
    actions: &[Action],
    cx: &mut BehaviorContext<'_>,
) -> Result<Option<State>, String> {
    let mut next = None;
    for action in actions {
        match action {
            Action::Assign { field, value } => cx.set(field.clone(), value.clone())?,
            Action::MergeData => {
                if let Value::Object(data) = cx.data {
                    let payload = payload_object(cx.ctx)?;
                    for (k, v) in data {
                        payload.insert(k.clone(), v.clone());
                    }
                }
            }
            Action::Log { message } => {
                tracing::info!(
                    instance = cx.instance_id,
                    state = cx.state,
                    event = cx.event,
                    "{}",
                    message
                );
            }
            Action::Custom(body) => body(cx)?,
            Action::TransitionTo(state) => next = Some(state.clone()),
            Action::Finalize => next = Some(State::final_state()),
        }
    }
    Ok(next)
}

/// Builder for the behavior chain attached to one event.
#[derive(Debug, Clone)]
pub struct When {
    event: String,
    actions: Vec<Action>,
}

impl When {
    /// Starts a chain for the named event.
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            event: name.into(),
            actions: Vec::new(),
        }
    }

    /// Appends a caller-supplied action.
    pub fn then<F>(mut self, body: F) -> Self
    where
        F: Fn(&mut BehaviorContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.actions.push(Action::Custom(Arc::new(body)));
        self
    }

    pub fn assign(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.actions.push(Action::Assign {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn merge_data(mut self) -> Self {
        self.actions.push(Action::MergeData);
        self
    }

    pub fn log(mut self, message: impl Into<String>) -> Self {
        self.actions.push(Action::Log {
            message: message.into(),
        });
        self
    }

    pub fn transition_to(mut self, state: impl Into<State>) -> Self {
        self.actions.push(Action::TransitionTo(state.into()));
        self
    }

    pub fn finalize(mut self) -> Self {
        self.actions.push(Action::Finalize);
        self
    }

    /// Appends an already-built action.
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Action>) {
        (self.event, self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(actions: &[Action], ctx: &mut Value, data: &Value) -> Result<Option<State>, String> {
        let mut cx = BehaviorContext {
            instance_id: "i-1",
            state: "Initial",
            event: "GO",
            data,
            ctx,
        };
        run_chain(actions, &mut cx)
    }

    #[test]
    fn test_last_transition_wins() {
        let chain = When::event("GO")
            .transition_to("a")
            .assign("x", 1)
            .transition_to("b");
        let mut ctx = json!({});
        let next = run(chain.actions(), &mut ctx, &Value::Null).unwrap();
        assert_eq!(next, Some(State::from("b")));
        assert_eq!(ctx, json!({"x": 1}));
    }

    #[test]
    fn test_finalize_targets_final() {
        let chain = When::event("GO").transition_to("a").finalize();
        let mut ctx = json!({});
        let next = run(chain.actions(), &mut ctx, &Value::Null).unwrap();
        assert!(next.unwrap().is_final());
    }

    #[test]
    fn test_merge_data() {
        let chain = When::event("GO").merge_data();
        let mut ctx = json!({"a": 1, "b": 2});
        run(chain.actions(), &mut ctx, &json!({"b": 3, "c": 4})).unwrap();
        assert_eq!(ctx, json!({"a": 1, "b": 3, "c": 4}));

        // Non-object data is ignored
        run(chain.actions(), &mut ctx, &json!("text")).unwrap();
        assert_eq!(ctx, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_assign_on_null_payload() {
        let chain = When::event("GO").assign("flag", true);
        let mut ctx = Value::Null;
        run(chain.actions(), &mut ctx, &Value::Null).unwrap();
        assert_eq!(ctx, json!({"flag": true}));
    }

    #[test]
    fn test_assign_on_scalar_payload_fails() {
        let chain = When::event("GO").assign("flag", true);
        let mut ctx = json!(42);
        assert!(run(chain.actions(), &mut ctx, &Value::Null).is_err());
    }

    #[test]
    fn test_custom_action_sees_event() {
        let chain = When::event("GO").then(|cx| {
            let amount = cx.data["amount"].as_i64().unwrap_or(0);
            let total = cx.get("total").and_then(Value::as_i64).unwrap_or(0);
            cx.set("total", total + amount)
        });
        let mut ctx = json!({"total": 5});
        run(chain.actions(), &mut ctx, &json!({"amount": 10})).unwrap();
        assert_eq!(ctx["total"], 15);
    }

    #[test]
    fn test_action_spec_forms() {
        let specs: Vec<ActionSpec> = serde_json::from_value(json!([
            {"log": "hello"},
            {"assign": {"field": "x", "value": [1, 2]}},
            "merge_data",
            {"transition_to": "done"},
            "finalize"
        ]))
        .unwrap();
        let actions: Vec<Action> = specs.into_iter().map(Action::from).collect();
        assert!(matches!(actions[0], Action::Log { .. }));
        assert!(matches!(actions[1], Action::Assign { .. }));
        assert!(matches!(actions[2], Action::MergeData));
        assert!(matches!(&actions[3], Action::TransitionTo(s) if s.as_str() == "done"));
        assert!(matches!(actions[4], Action::Finalize));
    }
}
