//! # durafsm-core
//!
//! State machine core for durafsm.
//!
//! This crate provides:
//! - Machine definitions: states, simple and composite events, behavior chains
//! - Composite event tracking over per-instance accumulator bits
//! - Event application against instance records
//! - The instance record type persisted by storage backends

pub mod behavior;
pub mod composite;
pub mod definition;
pub mod engine;
pub mod error;
pub mod instance;

pub use behavior::{Action, BehaviorContext, When};
pub use composite::CompositeEventTracker;
pub use definition::{
    CompositeEvent, CompositeOptions, EventKind, MachineDefinition, MachineDefinitionBuilder,
    State, FINAL, INITIAL,
};
pub use engine::{ApplyResult, EventEngine};
pub use error::CoreError;
pub use instance::InstanceRecord;
