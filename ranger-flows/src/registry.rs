//! Explicit flow registry (§9 "Dynamic flow/plugin registration -> explicit
//! registry"), populated at process init rather than relying on
//! class-declaration-time registration.

use crate::types::StateFn;
use std::collections::HashMap;
use thiserror::Error;

/// The access-control category a flow is tagged with (§4.9
/// "CheckIfCanStartFlow"). Untagged flows are refused unless the caller's
/// token is a supervisor token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCategory {
    Collection,
    Administrative,
    Hunt,
}

/// Everything the runner needs to drive one flow class: its state table and
/// its access-control category.
pub struct FlowDescriptor {
    pub flow_class_name: String,
    pub category: FlowCategory,
    pub states: HashMap<String, StateFn>,
}

impl FlowDescriptor {
    pub fn new(flow_class_name: impl Into<String>, category: FlowCategory) -> Self {
        Self {
            flow_class_name: flow_class_name.into(),
            category,
            states: HashMap::new(),
        }
    }

    pub fn with_state(mut self, name: impl Into<String>, state_fn: StateFn) -> Self {
        self.states.insert(name.into(), state_fn);
        self
    }

    pub fn state(&self, name: &str) -> Option<StateFn> {
        self.states.get(name).copied()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("flow class already registered: {0}")]
    DuplicateFlowClass(String),
    #[error("unknown flow class: {0}")]
    UnknownFlowClass(String),
    #[error("flow class `{flow_class}` has no state named `{state}`")]
    UnknownState { flow_class: String, state: String },
}

/// Process-scoped, lifecycle-managed registry (§9 "Global mutable caches").
/// Built once at startup; `FlowRegistry::builder()` in tests lets a case
/// construct a scratch registry without touching process-global state.
#[derive(Default)]
pub struct FlowRegistry {
    flows: HashMap<String, FlowDescriptor>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: FlowDescriptor) -> Result<(), RegistryError> {
        if self.flows.contains_key(&descriptor.flow_class_name) {
            return Err(RegistryError::DuplicateFlowClass(descriptor.flow_class_name));
        }
        self.flows.insert(descriptor.flow_class_name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, flow_class_name: &str) -> Result<&FlowDescriptor, RegistryError> {
        self.flows
            .get(flow_class_name)
            .ok_or_else(|| RegistryError::UnknownFlowClass(flow_class_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn state_fn(&self, flow_class_name: &str, state: &str) -> Result<StateFn, RegistryError> {
        let descriptor = self.get(flow_class_name)?;
        descriptor
            .state(state)
            .ok_or_else(|| RegistryError::UnknownState {
                flow_class: flow_class_name.to_string(),
                state: state.to_string(),
            })
    }
}
