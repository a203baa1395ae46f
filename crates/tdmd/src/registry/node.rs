//! Per-node state machine.
//!
//! A `Node` is the registry-side record of one discovered robot: its
//! identity, device status, the cooperative write lock, and the cached
//! watchable state (variables, event table, execution state). It is the
//! only place where client values are coerced to VM words and where lock
//! preconditions are decided.

use tdm_core::{
    EventMap, NodeId, NodeStatus, NodeView, ValueError, VariableMap, VmDescription,
    VmExecutionState,
};

use crate::backend::NodeDescriptor;

use super::commands::{EndpointId, NodeSnapshot, RegistryError};

pub struct Node {
    id: NodeId,
    pub name: String,
    node_type: tdm_core::NodeType,
    pub renamable: bool,
    /// Status as reported by the backend; the lock overlays `Busy` on
    /// top of it (see [`Node::public_status`]).
    pub device_status: NodeStatus,
    lock_holder: Option<EndpointId>,
    pub variables: VariableMap,
    pub events_table: Vec<tdm_core::EventDescription>,
    pub execution_state: VmExecutionState,
    vm_description: VmDescription,
}

impl Node {
    pub fn new(id: NodeId, descriptor: NodeDescriptor, status: NodeStatus) -> Self {
        Self {
            id,
            name: descriptor.name,
            node_type: descriptor.node_type,
            renamable: descriptor.renamable,
            device_status: status,
            lock_holder: None,
            variables: VariableMap::new(),
            events_table: Vec::new(),
            execution_state: VmExecutionState::default(),
            vm_description: descriptor.vm_description,
        }
    }

    /// Status visible to endpoints: a locked node reports `Busy`.
    ///
    /// The endpoint holding the lock remaps `Busy` to `Ready` on its own
    /// side; the registry never tracks per-endpoint views.
    pub fn public_status(&self) -> NodeStatus {
        if self.device_status.is_terminal() {
            return self.device_status;
        }
        if self.lock_holder.is_some() {
            return NodeStatus::Busy;
        }
        self.device_status
    }

    /// Snapshot handed to observers.
    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id,
            name: self.name.clone(),
            node_type: self.node_type,
            status: self.public_status(),
            renamable: self.renamable,
        }
    }

    /// Snapshot of the watchable state, for new watch subscriptions.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            variables: self.variables.clone(),
            events_table: self.events_table.clone(),
            execution_state: self.execution_state,
        }
    }

    pub fn vm_description(&self) -> VmDescription {
        self.vm_description.clone()
    }

    /// Takes the lock for `endpoint`.
    ///
    /// Returns `Ok(true)` when the node was newly locked, `Ok(false)`
    /// when the endpoint already held it (idempotent).
    pub fn lock(&mut self, endpoint: EndpointId) -> Result<bool, RegistryError> {
        match self.lock_holder {
            None => {
                self.lock_holder = Some(endpoint);
                Ok(true)
            }
            Some(holder) if holder == endpoint => Ok(false),
            Some(_) => Err(RegistryError::NodeBusy(self.id)),
        }
    }

    /// Releases the lock held by `endpoint`.
    pub fn unlock(&mut self, endpoint: EndpointId) -> Result<(), RegistryError> {
        if self.lock_holder == Some(endpoint) {
            self.lock_holder = None;
            Ok(())
        } else {
            Err(RegistryError::NotLocked(self.id))
        }
    }

    pub fn is_locked_by(&self, endpoint: EndpointId) -> bool {
        self.lock_holder == Some(endpoint)
    }

    pub fn lock_holder(&self) -> Option<EndpointId> {
        self.lock_holder
    }

    /// Releases the lock if `endpoint` holds it. Used on endpoint
    /// teardown; returns whether anything changed.
    pub fn release_if_held_by(&mut self, endpoint: EndpointId) -> bool {
        if self.lock_holder == Some(endpoint) {
            self.lock_holder = None;
            true
        } else {
            false
        }
    }

    /// Coerces a client variable map to VM word writes.
    pub fn coerce_variables(
        variables: &VariableMap,
    ) -> Result<Vec<(String, Vec<i16>)>, ValueError> {
        let mut writes = Vec::with_capacity(variables.len());
        for (name, variable) in variables {
            writes.push((name.clone(), variable.value.to_vm_words()?));
        }
        Ok(writes)
    }

    /// Coerces an emitted event map against the registered event table.
    ///
    /// Every event must be registered and, for events with a fixed
    /// payload size, carry exactly that many words.
    pub fn coerce_events(&self, events: &EventMap) -> Result<Vec<(String, Vec<i16>)>, ValueError> {
        let mut writes = Vec::with_capacity(events.len());
        for (name, value) in events {
            let description = self
                .events_table
                .iter()
                .find(|e| &e.name == name)
                .ok_or_else(|| ValueError::UnknownEvent(name.clone()))?;
            let words = value.to_vm_words()?;
            if description.fixed_size > 0 && words.len() as u32 != description.fixed_size {
                return Err(ValueError::EventSizeMismatch {
                    name: name.clone(),
                    expected: description.fixed_size,
                    got: words.len() as u32,
                });
            }
            writes.push((name.clone(), words));
        }
        Ok(writes)
    }
}
