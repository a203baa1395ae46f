//! Client interface for interacting with the registry actor.
//!
//! The `RegistryHandle` is a cheap-to-clone handle endpoints use to send
//! commands and subscribe to node events. All command methods await the
//! actor's (or the device's) completion; endpoints that must not block
//! on a device write run these methods inside a spawned task.

use tokio::sync::{broadcast, mpsc, oneshot};

use tdm_core::{
    CompilationOptions, EventDescription, EventMap, NodeId, NodeView, VariableMap, VmDescription,
    VmExecutionStateCommand, VmLanguage,
};

use super::commands::{
    CompileOutcome, EndpointId, NodeEvent, NodeSnapshot, RegistryCommand, RegistryError,
};

/// Handle for interacting with the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<NodeEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    async fn request<T>(
        &self,
        cmd: RegistryCommand,
        rx: oneshot::Receiver<Result<T, RegistryError>>,
    ) -> Result<T, RegistryError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Snapshot of all known nodes. Empty when the actor is gone.
    pub async fn list_nodes(&self) -> Vec<NodeView> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryCommand::ListNodes { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Watchable-state snapshot of one node.
    pub async fn node_snapshot(&self, node_id: NodeId) -> Option<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::NodeSnapshot {
                node_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// VM description of one node.
    pub async fn vm_description(&self, node_id: NodeId) -> Option<VmDescription> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::VmDescription {
                node_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Takes the write lock on a node. Idempotent for the holder.
    pub async fn lock(&self, node_id: NodeId, endpoint: EndpointId) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Lock {
                node_id,
                endpoint,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Releases the write lock on a node.
    pub async fn unlock(&self, node_id: NodeId, endpoint: EndpointId) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Unlock {
                node_id,
                endpoint,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Renames a locked node; requires the rename capability.
    pub async fn rename(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
        local: bool,
        new_name: String,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Rename {
                node_id,
                endpoint,
                local,
                new_name,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Writes variables on a locked node; completes with the device.
    pub async fn set_variables(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
        variables: VariableMap,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::SetVariables {
                node_id,
                endpoint,
                variables,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Replaces the event table of a locked node.
    pub async fn register_events(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
        events: Vec<EventDescription>,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::RegisterEvents {
                node_id,
                endpoint,
                events,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Emits events on a locked node; completes with the device.
    pub async fn emit_events(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
        events: EventMap,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::EmitEvents {
                node_id,
                endpoint,
                events,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Compiles a program on a locked node, loading it when requested.
    pub async fn compile_and_load(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
        language: VmLanguage,
        program: String,
        options: CompilationOptions,
    ) -> Result<CompileOutcome, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::CompileAndLoad {
                node_id,
                endpoint,
                language,
                program,
                options,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Drives the VM of a locked node (or force-stops one on which the
    /// endpoint holds no rename capability).
    pub async fn set_execution_state(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
        local: bool,
        command: VmExecutionStateCommand,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::SetExecutionState {
                node_id,
                endpoint,
                local,
                command,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Replaces the breakpoints on a locked node; returns the lines the
    /// device actually set.
    pub async fn set_breakpoints(
        &self,
        node_id: NodeId,
        endpoint: EndpointId,
        breakpoints: Vec<u32>,
    ) -> Result<Vec<u32>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryCommand::SetBreakpoints {
                node_id,
                endpoint,
                breakpoints,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Releases every lock held by an endpoint. Called on teardown; a
    /// closed actor means there is nothing left to release.
    pub async fn release_endpoint(&self, endpoint: EndpointId) {
        let _ = self
            .sender
            .send(RegistryCommand::ReleaseEndpoint { endpoint })
            .await;
    }

    /// Subscribes to node change events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_sender.subscribe()
    }
}
