//! Integration tests for the registry actor driven through its handle,
//! with the simulated backend attached: lock exclusivity over generated
//! operation traces, lock release on endpoint teardown, and watch-stream
//! monotonicity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use tdm_core::{NodeStatus, Value, Variable, VariableMap};
use tdmd::backend::SimulatedBackend;
use tdmd::compiler::SimulatedCompiler;
use tdmd::registry::{spawn_registry, NodeEvent, RegistryError, RegistryHandle};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn spawn_test_registry() -> (RegistryHandle, SimulatedBackend) {
    let (backend_tx, backend_rx) = mpsc::channel(256);
    let backend = SimulatedBackend::new(backend_tx);
    let registry = spawn_registry(
        Arc::new(backend.clone()),
        Arc::new(SimulatedCompiler),
        backend_rx,
    );
    (registry, backend)
}

/// Waits until the registry reports the node, so tests do not race the
/// backend event ingestion.
async fn wait_for_node(registry: &RegistryHandle, id: tdm_core::NodeId) {
    for _ in 0..100 {
        if registry.list_nodes().await.iter().any(|n| n.id == id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node never appeared in the registry");
}

/// Tiny deterministic generator for operation traces.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[tokio::test]
async fn test_lock_exclusivity_over_generated_trace() {
    let (registry, backend) = spawn_test_registry();
    let node = backend.spawn_node("n", true).await;
    wait_for_node(&registry, node).await;

    // Model: which endpoint currently holds the lock.
    let mut holder: Option<u64> = None;
    let mut lcg = Lcg(0x5eed);

    for _ in 0..200 {
        let endpoint = 1 + lcg.next() % 4;
        match lcg.next() % 3 {
            // lock
            0 => match registry.lock(node, endpoint).await {
                Ok(()) => {
                    assert!(
                        holder.is_none() || holder == Some(endpoint),
                        "lock granted to {endpoint} while {holder:?} held it"
                    );
                    holder = Some(endpoint);
                }
                Err(RegistryError::NodeBusy(_)) => {
                    assert!(
                        holder.is_some() && holder != Some(endpoint),
                        "busy reported but the model says unlocked"
                    );
                }
                Err(e) => panic!("unexpected lock failure: {e}"),
            },
            // unlock
            1 => match registry.unlock(node, endpoint).await {
                Ok(()) => {
                    assert_eq!(holder, Some(endpoint));
                    holder = None;
                }
                Err(_) => assert_ne!(holder, Some(endpoint)),
            },
            // endpoint teardown
            _ => {
                registry.release_endpoint(endpoint).await;
                if holder == Some(endpoint) {
                    holder = None;
                }
            }
        }

        // The registry's public status must agree with the model.
        let expected = if holder.is_some() {
            NodeStatus::Busy
        } else {
            NodeStatus::Available
        };
        let nodes = registry.list_nodes().await;
        assert_eq!(nodes[0].status, expected);
    }
}

#[tokio::test]
async fn test_lock_released_on_endpoint_teardown() {
    let (registry, backend) = spawn_test_registry();
    let node = backend.spawn_node("n", true).await;
    wait_for_node(&registry, node).await;

    registry.lock(node, 1).await.expect("first lock");
    assert!(matches!(
        registry.lock(node, 2).await,
        Err(RegistryError::NodeBusy(_))
    ));

    registry.release_endpoint(1).await;
    registry.lock(node, 2).await.expect("lock after release");
}

#[tokio::test]
async fn test_watch_stream_is_monotonic() {
    let (registry, backend) = spawn_test_registry();
    let node = backend.spawn_node("n", true).await;
    wait_for_node(&registry, node).await;

    let mut events = registry.subscribe();
    registry.lock(node, 1).await.expect("lock");

    // Ten writes, strictly ordered by awaiting each completion.
    for i in 0..10i64 {
        let mut variables = VariableMap::new();
        variables.insert("x".into(), Variable::new(Value::Int(i)));
        registry
            .set_variables(node, 1, variables)
            .await
            .expect("write");
    }

    // The observed sequence must be exactly the written sequence: no
    // reordering, no duplication.
    let mut observed = Vec::new();
    while observed.len() < 10 {
        let event = timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        if let NodeEvent::VariablesChanged { variables, .. } = event {
            if let Some(variable) = variables.get("x") {
                observed.push(variable.value.clone());
            }
        }
    }
    let expected: Vec<Value> = (0..10).map(Value::Int).collect();
    assert_eq!(observed, expected);
}

#[tokio::test]
async fn test_emit_events_validated_against_table() {
    let (registry, backend) = spawn_test_registry();
    let node = backend.spawn_node("n", true).await;
    wait_for_node(&registry, node).await;

    registry.lock(node, 1).await.expect("lock");
    registry
        .register_events(
            node,
            1,
            vec![tdm_core::EventDescription::new("tick", 0)],
        )
        .await
        .expect("register events");

    // Registered event goes through.
    let mut events = tdm_core::EventMap::new();
    events.insert("tick".into(), Value::Int(1));
    registry.emit_events(node, 1, events).await.expect("emit");

    // Unregistered event is an unsupported-type error.
    let mut unknown = tdm_core::EventMap::new();
    unknown.insert("boom".into(), Value::Int(1));
    assert!(matches!(
        registry.emit_events(node, 1, unknown).await,
        Err(RegistryError::UnsupportedValue(_))
    ));
}

#[tokio::test]
async fn test_vm_description_served_from_registry() {
    let (registry, backend) = spawn_test_registry();
    let node = backend.spawn_node("n", true).await;
    wait_for_node(&registry, node).await;

    let description = registry.vm_description(node).await.expect("description");
    assert!(description.bytecode_size > 0);

    assert!(registry
        .vm_description(tdm_core::NodeId::generate())
        .await
        .is_none());
}
