//! End-to-end cluster test: a coordinator service and two instance workers
//! talking over an in-process channel transport.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use edge_transports::mesh::{
    protocol::{EdgeMessage, SetActiveEdges},
    service::CoordinatorEvent,
    BeltTransfer, ChannelTransport, ConfigFieldChange, ConnectionEvent, ConsoleCommand,
    CoordinatorConfig, CoordinatorHandle, CoordinatorService, EdgeConfig, EdgeCoordinator,
    EdgeError, EdgeKey, EdgeResult, EdgeTransportConfig, EdgeWorker, Endpoint, Envelope, HostId,
    InstanceId, InstanceRecord, InstanceStatus, InternalConfig, SimulationConsole,
};
use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

const A: InstanceId = InstanceId(1);
const B: InstanceId = InstanceId(2);
const HOST_A: HostId = HostId(10);
const HOST_B: HostId = HostId(20);

#[derive(Default)]
struct TestConsole {
    commands: Mutex<Vec<ConsoleCommand>>,
}

impl TestConsole {
    fn commands(&self) -> Vec<ConsoleCommand> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SimulationConsole for TestConsole {
    async fn execute(&self, command: ConsoleCommand) -> EdgeResult<()> {
        command.render()?;
        self.commands.lock().unwrap().push(command);
        Ok(())
    }
}

fn edge(id: u32, target_instance: InstanceId, target_edge: u32) -> EdgeConfig {
    EdgeConfig {
        id,
        target_instance,
        target_edge,
    }
}

struct Cluster {
    handle: CoordinatorHandle,
    shutdown_tx: watch::Sender<bool>,
    service: JoinHandle<EdgeCoordinator>,
    router: JoinHandle<()>,
    workers: HashMap<InstanceId, EdgeWorker>,
    consoles: HashMap<InstanceId, Arc<TestConsole>>,
}

impl Cluster {
    fn worker(&self, id: InstanceId) -> &EdgeWorker {
        &self.workers[&id]
    }

    fn console(&self, id: InstanceId) -> &TestConsole {
        &self.consoles[&id]
    }

    async fn shutdown(self) {
        self.shutdown_tx.send(true).unwrap();
        let coordinator = self.service.await.unwrap();
        assert!(coordinator.is_symmetric());
        self.router.abort();
    }
}

fn sender_of(message: &EdgeMessage) -> Endpoint {
    match message {
        EdgeMessage::AfterInternalUpdate(m) => Endpoint::Instance(m.instance_id),
        EdgeMessage::EnsureEdgesDeactivated(m) => Endpoint::Instance(m.instance_id),
        _ => Endpoint::Controller,
    }
}

/// Deliver every envelope to its endpoint on its own task, so a handler
/// that sends further requests cannot stall the router.
fn spawn_router(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    handle: CoordinatorHandle,
    workers: HashMap<InstanceId, EdgeWorker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let (to, message, responder) = envelope.into_parts();
            let handle = handle.clone();
            let workers = workers.clone();
            tokio::spawn(async move {
                let result = match to {
                    Endpoint::Controller => handle.deliver(sender_of(&message), message).await,
                    Endpoint::Host(_) => match &message {
                        EdgeMessage::SetActiveEdges(SetActiveEdges { instance_id, .. }) => {
                            let instance_id = *instance_id;
                            match workers.get(&instance_id) {
                                Some(worker) => worker.handle_message(message).await,
                                None => Err(EdgeError::UnknownInstance(instance_id)),
                            }
                        }
                        _ => Err(EdgeError::Transport("hosts only relay set_active_edges".into())),
                    },
                    Endpoint::Instance(id) => match workers.get(&id) {
                        Some(worker) => worker.handle_message(message).await,
                        None => Err(EdgeError::UnknownInstance(id)),
                    },
                };
                responder.respond(result);
            });
        }
    })
}

async fn start_cluster() -> Cluster {
    let (transport, rx) = ChannelTransport::channel();
    let transport = Arc::new(transport);

    let coordinator = EdgeCoordinator::open(vec![
        InstanceRecord::new(A.0, InstanceStatus::Running)
            .with_host(HOST_A.0)
            .with_edges(vec![edge(1, B, 1)]),
        InstanceRecord::new(B.0, InstanceStatus::Running)
            .with_host(HOST_B.0)
            .with_edges(vec![edge(1, A, 1)]),
    ]);
    let (service, handle, events) =
        CoordinatorService::new(coordinator, transport.clone(), CoordinatorConfig::default())
            .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = tokio::spawn(service.run(events, shutdown_rx));

    let mut workers = HashMap::new();
    let mut consoles = HashMap::new();
    for (id, target) in [(A, B), (B, A)] {
        let console = Arc::new(TestConsole::default());
        let worker = EdgeWorker::new(
            id,
            EdgeTransportConfig::with_edges(vec![edge(1, target, 1)]),
            transport.clone(),
            console.clone(),
        )
        .unwrap();
        workers.insert(id, worker);
        consoles.insert(id, console);
    }
    let router = spawn_router(rx, handle.clone(), workers.clone());

    for worker in workers.values() {
        worker.set_status(InstanceStatus::Running);
        worker
            .controller_connection_event(ConnectionEvent::Connect)
            .await;
        worker.start().await.unwrap();
    }
    handle
        .send(CoordinatorEvent::HostConnected(HOST_A))
        .await
        .unwrap();
    handle
        .send(CoordinatorEvent::HostConnected(HOST_B))
        .await
        .unwrap();

    Cluster {
        handle,
        shutdown_tx,
        service,
        router,
        workers,
        consoles,
    }
}

async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_link_activates_and_carries_transfers() {
    let cluster = start_cluster().await;

    eventually("both edges active", || {
        cluster.worker(A).registry().active_ids() == vec![1]
            && cluster.worker(B).registry().active_ids() == vec![1]
    })
    .await;
    assert!(cluster
        .console(A)
        .commands()
        .contains(&ConsoleCommand::SetActiveEdges(vec![1])));

    cluster.worker(A).transfer_from_simulation(
        1,
        vec![
            BeltTransfer::items(3, vec![json!({"name": "iron-plate", "count": 8})]),
            BeltTransfer::flow(3, true),
        ],
    );

    eventually("transfer pushed into B", || {
        cluster.console(B).commands().iter().any(|command| {
            matches!(
                command,
                ConsoleCommand::Transfer { edge_id: 1, belt_transfers }
                    if belt_transfers.len() == 1 && belt_transfers[0].set_flow == Some(true)
            )
        })
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_host_disconnect_deactivates_partner() {
    let cluster = start_cluster().await;
    eventually("both edges active", || {
        cluster.worker(B).registry().active_ids() == vec![1]
    })
    .await;

    cluster
        .handle
        .send(CoordinatorEvent::host_connection(HOST_A, ConnectionEvent::Drop))
        .await
        .unwrap();
    cluster
        .worker(A)
        .controller_connection_event(ConnectionEvent::Drop)
        .await;

    eventually("B deactivated", || {
        cluster.worker(B).registry().active_ids().is_empty()
    })
    .await;
    assert!(cluster.worker(A).registry().active_ids().is_empty());
    assert!(cluster.handle.snapshot().await.unwrap().active_edges.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_reconfiguration_waits_for_handshake() {
    let cluster = start_cluster().await;
    eventually("both edges active", || {
        cluster.worker(A).registry().active_ids() == vec![1]
    })
    .await;

    // The config layer tells the coordinator first, then the worker applies it
    let edges = vec![edge(1, B, 1), edge(2, B, 2)];
    cluster
        .handle
        .send(CoordinatorEvent::InstanceEdgesChanged {
            instance_id: A,
            edges: edges.clone(),
        })
        .await
        .unwrap();
    let snapshot = cluster.handle.snapshot().await.unwrap();
    assert!(snapshot.active_edges.is_empty());
    assert!(snapshot.internal_updated.contains(&A));

    cluster
        .worker(A)
        .config_field_changed(ConfigFieldChange::Internal(InternalConfig { edges }))
        .await
        .unwrap();
    assert_eq!(cluster.worker(A).registry().ids(), vec![1, 2]);

    let mut active = Vec::new();
    for _ in 0..300 {
        active = cluster
            .handle
            .snapshot()
            .await
            .unwrap()
            .active_edges
            .into_iter()
            .collect::<Vec<_>>();
        if !active.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(active, vec![EdgeKey::new(A, 1), EdgeKey::new(B, 1)]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stop_confirms_with_coordinator() {
    let cluster = start_cluster().await;
    eventually("both edges active", || {
        cluster.worker(A).registry().active_ids() == vec![1]
    })
    .await;

    cluster
        .handle
        .send(CoordinatorEvent::InstanceStatusChanged {
            instance_id: A,
            status: InstanceStatus::Stopping,
        })
        .await
        .unwrap();
    cluster.worker(A).set_status(InstanceStatus::Stopping);
    cluster.worker(A).stop().await.unwrap();

    assert_eq!(
        cluster.console(A).commands().last(),
        Some(&ConsoleCommand::SetActiveEdges(vec![]))
    );
    eventually("B deactivated", || {
        cluster.worker(B).registry().active_ids().is_empty()
    })
    .await;

    cluster.shutdown().await;
}
