use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{ClusterConfig, WorkerIdentity};
use crate::protocol::events::*;
use crate::protocol::types::{now_ms, CodeBundle, Node, NodeRole, NodeStatus, TaskId};
use crate::runtime::{
    CheckpointConfig, ExecutionRuntime, RuntimeEvent, TaskFn, TaskLibrary,
};

use super::stats::sample_system;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// Verifies the bundle and resolves its executable. Pure so the refusal
/// paths are unit-testable.
pub fn prepare_execution(bundle: &CodeBundle, library: &TaskLibrary) -> Result<TaskFn, String> {
    if !bundle.verify() {
        return Err(format!(
            "bundle {} failed checksum verification",
            bundle.id
        ));
    }
    library.resolve(&bundle.name).ok_or_else(|| {
        format!(
            "no executable task named '{}' in the library; dynamic code is not evaluated",
            bundle.name
        )
    })
}

/// Derives the control-channel URL from the coordinator's HTTP address.
pub fn control_channel_url(coordinator_url: &str) -> String {
    format!("{}/ws", coordinator_url.replacen("http", "ws", 1))
}

struct ActiveTask {
    task_id: TaskId,
    runtime: Arc<ExecutionRuntime>,
}

pub struct WorkerService {
    identity: WorkerIdentity,
    config: ClusterConfig,
    library: Arc<TaskLibrary>,
}

impl WorkerService {
    pub fn new(identity: WorkerIdentity, config: ClusterConfig, library: Arc<TaskLibrary>) -> Self {
        Self {
            identity,
            config,
            library,
        }
    }

    /// Runs sessions forever, reconnecting with backoff after any drop.
    pub async fn run_forever(&self) {
        let mut delay_ms = 500u64;
        loop {
            match self.run_session().await {
                Ok(()) => {
                    tracing::warn!("Connection to coordinator closed, reconnecting");
                    delay_ms = 500;
                }
                Err(e) => {
                    tracing::warn!("Session failed: {}", e);
                }
            }
            let jitter = rand::random::<u64>() % 250;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(10_000);
        }
    }

    /// One connection lifetime: probe, connect, register, event loop.
    pub async fn run_session(&self) -> anyhow::Result<()> {
        self.probe_coordinator().await?;

        let url = control_channel_url(&self.identity.coordinator_url);
        tracing::info!("Connecting to {}", url);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let node = Node {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            role: NodeRole::Worker,
            status: NodeStatus::Online,
            address: self.identity.coordinator_url.clone(),
            joined_at: now_ms(),
            last_ping: now_ms(),
        };
        send_frame(&mut sink, NODE_REGISTER, &RegisterPayload { node }).await?;

        let (runtime_tx, mut runtime_rx) = mpsc::unbounded_channel::<RuntimeEvent>();
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        let mut active: Option<ActiveTask> = None;

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => {
                                    self.handle_frame(envelope, &mut active, &runtime_tx, &mut sink)
                                        .await?;
                                }
                                Err(e) => {
                                    tracing::warn!("Dropping unparsable frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = HeartbeatPayload { node_id: self.identity.id.clone() };
                    send_frame(&mut sink, NODE_HEARTBEAT, &beat).await?;

                    let (cpu_usage, memory_usage) = sample_system();
                    let stats = NodeStatsPayload {
                        node_id: self.identity.id.clone(),
                        cpu_usage,
                        memory_usage,
                    };
                    send_frame(&mut sink, NODE_STATS, &stats).await?;
                }
                Some(event) = runtime_rx.recv() => {
                    self.forward_runtime_event(event, &mut active, &mut sink).await?;
                }
            }
        }
    }

    /// Waits for the coordinator's `/health` endpoint before dialing the
    /// control channel.
    async fn probe_coordinator(&self) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/health", self.identity.coordinator_url);
        let mut delay_ms = 150u64;

        for attempt in 0..10 {
            let response = client
                .get(url.as_str())
                .timeout(Duration::from_millis(500))
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    tracing::debug!("Health probe returned {}", resp.status());
                }
                Err(e) => {
                    tracing::debug!("Health probe attempt {} failed: {}", attempt, e);
                }
            }
            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(1_200);
        }

        Err(anyhow::anyhow!("coordinator unreachable at {}", url))
    }

    async fn handle_frame(
        &self,
        envelope: Envelope,
        active: &mut Option<ActiveTask>,
        runtime_tx: &mpsc::UnboundedSender<RuntimeEvent>,
        sink: &mut WsSink,
    ) -> anyhow::Result<()> {
        match envelope.event.as_str() {
            NODE_REGISTERED => {
                if let Ok(payload) = envelope.parse::<RegisteredPayload>() {
                    tracing::info!("Registered with coordinator as {}", payload.node_id.0);
                }
            }
            TASK_ASSIGN => {
                if let Ok(payload) = envelope.parse::<AssignPayload>() {
                    self.handle_assign(payload, active, runtime_tx, sink).await?;
                }
            }
            TASK_PAUSE => {
                if let Ok(payload) = envelope.parse::<PausePayload>() {
                    self.handle_pause(payload, active);
                }
            }
            CHECKPOINT_SAVE => {
                if let Ok(payload) = envelope.parse::<CheckpointSavePayload>() {
                    if let Some(task) = active.as_ref().filter(|t| t.task_id == payload.task_id) {
                        if let Some(checkpoint) = task.runtime.latest_checkpoint() {
                            send_frame(
                                sink,
                                CHECKPOINT_SAVED,
                                &CheckpointSavedPayload { checkpoint },
                            )
                            .await?;
                        }
                    }
                }
            }
            // Broadcast traffic (node lists, system updates, observer
            // streams) needs no worker-side action.
            _ => {}
        }
        Ok(())
    }

    async fn handle_assign(
        &self,
        payload: AssignPayload,
        active: &mut Option<ActiveTask>,
        runtime_tx: &mpsc::UnboundedSender<RuntimeEvent>,
        sink: &mut WsSink,
    ) -> anyhow::Result<()> {
        let task = payload.task;

        if let Some(running) = active.as_ref() {
            tracing::error!(
                "Refusing assignment of task {}: already executing {}",
                task.id.0,
                running.task_id.0
            );
            let error = TaskErrorPayload {
                task_id: Some(task.id.clone()),
                error: format!("worker busy with task {}", running.task_id.0),
            };
            send_frame(sink, TASK_ERROR, &error).await?;
            return Ok(());
        }

        let entry = match prepare_execution(&payload.code_bundle, &self.library) {
            Ok(entry) => entry,
            Err(reason) => {
                tracing::error!("Rejecting assignment of task {}: {}", task.id.0, reason);
                let error = TaskErrorPayload {
                    task_id: Some(task.id.clone()),
                    error: reason,
                };
                send_frame(sink, TASK_ERROR, &error).await?;
                return Ok(());
            }
        };

        let checkpoint_config = CheckpointConfig::for_migration(
            task.migration_type,
            self.config.checkpoint_interval_steps,
        );
        let runtime = ExecutionRuntime::new(
            task.id.clone(),
            self.identity.id.clone(),
            checkpoint_config,
            runtime_tx.clone(),
        );

        match &payload.checkpoint {
            Some(checkpoint) => tracing::info!(
                "Accepted task {} ({}), resuming after step {}",
                task.id.0,
                task.name,
                checkpoint.current_step
            ),
            None => tracing::info!("Accepted task {} ({})", task.id.0, task.name),
        }

        *active = Some(ActiveTask {
            task_id: task.id.clone(),
            runtime: runtime.clone(),
        });

        let params = task.params.clone();
        let checkpoint = payload.checkpoint;
        tokio::spawn(async move {
            // Terminal states travel through the runtime's event stream.
            let _ = runtime.execute(entry, params, checkpoint).await;
        });

        Ok(())
    }

    fn handle_pause(&self, payload: PausePayload, active: &mut Option<ActiveTask>) {
        let Some(task) = active.as_ref().filter(|t| t.task_id == payload.task_id) else {
            tracing::warn!("Pause for task {} not running here", payload.task_id.0);
            return;
        };

        tracing::info!(
            "Pausing task {} (snapshot required: {})",
            payload.task_id.0,
            payload.require_snapshot
        );
        let latest = task.runtime.pause();
        if payload.require_snapshot && latest.is_none() {
            tracing::warn!(
                "Task {} has no checkpoint yet; snapshot depends on its next pause check",
                payload.task_id.0
            );
        }
    }

    async fn forward_runtime_event(
        &self,
        event: RuntimeEvent,
        active: &mut Option<ActiveTask>,
        sink: &mut WsSink,
    ) -> anyhow::Result<()> {
        match event {
            RuntimeEvent::Started { task_id } => {
                let payload = StartPayload {
                    task_id,
                    node_id: self.identity.id.clone(),
                };
                send_frame(sink, TASK_START, &payload).await?;
            }
            RuntimeEvent::Progress(payload) => {
                send_frame(sink, TASK_PROGRESS, &payload).await?;
            }
            RuntimeEvent::Checkpoint(checkpoint) => {
                send_frame(sink, CHECKPOINT_SAVED, &CheckpointSavedPayload { checkpoint })
                    .await?;
            }
            RuntimeEvent::Paused { task_id, at } => {
                tracing::info!("Task {} parked at step {}", task_id.0, at);
                if active.as_ref().map(|t| &t.task_id) == Some(&task_id) {
                    *active = None;
                }
                let status = StatusUpdatePayload {
                    node_id: self.identity.id.clone(),
                    status: NodeStatus::Migrating,
                };
                send_frame(sink, NODE_STATUS_UPDATE, &status).await?;
            }
            RuntimeEvent::Completed { task_id, result } => {
                if active.as_ref().map(|t| &t.task_id) == Some(&task_id) {
                    *active = None;
                }
                let payload = CompletePayload { task_id, result };
                send_frame(sink, TASK_COMPLETE, &payload).await?;
            }
            RuntimeEvent::Failed { task_id, error } => {
                if active.as_ref().map(|t| &t.task_id) == Some(&task_id) {
                    *active = None;
                }
                let payload = TaskErrorPayload {
                    task_id: Some(task_id),
                    error,
                };
                send_frame(sink, TASK_ERROR, &payload).await?;
            }
        }
        Ok(())
    }
}

async fn send_frame<T: Serialize>(
    sink: &mut WsSink,
    event: &str,
    payload: &T,
) -> anyhow::Result<()> {
    let envelope = Envelope::new(event, payload)?;
    let text = serde_json::to_string(&envelope)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
