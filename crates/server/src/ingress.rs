use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use concierge_agent::http::RetryPolicy;
use concierge_agent::llm::HistoryMessage;
use concierge_agent::AgentRuntime;
use concierge_core::RoomId;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::{resolve_auth, UserDirectory};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

/// One inbound chat message, already decoded by the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatEvent {
    pub event_id: String,
    pub room_id: RoomId,
    pub sender: String,
    pub body: String,
    pub is_direct_message: bool,
    pub history: Vec<HistoryMessage>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn next_event(&self) -> Result<Option<ChatEvent>, TransportError>;
    async fn send_reply(&self, room_id: &RoomId, text: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_noop(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct NoopChatTransport;

#[async_trait]
impl ChatTransport for NoopChatTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_event(&self) -> Result<Option<ChatEvent>, TransportError> {
        Ok(None)
    }

    async fn send_reply(&self, _room_id: &RoomId, _text: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

#[derive(Clone)]
struct EventWorker {
    transport: Arc<dyn ChatTransport>,
    runtime: Arc<AgentRuntime>,
    directory: Arc<dyn UserDirectory>,
}

impl EventWorker {
    async fn process(self, event: ChatEvent) {
        let auth =
            resolve_auth(self.directory.as_ref(), &event.sender, event.room_id.clone(), event.is_direct_message)
                .await;
        let reply = match self.runtime.handle_message(&event.body, &event.history, &auth).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(
                    event_name = "ingress.chat.turn_rejected",
                    event_id = %event.event_id,
                    room_id = %event.room_id,
                    correlation_id = %error.correlation_id(),
                    error = %error,
                    "message rejected"
                );
                error.user_message().to_owned()
            }
        };

        if let Err(error) = self.transport.send_reply(&event.room_id, &reply).await {
            warn!(
                event_name = "ingress.chat.reply_failed",
                event_id = %event.event_id,
                room_id = %event.room_id,
                error = %error,
                "failed to deliver reply"
            );
        } else {
            debug!(
                event_name = "ingress.chat.reply_sent",
                event_id = %event.event_id,
                room_id = %event.room_id,
                "reply delivered"
            );
        }
    }
}

/// Pulls chat events and answers each one on its own task, with at most
/// `max_concurrent_events` turns in flight.
pub struct IngressRunner {
    worker: EventWorker,
    permits: Arc<Semaphore>,
    reconnect_policy: RetryPolicy,
    shutdown_grace: Duration,
}

impl IngressRunner {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        runtime: Arc<AgentRuntime>,
        directory: Arc<dyn UserDirectory>,
        max_concurrent_events: usize,
    ) -> Self {
        Self {
            worker: EventWorker { transport, runtime, directory },
            permits: Arc::new(Semaphore::new(max_concurrent_events.max(1))),
            reconnect_policy: RetryPolicy { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 },
            shutdown_grace: Duration::from_secs(15),
        }
    }

    pub fn with_reconnect_policy(mut self, reconnect_policy: RetryPolicy) -> Self {
        self.reconnect_policy = reconnect_policy;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn is_noop_transport(&self) -> bool {
        self.worker.transport.is_noop()
    }

    /// Runs until the transport closes, retries are exhausted or `cancel`
    /// fires, then waits for in-flight turns up to the shutdown grace.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut workers = JoinSet::new();

        for attempt in 0..=self.reconnect_policy.max_retries {
            match self.connect_and_pump(attempt, &cancel, &mut workers).await {
                Ok(()) => break,
                Err(transport_error) => {
                    warn!(
                        event_name = "ingress.chat.transport_failed",
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "chat transport failed"
                    );

                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            max_retries = self.reconnect_policy.max_retries,
                            "chat transport retries exhausted; continuing process without crash"
                        );
                        break;
                    }

                    let delay = self.reconnect_policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.drain(workers).await;
        Ok(())
    }

    async fn connect_and_pump(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
        workers: &mut JoinSet<()>,
    ) -> Result<(), TransportError> {
        let transport = &self.worker.transport;
        info!(attempt, "opening chat transport connection");
        transport.connect().await?;
        info!(attempt, "chat transport connected");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(event_name = "ingress.chat.cancelled", "ingress cancelled");
                    transport.disconnect().await?;
                    return Ok(());
                }
                next = transport.next_event() => next?,
            };
            let Some(event) = next else {
                info!(attempt, "chat transport stream closed");
                transport.disconnect().await?;
                return Ok(());
            };

            info!(
                event_name = "ingress.chat.event_received",
                event_id = %event.event_id,
                room_id = %event.room_id,
                correlation_id = %event.event_id,
                direct_message = event.is_direct_message,
                "received chat event"
            );

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return Ok(());
            };
            let worker = self.worker.clone();
            workers.spawn(async move {
                let _permit = permit;
                worker.process(event).await;
            });
            while workers.try_join_next().is_some() {}
        }
    }

    async fn drain(&self, mut workers: JoinSet<()>) {
        if workers.is_empty() {
            return;
        }
        let pending = workers.len();
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                event_name = "ingress.chat.drain_timeout",
                pending,
                grace_secs = self.shutdown_grace.as_secs(),
                "aborting in-flight turns"
            );
            workers.abort_all();
        }
    }
}
