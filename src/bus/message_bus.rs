//! In-process message bus
//!
//! Point-to-point delivery, notification fan-out, broadcast, and correlated
//! request/response on top of subscriber handlers.

use super::circuit_breaker::{CircuitBreakers, CircuitState};
use super::load_balancer::LoadBalancer;
use super::message::{AgentMessage, MessageType};
use crate::config::BusSection;
use crate::error::{AgentError, AgentResult};
use crate::observability::metrics::metrics;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn, Instrument};

/// Receiver side of a subscription
///
/// Handlers that answer requests publish their reply through a clone of the
/// bus, typically built with [`AgentMessage::reply`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: AgentMessage) -> AgentResult<()>;
}

type PendingReply = oneshot::Sender<AgentResult<AgentMessage>>;

/// Outcome of a broadcast, one entry per recipient
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, AgentError)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub pending_requests: usize,
    pub history_len: usize,
    pub history_capacity: usize,
    pub open_circuits: usize,
}

#[derive(Clone)]
pub struct MessageBus {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MessageHandler>>>>,
    pending: Arc<Mutex<HashMap<String, PendingReply>>>,
    history: Arc<Mutex<VecDeque<AgentMessage>>>,
    breakers: CircuitBreakers,
    balancer: LoadBalancer,
    settings: BusSection,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusSection::default())
    }
}

impl MessageBus {
    pub fn new(settings: BusSection) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(VecDeque::with_capacity(settings.history_capacity))),
            breakers: CircuitBreakers::new(settings.failure_threshold, settings.circuit_cooldown()),
            balancer: LoadBalancer::new(),
            settings,
        }
    }

    /// Register `handler` for `agent_id`; returns true if it replaced one
    pub async fn subscribe(&self, agent_id: &str, handler: Arc<dyn MessageHandler>) -> bool {
        let replaced = self
            .handlers
            .write()
            .await
            .insert(agent_id.to_string(), handler)
            .is_some();
        debug!(agent_id = %agent_id, replaced, "Subscribed to bus");
        replaced
    }

    pub async fn unsubscribe(&self, agent_id: &str) -> bool {
        self.handlers.write().await.remove(agent_id).is_some()
    }

    pub async fn subscribers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn handler_for(&self, agent_id: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().await.get(agent_id).cloned()
    }

    fn reject(&self, message: &AgentMessage, violations: Vec<String>) -> AgentError {
        metrics().record_message_rejected();
        warn!(
            message_id = %message.id,
            message_type = %message.message_type,
            violations = ?violations,
            "Rejected invalid message"
        );
        AgentError::communication(format!("Invalid message: {}", violations.join("; ")))
            .retryable(false)
            .with_metadata("message_id", json!(message.id))
            .with_metadata(
                "violations",
                Value::Array(violations.into_iter().map(Value::String).collect()),
            )
    }

    async fn record(&self, message: &AgentMessage) {
        let mut history = self.history.lock().await;
        history.push_back(message.clone());
        while history.len() > self.settings.history_capacity {
            history.pop_front();
        }
        metrics().record_message_published();
    }

    /// Validate, record, and route a message
    ///
    /// Invalid messages and missing recipients are reported as errors; a
    /// failing handler never is.
    pub async fn publish(&self, message: AgentMessage) -> AgentResult<()> {
        let span = crate::bus_span!(
            message_id = %message.id,
            message_type = %message.message_type,
            sender = %message.sender
        );
        self.publish_inner(message).instrument(span).await
    }

    async fn publish_inner(&self, message: AgentMessage) -> AgentResult<()> {
        let violations = message.violations(true);
        if !violations.is_empty() {
            return Err(self.reject(&message, violations));
        }
        self.record(&message).await;

        match message.message_type {
            MessageType::Request => self.dispatch_request(message).await,
            MessageType::Response | MessageType::Error => self.route_reply(message).await,
            MessageType::Notification => self.route_notification(message).await,
            MessageType::Heartbeat => self.deliver_direct(message).await,
        }
    }

    async fn dispatch_request(&self, message: AgentMessage) -> AgentResult<()> {
        let recipient = message.recipient.clone().unwrap_or_default();
        let handler = self.handler_for(&recipient).await.ok_or_else(|| {
            AgentError::communication(format!("No handler registered for '{recipient}'"))
                .with_metadata("message_id", json!(message.id))
        })?;

        let request = message.clone();
        if let Err(e) = handler.handle(message).await {
            warn!(
                message_id = %request.id,
                recipient = %recipient,
                error = %e,
                "Request handler failed, replying with error"
            );
            let reply = request.error_reply(recipient.as_str(), &e.message);
            self.record(&reply).await;
            if let Err(route_error) = self.route_reply(reply).await {
                debug!(error = %route_error, "Error reply had no destination");
            }
        }
        Ok(())
    }

    /// Resolve a pending request, or deliver to the recipient when nobody is
    /// waiting
    async fn route_reply(&self, message: AgentMessage) -> AgentResult<()> {
        let waiter = match message.correlation_id() {
            Some(id) => self.pending.lock().await.remove(id),
            None => None,
        };

        match waiter {
            Some(waiter) => {
                let outcome = if message.message_type == MessageType::Error {
                    Err(reply_error(&message))
                } else {
                    Ok(message)
                };
                // The requester may have given up already
                let _ = waiter.send(outcome);
                Ok(())
            }
            None => self.deliver_direct(message).await,
        }
    }

    async fn route_notification(&self, message: AgentMessage) -> AgentResult<()> {
        if let Some(recipient) = message.recipient.clone() {
            if let Some(handler) = self.handler_for(&recipient).await {
                deliver(handler, &recipient, message).await;
                return Ok(());
            }
        }

        let sender = message.sender.clone();
        let targets: Vec<(String, Arc<dyn MessageHandler>)> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != sender)
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();

        join_all(targets.into_iter().map(|(id, handler)| {
            let copy = message.clone();
            async move { deliver(handler, &id, copy).await }
        }))
        .await;
        Ok(())
    }

    async fn deliver_direct(&self, message: AgentMessage) -> AgentResult<()> {
        let recipient = message.recipient.clone().unwrap_or_default();
        let handler = self.handler_for(&recipient).await.ok_or_else(|| {
            AgentError::communication(format!("No handler registered for '{recipient}'"))
                .with_metadata("message_id", json!(message.id))
        })?;
        deliver(handler, &recipient, message).await;
        Ok(())
    }

    /// Publish a request and wait for its correlated reply
    ///
    /// Exactly one of {response, error reply, timeout} resolves the call. The
    /// timeout comes from `timeout`, then the message metadata, then the bus
    /// default.
    pub async fn request(
        &self,
        message: AgentMessage,
        timeout: Option<Duration>,
    ) -> AgentResult<AgentMessage> {
        if message.message_type != MessageType::Request {
            return Err(self.reject(
                &message,
                vec![format!(
                    "request() needs a request message, got {}",
                    message.message_type
                )],
            ));
        }

        let timeout = timeout
            .or_else(|| message.metadata.timeout_ms.map(Duration::from_millis))
            .unwrap_or_else(|| self.settings.request_timeout());
        let request_id = message.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        // The deadline covers handler execution; a late reply is routed like
        // any unsolicited response
        let delivery = {
            let bus = self.clone();
            tokio::spawn(async move { bus.publish(message).await })
        };
        let exchange = async {
            match delivery.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(join_error) => {
                    return Err(AgentError::communication(format!(
                        "Delivery of request {request_id} aborted"
                    ))
                    .with_cause(join_error))
                }
            }
            match rx.await {
                Ok(reply) => reply,
                Err(_) => Err(AgentError::communication(format!(
                    "Request {request_id} was dropped without a reply"
                ))),
            }
        };

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                metrics().record_request_timeout();
                Err(AgentError::timeout(format!(
                    "Request {request_id} timed out after {}ms",
                    timeout.as_millis()
                ))
                .with_metadata("message_id", json!(request_id)))
            }
        };

        self.pending.lock().await.remove(&request_id);
        outcome
    }

    /// Deliver to every subscriber except the sender, independently
    pub async fn broadcast(&self, message: AgentMessage) -> AgentResult<BroadcastReport> {
        let violations = message.violations(false);
        if !violations.is_empty() {
            return Err(self.reject(&message, violations));
        }
        self.record(&message).await;

        let targets: Vec<(String, Arc<dyn MessageHandler>)> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != message.sender)
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();

        let results = join_all(targets.into_iter().map(|(id, handler)| {
            let copy = message.clone().to(id.clone());
            async move {
                let result = handler.handle(copy).await;
                (id, result)
            }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered.push(id),
                Err(e) => {
                    warn!(recipient = %id, error = %e, "Broadcast delivery failed");
                    report.failed.push((id, e));
                }
            }
        }
        Ok(report)
    }

    pub fn should_send_to_agent(&self, agent_id: &str) -> bool {
        self.breakers.should_send(agent_id)
    }

    pub fn record_agent_failure(&self, agent_id: &str) {
        self.breakers.record_failure(agent_id);
    }

    pub fn record_agent_success(&self, agent_id: &str) {
        self.breakers.record_success(agent_id);
    }

    pub fn circuit_state(&self, agent_id: &str) -> CircuitState {
        self.breakers.state(agent_id)
    }

    pub fn register_agent_instance(&self, agent_id: &str, instance_id: &str) -> bool {
        self.balancer.register_instance(agent_id, instance_id)
    }

    pub fn unregister_agent_instance(&self, agent_id: &str, instance_id: &str) -> bool {
        self.balancer.unregister_instance(agent_id, instance_id)
    }

    pub fn get_next_agent_instance(&self, agent_id: &str) -> Option<String> {
        self.balancer.next_instance(agent_id)
    }

    /// Most recent messages, oldest first; `None` returns the whole ring
    pub async fn history(&self, limit: Option<usize>) -> Vec<AgentMessage> {
        let history = self.history.lock().await;
        let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.handlers.read().await.len(),
            pending_requests: self.pending.lock().await.len(),
            history_len: self.history.lock().await.len(),
            history_capacity: self.settings.history_capacity,
            open_circuits: self.breakers.open_count(),
        }
    }
}

async fn deliver(handler: Arc<dyn MessageHandler>, recipient: &str, message: AgentMessage) {
    let message_id = message.id.clone();
    if let Err(e) = handler.handle(message).await {
        warn!(
            message_id = %message_id,
            recipient = %recipient,
            error = %e,
            "Message handler failed"
        );
    }
}

fn reply_error(message: &AgentMessage) -> AgentError {
    let text = message.error_text().unwrap_or("request failed");
    AgentError::agent_failure(text.to_string())
        .with_agent(message.sender.clone())
        .with_metadata("correlation_id", json!(message.correlation_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::mocks::{FailingHandler, RecordingHandler};

    fn small_bus(capacity: usize) -> MessageBus {
        MessageBus::new(BusSection {
            history_capacity: capacity,
            ..BusSection::default()
        })
    }

    #[tokio::test]
    async fn test_invalid_message_is_rejected() {
        let bus = MessageBus::default();
        let mut message = AgentMessage::request("a", "b", "run", json!({}));
        message.payload.action = None;

        let err = bus.publish(message).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommunicationException);
        assert!(bus.history(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_ring_evicts_oldest() {
        let bus = small_bus(3);
        let first = AgentMessage::notification("a", json!(0));
        let first_id = first.id.clone();
        bus.publish(first).await.unwrap();
        for i in 1..5 {
            bus.publish(AgentMessage::notification("a", json!(i)))
                .await
                .unwrap();
        }

        let history = bus.history(None).await;
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|m| m.id != first_id));
        assert_eq!(history.last().unwrap().payload.data, json!(4));
        assert_eq!(bus.history(Some(1)).await.len(), 1);

        bus.clear_history().await;
        assert_eq!(bus.stats().await.history_len, 0);
    }

    #[tokio::test]
    async fn test_notification_fans_out_except_sender() {
        let bus = MessageBus::default();
        let a = Arc::new(RecordingHandler::new());
        let b = Arc::new(RecordingHandler::new());
        let c = Arc::new(RecordingHandler::new());
        bus.subscribe("a", a.clone()).await;
        bus.subscribe("b", b.clone()).await;
        bus.subscribe("c", c.clone()).await;

        bus.publish(AgentMessage::notification("a", json!({"event": "ready"})))
            .await
            .unwrap();

        assert_eq!(a.count().await, 0);
        assert_eq!(b.count().await, 1);
        assert_eq!(c.count().await, 1);
    }

    #[tokio::test]
    async fn test_addressed_notification_reaches_only_recipient() {
        let bus = MessageBus::default();
        let b = Arc::new(RecordingHandler::new());
        let c = Arc::new(RecordingHandler::new());
        bus.subscribe("b", b.clone()).await;
        bus.subscribe("c", c.clone()).await;

        bus.publish(AgentMessage::notification("a", json!({"event": "ready"})).to("b"))
            .await
            .unwrap();

        assert_eq!(b.count().await, 1);
        assert_eq!(b.messages().await[0].recipient.as_deref(), Some("b"));
        assert_eq!(c.count().await, 0);
    }

    #[tokio::test]
    async fn test_request_handler_failure_is_contained() {
        let bus = MessageBus::default();
        bus.subscribe("worker", Arc::new(FailingHandler::new("token=abc boom")))
            .await;
        let requester = Arc::new(RecordingHandler::new());
        bus.subscribe("client", requester.clone()).await;

        let request = AgentMessage::request("client", "worker", "run", json!({}));
        let request_id = request.id.clone();
        bus.publish(request).await.unwrap();

        let received = requester.messages().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_type, MessageType::Error);
        assert_eq!(received[0].correlation_id(), Some(request_id.as_str()));
        assert!(!received[0].error_text().unwrap().contains("abc"));
    }

    #[tokio::test]
    async fn test_request_to_unknown_recipient_fails() {
        let bus = MessageBus::default();
        let err = bus
            .request(AgentMessage::request("a", "nobody", "run", json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommunicationException);
        assert_eq!(bus.stats().await.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_request_times_out_and_clears_pending() {
        let bus = MessageBus::default();
        bus.subscribe("silent", Arc::new(RecordingHandler::new()))
            .await;

        let err = bus
            .request(
                AgentMessage::request("a", "silent", "run", json!({})),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
        assert_eq!(bus.stats().await.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_unsolicited_response_reaches_recipient() {
        let bus = MessageBus::default();
        let target = Arc::new(RecordingHandler::new());
        bus.subscribe("a", target.clone()).await;

        let orphan = AgentMessage::request("a", "b", "run", json!({})).reply("b", json!(1));
        bus.publish(orphan).await.unwrap();
        assert_eq!(target.count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_is_all_settled() {
        let bus = MessageBus::default();
        let ok = Arc::new(RecordingHandler::new());
        bus.subscribe("ok", ok.clone()).await;
        bus.subscribe("bad", Arc::new(FailingHandler::new("nope"))).await;
        bus.subscribe("origin", Arc::new(RecordingHandler::new()))
            .await;

        let report = bus
            .broadcast(AgentMessage::notification("origin", json!("hello")))
            .await
            .unwrap();
        assert_eq!(report.delivered, vec!["ok".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(ok.messages().await[0].recipient.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_circuit_and_balancer_passthrough() {
        let bus = MessageBus::default();
        for _ in 0..3 {
            bus.record_agent_failure("flaky");
        }
        assert!(!bus.should_send_to_agent("flaky"));
        assert_eq!(bus.circuit_state("flaky"), CircuitState::Open);
        assert_eq!(bus.stats().await.open_circuits, 1);

        bus.register_agent_instance("writer", "w1");
        bus.register_agent_instance("writer", "w2");
        assert_eq!(bus.get_next_agent_instance("writer").as_deref(), Some("w1"));
        assert_eq!(bus.get_next_agent_instance("writer").as_deref(), Some("w2"));
    }
}
