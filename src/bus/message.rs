//! Message types exchanged over the bus

use crate::error::sanitize_error_message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Error,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Error => "error",
            MessageType::Heartbeat => "heartbeat",
        }
    }

    /// Whether this type answers a request
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Unit of communication between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    /// Absent only for notifications, which fan out to every subscriber
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: MessagePayload,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl AgentMessage {
    pub fn new<S: Into<String>>(message_type: MessageType, sender: S, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            sender: sender.into(),
            recipient: None,
            message_type,
            payload: MessagePayload {
                data,
                ..MessagePayload::default()
            },
            metadata: MessageMetadata::default(),
        }
    }

    pub fn request<S: Into<String>>(sender: S, recipient: S, action: S, data: Value) -> Self {
        let mut message = Self::new(MessageType::Request, sender, data);
        message.recipient = Some(recipient.into());
        message.payload.action = Some(action.into());
        message
    }

    pub fn notification<S: Into<String>>(sender: S, data: Value) -> Self {
        Self::new(MessageType::Notification, sender, data)
    }

    pub fn heartbeat<S: Into<String>>(sender: S, recipient: S) -> Self {
        Self::new(MessageType::Heartbeat, sender, Value::Null).to(recipient)
    }

    /// Response to this message, addressed back to its sender
    pub fn reply<S: Into<String>>(&self, sender: S, data: Value) -> Self {
        let mut message = Self::new(MessageType::Response, sender, data);
        message.recipient = Some(self.sender.clone());
        message.payload.context_id = self.payload.context_id.clone();
        message.payload.action = self.payload.action.clone();
        message.payload.correlation_id = Some(self.id.clone());
        message
    }

    /// Error reply to this message; the text is sanitized before it leaves
    /// the responder
    pub fn error_reply<S: Into<String>>(&self, sender: S, error: &str) -> Self {
        let mut message = self.reply(sender, json!({ "error": sanitize_error_message(error) }));
        message.message_type = MessageType::Error;
        message
    }

    pub fn to<S: Into<String>>(mut self, recipient: S) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_context_id<S: Into<String>>(mut self, context_id: S) -> Self {
        self.payload.context_id = Some(context_id.into());
        self
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.payload.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.metadata.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.correlation_id.as_deref()
    }

    /// Error text carried by an error message
    pub fn error_text(&self) -> Option<&str> {
        if self.message_type != MessageType::Error {
            return None;
        }
        self.payload
            .data
            .get("error")
            .and_then(Value::as_str)
            .or_else(|| self.payload.data.as_str())
    }

    /// Every structural problem with this message
    pub fn violations(&self, recipient_required: bool) -> Vec<String> {
        let mut violations = Vec::new();
        if self.id.trim().is_empty() {
            violations.push("id is required".to_string());
        }
        if self.sender.trim().is_empty() {
            violations.push("sender is required".to_string());
        }
        let needs_recipient =
            recipient_required && self.message_type != MessageType::Notification;
        if needs_recipient && self.recipient.as_deref().map_or(true, |r| r.trim().is_empty()) {
            violations.push(format!("{} messages require a recipient", self.message_type));
        }
        if self.message_type == MessageType::Request
            && self.payload.action.as_deref().map_or(true, str::is_empty)
        {
            violations.push("request messages require an action".to_string());
        }
        if self.message_type == MessageType::Response && self.correlation_id().is_none() {
            violations.push("response messages require a correlation id".to_string());
        }
        violations
    }
}
