use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use shared_models::user::UserRole;

use crate::error::{ConflictReason, ErrorKind, QueueError};
use crate::models::{ConsultationRequest, QueueSnapshot, Specialty};

/// Messages pushed to connected clients. Serialized as
/// `{"event": "<kebab-name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    QueueStatus(QueueStatusPayload),
    QueueUpdated(QueueStatusPayload),
    ConsultationAssumed(ConsultationEventPayload),
    ConsultationStarted(ConsultationEventPayload),
    ConsultationFinished(ConsultationEventPayload),
    ConsultationReleased(ConsultationEventPayload),
    ConsultationCancelled(ConsultationEventPayload),
    UserJoinedQueue(RoomMembershipPayload),
    UserLeftQueue(RoomMembershipPayload),
    Ack(Ack),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::QueueStatus(_) => "queue-status",
            ServerEvent::QueueUpdated(_) => "queue-updated",
            ServerEvent::ConsultationAssumed(_) => "consultation-assumed",
            ServerEvent::ConsultationStarted(_) => "consultation-started",
            ServerEvent::ConsultationFinished(_) => "consultation-finished",
            ServerEvent::ConsultationReleased(_) => "consultation-released",
            ServerEvent::ConsultationCancelled(_) => "consultation-cancelled",
            ServerEvent::UserJoinedQueue(_) => "user-joined-queue",
            ServerEvent::UserLeftQueue(_) => "user-left-queue",
            ServerEvent::Ack(_) => "ack",
        }
    }

    pub fn to_message(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusPayload {
    pub specialty: Specialty,
    pub waiting: Vec<ConsultationRequest>,
    pub queue_length: usize,
    pub in_progress: usize,
    pub online_professionals: usize,
    pub version: u64,
}

impl QueueStatusPayload {
    pub fn from_snapshot(snapshot: &QueueSnapshot, online_professionals: usize) -> Self {
        Self {
            specialty: snapshot.specialty,
            waiting: snapshot.waiting.clone(),
            queue_length: snapshot.queue_length(),
            in_progress: snapshot.in_progress.len(),
            online_professionals,
            version: snapshot.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationEventPayload {
    pub request: ConsultationRequest,
    pub professional_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMembershipPayload {
    pub specialty: Specialty,
    pub user_id: Uuid,
    pub role: UserRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub event: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConflictReason>,
    pub message: String,
}

impl Ack {
    pub fn success(reference: Option<String>, event: &str, data: Option<Value>) -> Self {
        Self {
            reference,
            event: event.to_string(),
            ok: true,
            data,
            error: None,
        }
    }

    pub fn failure(reference: Option<String>, event: &str, error: &QueueError) -> Self {
        Self {
            reference,
            event: event.to_string(),
            ok: false,
            data: None,
            error: Some(AckError {
                kind: error.kind(),
                reason: error.conflict_reason(),
                message: error.to_string(),
            }),
        }
    }
}

/// Events a connected client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinSpecialtyQueue {
        specialty: String,
    },
    LeaveSpecialtyQueue {
        specialty: String,
    },
    AssumeConsultation {
        request_id: Uuid,
    },
    FinishConsultation {
        request_id: Uuid,
        #[serde(default)]
        notes: Option<String>,
    },
    RequestQueueUpdate {
        specialty: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinSpecialtyQueue { .. } => "join-specialty-queue",
            ClientEvent::LeaveSpecialtyQueue { .. } => "leave-specialty-queue",
            ClientEvent::AssumeConsultation { .. } => "assume-consultation",
            ClientEvent::FinishConsultation { .. } => "finish-consultation",
            ClientEvent::RequestQueueUpdate { .. } => "request-queue-update",
        }
    }
}

/// A client frame: the event plus an optional correlation reference echoed
/// back in the acknowledgement.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub reference: Option<String>,
    pub event: ClientEvent,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, (Option<String>, QueueError)> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| (None, QueueError::ValidationError(format!("Malformed message: {}", e))))?;

        let reference = raw.get("ref").and_then(|r| match r {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        let event = serde_json::from_value::<ClientEvent>(raw).map_err(|e| {
            (
                reference.clone(),
                QueueError::ValidationError(format!("Unsupported event: {}", e)),
            )
        })?;

        Ok(Self { reference, event })
    }
}
