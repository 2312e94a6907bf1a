use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Extension,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared_models::user::User;

use crate::error::QueueError;
use crate::events::{Ack, ClientEvent, ClientMessage, QueueStatusPayload, RoomMembershipPayload, ServerEvent};
use crate::models::Specialty;
use crate::services::{specialty_for_role, RoomReceiver, Room};
use crate::state::ConsultationQueueState;

const OUTBOUND_BUFFER: usize = 64;

/// One connected client. Inbound frames are handled in order and each gets
/// an `ack`; room traffic is forwarded by one task per joined room.
///
/// Room forwarders share the outbound channel with acks but run on their
/// own tasks, so room events are not ordered against acks. A
/// `queue-updated` caused by an `assume-consultation` may reach the client
/// before that frame's ack. Clients order queue state by the snapshot
/// `version`, not by arrival.
pub struct RealtimeSession {
    user: User,
    state: Arc<ConsultationQueueState>,
    outbound: mpsc::Sender<String>,
    forwarders: HashMap<Room, JoinHandle<()>>,
}

impl RealtimeSession {
    pub async fn open(user: User, state: Arc<ConsultationQueueState>, outbound: mpsc::Sender<String>) -> Self {
        let mut session = Self {
            user,
            state,
            outbound,
            forwarders: HashMap::new(),
        };

        session.subscribe(Room::User(session.user.id)).await;

        if session.user.role.is_professional() {
            session.touch_presence().await;
        }

        info!("Realtime session opened for {} ({})", session.user.id, session.user.role);
        session
    }

    pub fn joined_specialties(&self) -> Vec<Specialty> {
        self.forwarders
            .keys()
            .filter_map(|room| match room {
                Room::Specialty(specialty) => Some(*specialty),
                Room::User(_) => None,
            })
            .collect()
    }

    /// Handle one inbound text frame. The ack is sent before any follow-up
    /// event the handler itself produces; room events are not covered.
    pub async fn handle_text(&mut self, text: &str) -> Ack {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err((reference, e)) => {
                debug!("Rejected frame from {}: {}", self.user.id, e);
                let ack = Ack::failure(reference, "unknown", &e);
                self.send(&ServerEvent::Ack(ack.clone())).await;
                return ack;
            }
        };

        if self.user.role.is_professional() {
            self.touch_presence().await;
        }

        let event_name = message.event.name();
        let (ack, follow_up) = match self.dispatch(message.event).await {
            Ok((data, follow_up)) => (Ack::success(message.reference, event_name, data), follow_up),
            Err(e) => {
                debug!("{} from {} failed: {}", event_name, self.user.id, e);
                (Ack::failure(message.reference, event_name, &e), None)
            }
        };

        self.send(&ServerEvent::Ack(ack.clone())).await;
        if let Some(event) = follow_up {
            self.send(&event).await;
        }

        ack
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(Option<Value>, Option<ServerEvent>), QueueError> {
        match event {
            ClientEvent::JoinSpecialtyQueue { specialty } => {
                let specialty: Specialty = specialty.parse()?;
                self.check_room_access(specialty)?;

                self.subscribe(Room::Specialty(specialty)).await;
                self.announce(specialty, true).await;

                let status = self.queue_status(specialty).await?;
                Ok((Some(json!({ "specialty": specialty })), Some(status)))
            }
            ClientEvent::LeaveSpecialtyQueue { specialty } => {
                let specialty: Specialty = specialty.parse()?;
                if let Some(forwarder) = self.forwarders.remove(&Room::Specialty(specialty)) {
                    forwarder.abort();
                    self.announce(specialty, false).await;
                }
                Ok((Some(json!({ "specialty": specialty })), None))
            }
            ClientEvent::AssumeConsultation { request_id } => {
                self.require_professional()?;
                let request = self.state.dispatcher.assume(request_id, self.user.id).await?;
                Ok((Some(serde_json::to_value(request)?), None))
            }
            ClientEvent::FinishConsultation { request_id, notes } => {
                self.require_professional()?;
                let request = self.state.dispatcher.finish(request_id, self.user.id, notes).await?;
                Ok((Some(serde_json::to_value(request)?), None))
            }
            ClientEvent::RequestQueueUpdate { specialty } => {
                let specialty: Specialty = specialty.parse()?;
                self.check_room_access(specialty)?;
                let status = self.queue_status(specialty).await?;
                Ok((None, Some(status)))
            }
        }
    }

    fn require_professional(&self) -> Result<(), QueueError> {
        if self.user.role.is_professional() {
            Ok(())
        } else {
            Err(QueueError::ValidationError(
                "Only professionals can take consultations".to_string(),
            ))
        }
    }

    /// Professionals only follow their own specialty's room.
    fn check_room_access(&self, specialty: Specialty) -> Result<(), QueueError> {
        match specialty_for_role(self.user.role) {
            Some(own) if own != specialty => Err(QueueError::ValidationError(format!(
                "A {} cannot join the {} queue",
                self.user.role, specialty
            ))),
            _ => Ok(()),
        }
    }

    async fn queue_status(&self, specialty: Specialty) -> Result<ServerEvent, QueueError> {
        let snapshot = self.state.dispatcher.snapshot(specialty)?;
        let online = self.state.presence.count(specialty).await;
        Ok(ServerEvent::QueueStatus(QueueStatusPayload::from_snapshot(&snapshot, online)))
    }

    async fn announce(&self, specialty: Specialty, joined: bool) {
        let payload = RoomMembershipPayload {
            specialty,
            user_id: self.user.id,
            role: self.user.role,
        };
        let event = if joined {
            ServerEvent::UserJoinedQueue(payload)
        } else {
            ServerEvent::UserLeftQueue(payload)
        };

        if let Err(e) = self.state.broadcaster.publish(Room::Specialty(specialty), &event).await {
            warn!("Failed to announce {} in {}: {}", event.name(), specialty, e);
        }
    }

    async fn touch_presence(&self) {
        if let Err(e) = self.state.professional_seen(&self.user).await {
            debug!("Presence of {} not refreshed: {}", self.user.id, e);
        }
    }

    async fn subscribe(&mut self, room: Room) {
        if self.forwarders.contains_key(&room) {
            return;
        }

        let receiver = self.state.broadcaster.subscribe(room).await;
        let forwarder = tokio::spawn(forward(room, receiver, self.outbound.clone()));
        self.forwarders.insert(room, forwarder);
    }

    async fn send(&self, event: &ServerEvent) {
        match event.to_message() {
            Ok(message) => {
                if self.outbound.send(message).await.is_err() {
                    debug!("Connection of {} already closed", self.user.id);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", event.name(), e),
        }
    }

    /// Leave every room. Assigned consultations are kept; the heartbeat
    /// watchdog decides whether the professional is gone.
    pub async fn close(mut self) {
        for specialty in self.joined_specialties() {
            self.announce(specialty, false).await;
        }

        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }

        info!("Realtime session closed for {}", self.user.id);
    }
}

async fn forward(room: Room, mut receiver: RoomReceiver, outbound: mpsc::Sender<String>) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                if outbound.send(message).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Client in {} lagged behind, {} messages dropped", room, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: Arc<ConsultationQueueState>, user: User) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = RealtimeSession::open(user, state, outbound_tx).await;

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                session.handle_text(text.as_str()).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    session.close().await;
    writer.abort();
}

