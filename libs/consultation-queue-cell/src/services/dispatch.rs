use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shared_models::user::{User, UserRole};

use crate::error::{ConflictReason, QueueError};
use crate::events::{ConsultationEventPayload, QueueStatusPayload, ServerEvent};
use crate::models::{
    ConsultationRequest, ConsultationStatus, DailyCounters, DispatchConfig, PresenceStatus, Priority,
    QueuePosition, QueueSnapshot, RequeuePosition, Specialty, SubmitConsultationRequest,
};
use crate::services::broadcaster::{RealtimeBroadcaster, Room};
use crate::services::cache::CacheStore;
use crate::services::estimator::wait_time_cache_key;
use crate::services::presence::{role_for_specialty, specialty_for_role, PresenceTracker};
use crate::services::queue::SpecialtyQueue;
use crate::services::store::ConsultationStore;

const MAX_DESCRIPTION_LEN: usize = 2000;

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

enum DispatchCommand {
    Enqueue {
        request: ConsultationRequest,
        reply: Reply<QueuePosition>,
    },
    Assume {
        request_id: Uuid,
        professional_id: Uuid,
        reply: Reply<ConsultationRequest>,
    },
    Finish {
        request_id: Uuid,
        professional_id: Uuid,
        notes: Option<String>,
        reply: Reply<ConsultationRequest>,
    },
    Cancel {
        request_id: Uuid,
        actor: User,
        reply: Reply<ConsultationRequest>,
    },
    Release {
        professional_id: Uuid,
        reply: Reply<Vec<ConsultationRequest>>,
    },
}

/// Collaborators shared by every specialty engine.
#[derive(Clone)]
pub struct DispatchDeps {
    pub store: Arc<dyn ConsultationStore>,
    pub presence: Arc<PresenceTracker>,
    pub broadcaster: Arc<RealtimeBroadcaster>,
    pub cache: Arc<dyn CacheStore>,
}

type Notice = (Vec<Uuid>, ServerEvent);

/// Single owner of one specialty's queue and in-progress consultations.
/// All mutations arrive as commands on one channel and run one at a time.
pub struct DispatchEngine {
    specialty: Specialty,
    config: DispatchConfig,
    deps: DispatchDeps,
    queue: SpecialtyQueue,
    active: HashMap<Uuid, ConsultationRequest>,
    daily_date: NaiveDate,
    daily: DailyCounters,
    version: u64,
    snapshots: watch::Sender<Arc<QueueSnapshot>>,
}

impl DispatchEngine {
    /// Load the specialty's open requests from the store and start the
    /// engine task.
    pub async fn spawn(
        specialty: Specialty,
        config: DispatchConfig,
        deps: DispatchDeps,
    ) -> Result<DispatchHandle, QueueError> {
        let mut queue = SpecialtyQueue::new(specialty);
        for request in deps.store.find_queued(specialty).await? {
            let request_id = request.id;
            if let Err(e) = queue.enqueue(request) {
                warn!("Skipping stored request {} while loading {}: {}", request_id, specialty, e);
            }
        }

        let active: HashMap<Uuid, ConsultationRequest> = deps
            .store
            .find_assigned(specialty)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let now = Utc::now();
        let role = role_for_specialty(specialty);
        for professional_id in active.values().filter_map(|r| r.assigned_professional_id) {
            deps.presence.restore_assignment(professional_id, role, now).await;
        }

        // versions restart at zero, so estimates cached by a previous run are unusable
        if let Err(e) = deps.cache.delete(&wait_time_cache_key(specialty)).await {
            warn!("Failed to clear wait-time cache for {}: {}", specialty, e);
        }

        let daily = Self::load_daily_counters(&deps, specialty, now).await;

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(QueueSnapshot::empty(specialty)));
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));

        let engine = Self {
            specialty,
            config,
            deps,
            queue,
            active,
            daily_date: now.date_naive(),
            daily,
            version: 0,
            snapshots: snapshot_tx,
        };
        engine.publish_snapshot();

        info!(
            "Dispatch engine for {} started with {} queued and {} in progress",
            specialty,
            engine.queue.len(),
            engine.active.len()
        );

        tokio::spawn(engine.run(command_rx));

        Ok(DispatchHandle {
            specialty,
            commands: command_tx,
            snapshots: snapshot_rx,
        })
    }

    async fn load_daily_counters(deps: &DispatchDeps, specialty: Specialty, now: DateTime<Utc>) -> DailyCounters {
        let start_of_day = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let mut counters = DailyCounters::default();

        match deps.store.find_finished_since(specialty, start_of_day).await {
            Ok(finished) => {
                for timing in finished {
                    counters.finished += 1;
                    counters.total_wait_minutes += (timing.started_at - timing.created_at).num_minutes();
                    counters.total_duration_minutes += (timing.finished_at - timing.started_at).num_minutes();
                }
            }
            Err(e) => warn!("Could not load today's statistics for {}: {}", specialty, e),
        }

        counters
    }

    async fn run(mut self, mut commands: mpsc::Receiver<DispatchCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                DispatchCommand::Enqueue { request, reply } => {
                    let _ = reply.send(self.enqueue(request).await);
                }
                DispatchCommand::Assume {
                    request_id,
                    professional_id,
                    reply,
                } => {
                    let _ = reply.send(self.assume(request_id, professional_id).await);
                }
                DispatchCommand::Finish {
                    request_id,
                    professional_id,
                    notes,
                    reply,
                } => {
                    let _ = reply.send(self.finish(request_id, professional_id, notes).await);
                }
                DispatchCommand::Cancel { request_id, actor, reply } => {
                    let _ = reply.send(self.cancel(request_id, actor).await);
                }
                DispatchCommand::Release { professional_id, reply } => {
                    let _ = reply.send(self.release_on_disconnect(professional_id).await);
                }
            }
        }

        info!("Dispatch engine for {} stopped", self.specialty);
    }

    #[instrument(skip(self, request), fields(specialty = %self.specialty, request_id = %request.id))]
    async fn enqueue(&mut self, request: ConsultationRequest) -> Result<QueuePosition, QueueError> {
        if request.specialty != self.specialty {
            return Err(QueueError::ValidationError(format!(
                "Request for {} sent to the {} queue",
                request.specialty, self.specialty
            )));
        }

        if request.status != ConsultationStatus::Queued {
            return Err(QueueError::ValidationError(format!(
                "New requests must be queued, got {}",
                request.status
            )));
        }

        if self.queue.get(&request.id).is_some() || self.active.contains_key(&request.id) {
            return Err(QueueError::conflict(
                ConflictReason::DuplicateActive,
                format!("Request {} is already active", request.id),
            ));
        }

        if self.queue.has_patient(&request.patient_id)
            || self.active.values().any(|r| r.patient_id == request.patient_id)
        {
            return Err(QueueError::conflict(
                ConflictReason::DuplicateActive,
                format!(
                    "Patient {} already has an active {} request",
                    request.patient_id, self.specialty
                ),
            ));
        }

        self.deps.store.save(&request).await?;

        let request_id = request.id;
        let position = self.queue.enqueue(request)?;
        self.after_commit(Vec::new()).await;

        Ok(QueuePosition {
            request_id,
            specialty: self.specialty,
            position,
            ahead: position - 1,
            queue_length: self.queue.len(),
        })
    }

    #[instrument(skip(self), fields(specialty = %self.specialty))]
    async fn assume(&mut self, request_id: Uuid, professional_id: Uuid) -> Result<ConsultationRequest, QueueError> {
        if let Some(current) = self.active.get(&request_id) {
            debug!("Rejected assume of {}: already assigned", request_id);
            return Err(QueueError::conflict(
                ConflictReason::AlreadyAssigned,
                format!(
                    "Request {} is already assigned to {}",
                    request_id,
                    current
                        .assigned_professional_id
                        .map(|id| id.to_string())
                        .unwrap_or_default()
                ),
            ));
        }

        let request = match self.queue.get(&request_id) {
            Some(request) => request.clone(),
            None => return Err(self.missing(request_id).await),
        };

        let presence = self
            .deps
            .presence
            .get(professional_id)
            .await
            .ok_or(QueueError::ProfessionalNotFound(professional_id))?;

        if presence.role != role_for_specialty(self.specialty) {
            return Err(QueueError::conflict(
                ConflictReason::NotAvailable,
                format!("Professional {} does not serve {}", professional_id, self.specialty),
            ));
        }

        let load = self.load_of(professional_id);
        let has_capacity = match presence.current_status {
            PresenceStatus::Available => true,
            // busy only through our own assignments
            PresenceStatus::Busy => load > 0,
            PresenceStatus::Away | PresenceStatus::Offline => false,
        };

        if !presence.is_online || !presence.is_active || !has_capacity || load >= self.config.max_concurrent_assignments {
            debug!(
                "Rejected assume of {}: professional {} not available (status {:?}, load {})",
                request_id, professional_id, presence.current_status, load
            );
            return Err(QueueError::conflict(
                ConflictReason::NotAvailable,
                format!("Professional {} is not available", professional_id),
            ));
        }

        let mut assigned = transition(request, ConsultationStatus::Assigned)?;
        assigned.started_at = Some(Utc::now());
        assigned.assigned_professional_id = Some(professional_id);

        self.deps.store.save(&assigned).await?;

        self.queue.remove(&request_id);
        self.active.insert(request_id, assigned.clone());
        self.deps.presence.set_status(professional_id, PresenceStatus::Busy).await;

        let parties = vec![assigned.patient_id, professional_id];
        self.after_commit(vec![
            (
                parties.clone(),
                ServerEvent::ConsultationAssumed(payload(&assigned, "Consultation assumed by a professional")),
            ),
            (
                parties,
                ServerEvent::ConsultationStarted(payload(&assigned, "Consultation started")),
            ),
        ])
        .await;

        info!("Request {} assumed by {}", request_id, professional_id);
        Ok(assigned)
    }

    #[instrument(skip(self, notes), fields(specialty = %self.specialty))]
    async fn finish(
        &mut self,
        request_id: Uuid,
        professional_id: Uuid,
        notes: Option<String>,
    ) -> Result<ConsultationRequest, QueueError> {
        let request = match self.active.get(&request_id) {
            Some(request) => request.clone(),
            None if self.queue.get(&request_id).is_some() => {
                return Err(QueueError::conflict(
                    ConflictReason::NotAssigned,
                    format!("Request {} has not been assumed", request_id),
                ));
            }
            None => return Err(self.missing(request_id).await),
        };

        if request.assigned_professional_id != Some(professional_id) {
            return Err(QueueError::conflict(
                ConflictReason::NotAssignee,
                format!("Request {} is assigned to another professional", request_id),
            ));
        }

        let mut finished = transition(request, ConsultationStatus::Finished)?;
        finished.finished_at = Some(Utc::now());
        if notes.is_some() {
            finished.notes = notes;
        }

        self.deps.store.save(&finished).await?;

        self.active.remove(&request_id);
        self.release_professional(professional_id).await;
        self.record_finished(&finished).await;

        self.after_commit(vec![(
            vec![finished.patient_id, professional_id],
            ServerEvent::ConsultationFinished(payload(&finished, "Consultation finished")),
        )])
        .await;

        info!("Request {} finished by {}", request_id, professional_id);
        Ok(finished)
    }

    #[instrument(skip(self, actor), fields(specialty = %self.specialty, actor = %actor.id))]
    async fn cancel(&mut self, request_id: Uuid, actor: User) -> Result<ConsultationRequest, QueueError> {
        if let Some(request) = self.queue.get(&request_id).cloned() {
            let allowed = actor.is_admin() || (actor.role == UserRole::Patient && request.patient_id == actor.id);
            if !allowed {
                return Err(QueueError::conflict(
                    ConflictReason::NotOwner,
                    format!("User {} cannot cancel request {}", actor.id, request_id),
                ));
            }

            let cancelled = transition(request, ConsultationStatus::Cancelled)?;
            self.deps.store.save(&cancelled).await?;

            self.queue.remove(&request_id);
            self.record_cancelled().await;
            self.after_commit(vec![(
                vec![cancelled.patient_id],
                ServerEvent::ConsultationCancelled(payload(&cancelled, "Consultation request cancelled")),
            )])
            .await;

            info!("Queued request {} cancelled by {}", request_id, actor.id);
            return Ok(cancelled);
        }

        if let Some(request) = self.active.get(&request_id).cloned() {
            if !actor.is_admin() {
                let reason = if actor.role == UserRole::Patient && request.patient_id == actor.id {
                    ConflictReason::NotCancellable
                } else {
                    ConflictReason::NotOwner
                };
                return Err(QueueError::conflict(
                    reason,
                    format!("Request {} is in progress and can only be cancelled by an administrator", request_id),
                ));
            }

            let professional_id = request.assigned_professional_id;
            let mut parties = vec![request.patient_id];
            parties.extend(professional_id);

            if self.config.requeue_on_assigned_cancel {
                let requeued = reset_to_queued(request);
                self.deps.store.save(&requeued).await?;

                self.active.remove(&request_id);
                if let Err(e) = self.queue.requeue(requeued.clone(), RequeuePosition::Original, Utc::now()) {
                    warn!("Request {} persisted as queued but could not re-enter the queue: {}", request_id, e);
                }
                if let Some(professional_id) = professional_id {
                    self.release_professional(professional_id).await;
                }

                self.after_commit(vec![(
                    parties,
                    ServerEvent::ConsultationReleased(payload(
                        &requeued,
                        "Consultation returned to the queue by an administrator",
                    )),
                )])
                .await;

                info!("In-progress request {} returned to queue by {}", request_id, actor.id);
                return Ok(requeued);
            }

            let cancelled = transition(request, ConsultationStatus::Cancelled)?;
            self.deps.store.save(&cancelled).await?;

            self.active.remove(&request_id);
            if let Some(professional_id) = professional_id {
                self.release_professional(professional_id).await;
            }
            self.record_cancelled().await;

            self.after_commit(vec![(
                parties,
                ServerEvent::ConsultationCancelled(payload(&cancelled, "Consultation cancelled by an administrator")),
            )])
            .await;

            info!("In-progress request {} cancelled by {}", request_id, actor.id);
            return Ok(cancelled);
        }

        Err(self.missing(request_id).await)
    }

    #[instrument(skip(self), fields(specialty = %self.specialty))]
    async fn release_on_disconnect(&mut self, professional_id: Uuid) -> Result<Vec<ConsultationRequest>, QueueError> {
        let mut assigned: Vec<ConsultationRequest> = self
            .active
            .values()
            .filter(|r| r.is_assigned_to(professional_id))
            .cloned()
            .collect();
        assigned.sort_by_key(|r| r.created_at);

        let now = Utc::now();
        let mut released = Vec::new();
        let mut failure = None;

        for request in assigned {
            let request_id = request.id;
            let requeued = reset_to_queued(request);

            if let Err(e) = self.deps.store.save(&requeued).await {
                failure = Some(e);
                break;
            }

            self.active.remove(&request_id);
            if let Err(e) = self.queue.requeue(requeued.clone(), self.config.disconnect_requeue, now) {
                warn!("Request {} persisted as queued but could not re-enter the queue: {}", request_id, e);
            }
            released.push(requeued);
        }

        let notices = released
            .iter()
            .map(|r| {
                (
                    vec![r.patient_id, professional_id],
                    ServerEvent::ConsultationReleased(payload(
                        r,
                        "The professional disconnected; your request is back in the queue",
                    )),
                )
            })
            .collect();
        self.after_commit(notices).await;

        if !released.is_empty() {
            info!(
                "Released {} request(s) held by disconnected professional {}",
                released.len(),
                professional_id
            );
        }

        // stay online on failure so the next sweep retries the remainder
        if let Some(e) = failure {
            return Err(e);
        }

        if let Err(e) = self
            .deps
            .presence
            .set_presence(professional_id, false, PresenceStatus::Offline)
            .await
        {
            debug!("Presence of {} not updated on release: {}", professional_id, e);
        }

        Ok(released)
    }

    fn load_of(&self, professional_id: Uuid) -> usize {
        self.active.values().filter(|r| r.is_assigned_to(professional_id)).count()
    }

    async fn release_professional(&self, professional_id: Uuid) {
        if self.load_of(professional_id) == 0 {
            self.deps
                .presence
                .set_status(professional_id, PresenceStatus::Available)
                .await;
        }
    }

    /// Error for a request this engine does not hold.
    async fn missing(&self, request_id: Uuid) -> QueueError {
        match self.deps.store.find_by_id(request_id).await {
            Ok(Some(request)) if request.status.is_terminal() => QueueError::conflict(
                ConflictReason::AlreadyTerminal,
                format!("Request {} is already {}", request_id, request.status),
            ),
            Ok(Some(request)) if request.specialty == self.specialty => QueueError::conflict(
                ConflictReason::NotAssigned,
                format!("Request {} is {} but not held by the dispatcher", request_id, request.status),
            ),
            Ok(_) => QueueError::RequestNotFound(request_id),
            Err(e) => e,
        }
    }

    fn roll_daily(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.daily_date {
            self.daily_date = today;
            self.daily = DailyCounters::default();
        }
    }

    async fn record_finished(&mut self, request: &ConsultationRequest) {
        self.roll_daily(Utc::now());
        self.daily.finished += 1;
        if let (Some(started_at), Some(finished_at)) = (request.started_at, request.finished_at) {
            self.daily.total_wait_minutes += (started_at - request.created_at).num_minutes();
            self.daily.total_duration_minutes += (finished_at - started_at).num_minutes();
        }
        self.flush_daily().await;
    }

    async fn record_cancelled(&mut self) {
        self.roll_daily(Utc::now());
        self.daily.cancelled += 1;
        self.flush_daily().await;
    }

    async fn flush_daily(&self) {
        if let Err(e) = self
            .deps
            .store
            .upsert_daily_statistics(self.specialty, self.daily_date, &self.daily)
            .await
        {
            warn!("Failed to update daily statistics for {}: {}", self.specialty, e);
        }
    }

    fn publish_snapshot(&self) -> Arc<QueueSnapshot> {
        let mut in_progress: Vec<ConsultationRequest> = self.active.values().cloned().collect();
        in_progress.sort_by_key(|r| r.started_at);

        let snapshot = Arc::new(QueueSnapshot {
            specialty: self.specialty,
            waiting: self.queue.iter().cloned().collect(),
            in_progress,
            version: self.version,
            updated_at: Utc::now(),
        });
        self.snapshots.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// Side effects of every successful commit, in order: new snapshot,
    /// estimator cache invalidation, room update, targeted notices.
    async fn after_commit(&mut self, notices: Vec<Notice>) {
        self.version += 1;
        let snapshot = self.publish_snapshot();

        if let Err(e) = self.deps.cache.delete(&wait_time_cache_key(self.specialty)).await {
            warn!("Failed to invalidate wait-time cache for {}: {}", self.specialty, e);
        }

        let online = self.deps.presence.count(self.specialty).await;
        let update = ServerEvent::QueueUpdated(QueueStatusPayload::from_snapshot(&snapshot, online));
        if let Err(e) = self
            .deps
            .broadcaster
            .publish(Room::Specialty(self.specialty), &update)
            .await
        {
            warn!("Failed to broadcast queue update for {}: {}", self.specialty, e);
        }

        for (users, event) in notices {
            if let Err(e) = self.deps.broadcaster.publish_to_users(&users, &event).await {
                warn!("Failed to send {} notice: {}", event.name(), e);
            }
        }

        debug!("Committed version {} of the {} queue", self.version, self.specialty);
    }
}

fn payload(request: &ConsultationRequest, message: &str) -> ConsultationEventPayload {
    ConsultationEventPayload {
        request: request.clone(),
        professional_id: request.assigned_professional_id,
        message: message.to_string(),
    }
}

fn transition(
    mut request: ConsultationRequest,
    target: ConsultationStatus,
) -> Result<ConsultationRequest, QueueError> {
    if !request.status.can_transition_to(&target) {
        return Err(QueueError::ValidationError(format!(
            "Request {} cannot move from {} to {}",
            request.id, request.status, target
        )));
    }
    request.status = target;
    Ok(request)
}

fn reset_to_queued(mut request: ConsultationRequest) -> ConsultationRequest {
    request.status = ConsultationStatus::Queued;
    request.started_at = None;
    request.assigned_professional_id = None;
    request
}

/// Cloneable front door to one engine task.
#[derive(Clone)]
pub struct DispatchHandle {
    specialty: Specialty,
    commands: mpsc::Sender<DispatchCommand>,
    snapshots: watch::Receiver<Arc<QueueSnapshot>>,
}

impl DispatchHandle {
    /// Latest committed view; never waits on the command queue.
    pub fn snapshot(&self) -> Arc<QueueSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn watch(&self) -> watch::Receiver<Arc<QueueSnapshot>> {
        self.snapshots.clone()
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> DispatchCommand) -> Result<T, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| QueueError::DispatcherStopped(self.specialty))?;
        reply_rx
            .await
            .map_err(|_| QueueError::DispatcherStopped(self.specialty))?
    }

    pub async fn enqueue(&self, request: ConsultationRequest) -> Result<QueuePosition, QueueError> {
        self.call(|reply| DispatchCommand::Enqueue { request, reply }).await
    }

    pub async fn assume(&self, request_id: Uuid, professional_id: Uuid) -> Result<ConsultationRequest, QueueError> {
        self.call(|reply| DispatchCommand::Assume {
            request_id,
            professional_id,
            reply,
        })
        .await
    }

    pub async fn finish(
        &self,
        request_id: Uuid,
        professional_id: Uuid,
        notes: Option<String>,
    ) -> Result<ConsultationRequest, QueueError> {
        self.call(|reply| DispatchCommand::Finish {
            request_id,
            professional_id,
            notes,
            reply,
        })
        .await
    }

    pub async fn cancel(&self, request_id: Uuid, actor: User) -> Result<ConsultationRequest, QueueError> {
        self.call(|reply| DispatchCommand::Cancel {
            request_id,
            actor,
            reply,
        })
        .await
    }

    pub async fn release_on_disconnect(&self, professional_id: Uuid) -> Result<Vec<ConsultationRequest>, QueueError> {
        self.call(|reply| DispatchCommand::Release { professional_id, reply })
            .await
    }
}

/// Routes requests to the engine owning their specialty.
pub struct ConsultationDispatcher {
    engines: HashMap<Specialty, DispatchHandle>,
    index: RwLock<HashMap<Uuid, Specialty>>,
    store: Arc<dyn ConsultationStore>,
    presence: Arc<PresenceTracker>,
}

impl ConsultationDispatcher {
    pub async fn start(config: DispatchConfig, deps: DispatchDeps) -> Result<Self, QueueError> {
        let mut engines = HashMap::new();
        let mut index = HashMap::new();

        for specialty in Specialty::ALL {
            let handle = DispatchEngine::spawn(specialty, config.clone(), deps.clone()).await?;
            let snapshot = handle.snapshot();
            for request in snapshot.waiting.iter().chain(snapshot.in_progress.iter()) {
                index.insert(request.id, specialty);
            }
            engines.insert(specialty, handle);
        }

        Ok(Self {
            engines,
            index: RwLock::new(index),
            store: deps.store,
            presence: deps.presence,
        })
    }

    pub fn engine(&self, specialty: Specialty) -> Result<&DispatchHandle, QueueError> {
        self.engines
            .get(&specialty)
            .ok_or(QueueError::DispatcherStopped(specialty))
    }

    pub fn snapshot(&self, specialty: Specialty) -> Result<Arc<QueueSnapshot>, QueueError> {
        Ok(self.engine(specialty)?.snapshot())
    }

    /// Validate a patient submission and enqueue it.
    pub async fn submit(&self, patient: &User, body: SubmitConsultationRequest) -> Result<QueuePosition, QueueError> {
        if patient.role != UserRole::Patient {
            return Err(QueueError::ValidationError(
                "Only patients can submit consultation requests".to_string(),
            ));
        }

        let specialty: Specialty = body.specialty.parse()?;
        let priority: Priority = body.priority.parse()?;
        let description = body.description.trim().to_string();

        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(QueueError::ValidationError(format!(
                "Description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }

        let request = ConsultationRequest::new(patient.id, specialty, priority, description);
        self.enqueue(request).await
    }

    pub async fn enqueue(&self, request: ConsultationRequest) -> Result<QueuePosition, QueueError> {
        let request_id = request.id;
        let specialty = request.specialty;

        let position = self.engine(specialty)?.enqueue(request).await?;

        let mut index = self.index.write().await;
        index.insert(request_id, specialty);
        Ok(position)
    }

    async fn locate(&self, request_id: Uuid) -> Result<Specialty, QueueError> {
        {
            let index = self.index.read().await;
            if let Some(specialty) = index.get(&request_id) {
                return Ok(*specialty);
            }
        }

        match self.store.find_by_id(request_id).await? {
            Some(request) => Ok(request.specialty),
            None => Err(QueueError::RequestNotFound(request_id)),
        }
    }

    async fn forget(&self, request: &ConsultationRequest) {
        if request.status.is_terminal() {
            let mut index = self.index.write().await;
            index.remove(&request.id);
        }
    }

    pub async fn assume(&self, request_id: Uuid, professional_id: Uuid) -> Result<ConsultationRequest, QueueError> {
        let specialty = self.locate(request_id).await?;
        self.engine(specialty)?.assume(request_id, professional_id).await
    }

    pub async fn finish(
        &self,
        request_id: Uuid,
        professional_id: Uuid,
        notes: Option<String>,
    ) -> Result<ConsultationRequest, QueueError> {
        let specialty = self.locate(request_id).await?;
        let finished = self
            .engine(specialty)?
            .finish(request_id, professional_id, notes)
            .await?;
        self.forget(&finished).await;
        Ok(finished)
    }

    pub async fn cancel(&self, request_id: Uuid, actor: &User) -> Result<ConsultationRequest, QueueError> {
        let specialty = self.locate(request_id).await?;
        let cancelled = self.engine(specialty)?.cancel(request_id, actor.clone()).await?;
        self.forget(&cancelled).await;
        Ok(cancelled)
    }

    pub async fn release_on_disconnect(&self, professional_id: Uuid) -> Result<Vec<ConsultationRequest>, QueueError> {
        let specialty = match self.presence.get(professional_id).await {
            Some(presence) => specialty_for_role(presence.role).ok_or_else(|| {
                QueueError::ValidationError(format!("Role {} does not serve any specialty", presence.role))
            })?,
            None => self
                .assignment_specialty(professional_id)
                .ok_or(QueueError::ProfessionalNotFound(professional_id))?,
        };

        self.engine(specialty)?.release_on_disconnect(professional_id).await
    }

    /// Professionals holding at least one in-progress consultation.
    pub fn assigned_professionals(&self) -> Vec<Uuid> {
        let mut professionals: Vec<Uuid> = self
            .engines
            .values()
            .flat_map(|engine| {
                engine
                    .snapshot()
                    .in_progress
                    .iter()
                    .filter_map(|r| r.assigned_professional_id)
                    .collect::<Vec<_>>()
            })
            .collect();
        professionals.sort();
        professionals.dedup();
        professionals
    }

    pub fn holds_assignment(&self, professional_id: Uuid) -> bool {
        self.assignment_specialty(professional_id).is_some()
    }

    fn assignment_specialty(&self, professional_id: Uuid) -> Option<Specialty> {
        self.engines.iter().find_map(|(specialty, engine)| {
            engine
                .snapshot()
                .in_progress
                .iter()
                .any(|r| r.is_assigned_to(professional_id))
                .then_some(*specialty)
        })
    }

    /// Rank of a waiting request in the priority-then-arrival order.
    pub async fn position_of(&self, request_id: Uuid) -> Result<QueuePosition, QueueError> {
        let specialty = self.locate(request_id).await?;
        let snapshot = self.snapshot(specialty)?;

        if let Some(position) = snapshot.position_of(request_id) {
            return Ok(QueuePosition {
                request_id,
                specialty,
                position,
                ahead: position - 1,
                queue_length: snapshot.queue_length(),
            });
        }

        if snapshot.in_progress.iter().any(|r| r.id == request_id) {
            return Err(QueueError::conflict(
                ConflictReason::AlreadyAssigned,
                format!("Request {} is already in progress", request_id),
            ));
        }

        match self.store.find_by_id(request_id).await? {
            Some(request) if request.status.is_terminal() => Err(QueueError::conflict(
                ConflictReason::AlreadyTerminal,
                format!("Request {} is already {}", request_id, request.status),
            )),
            _ => Err(QueueError::RequestNotFound(request_id)),
        }
    }
}
