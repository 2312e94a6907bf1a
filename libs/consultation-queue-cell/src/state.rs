use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::user::User;

use crate::error::QueueError;
use crate::models::{DispatchConfig, EstimatorConfig, PresenceStatus, ProfessionalPresence, WatchdogConfig};
use crate::services::{
    CacheStore, ConsultationDispatcher, ConsultationStore, DispatchDeps, HeartbeatWatchdog, PresenceSource,
    PresenceTracker, RealtimeBroadcaster, WaitTimeEstimator, specialty_for_role,
};

/// Everything the HTTP handlers and realtime sessions share.
pub struct ConsultationQueueState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn ConsultationStore>,
    pub cache: Arc<dyn CacheStore>,
    pub presence: Arc<PresenceTracker>,
    pub broadcaster: Arc<RealtimeBroadcaster>,
    pub dispatcher: Arc<ConsultationDispatcher>,
    pub estimator: Arc<WaitTimeEstimator>,
}

impl ConsultationQueueState {
    /// Start one dispatch engine per specialty and wire the services around
    /// them.
    pub async fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ConsultationStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Arc<Self>, QueueError> {
        let presence = Arc::new(PresenceTracker::new());
        let broadcaster = Arc::new(RealtimeBroadcaster::new(config.realtime_room_capacity));

        let deps = DispatchDeps {
            store: Arc::clone(&store),
            presence: Arc::clone(&presence),
            broadcaster: Arc::clone(&broadcaster),
            cache: Arc::clone(&cache),
        };
        let dispatcher = Arc::new(ConsultationDispatcher::start(DispatchConfig::from_app_config(&config), deps).await?);

        let estimator = Arc::new(WaitTimeEstimator::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&presence),
            Arc::clone(&dispatcher),
            EstimatorConfig::from_app_config(&config),
        ));

        info!("Consultation queue state initialized");

        Ok(Arc::new(Self {
            config,
            store,
            cache,
            presence,
            broadcaster,
            dispatcher,
            estimator,
        }))
    }

    /// Seed presence from the user source. A failing source leaves the
    /// tracker empty; professionals register on their first heartbeat.
    pub async fn sync_presence(&self, source: &dyn PresenceSource) -> usize {
        match source.fetch_professionals().await {
            Ok(records) => self.presence.sync_from_source(&records).await,
            Err(e) => {
                warn!("Presence source unavailable: {}", e);
                0
            }
        }
    }

    /// Record activity from a professional, registering unknown ones.
    pub async fn professional_seen(&self, user: &User) -> Result<ProfessionalPresence, QueueError> {
        let previous = self.ensure_registered(user).await?;
        self.presence.heartbeat(user.id).await?;
        let presence = self.settle_assigned(user.id).await?;

        if !previous.is_available() && presence.is_available() {
            self.invalidate_for(user).await;
        }
        Ok(presence)
    }

    /// Explicit presence change. Going offline hands any in-progress
    /// consultations back to the queue.
    pub async fn update_presence(
        &self,
        user: &User,
        is_online: bool,
        status: PresenceStatus,
    ) -> Result<ProfessionalPresence, QueueError> {
        self.ensure_registered(user).await?;

        if !is_online {
            self.dispatcher.release_on_disconnect(user.id).await?;
            return self
                .presence
                .get(user.id)
                .await
                .ok_or(QueueError::ProfessionalNotFound(user.id));
        }

        self.presence.set_presence(user.id, true, status).await?;
        let presence = self.settle_assigned(user.id).await?;
        self.invalidate_for(user).await;
        Ok(presence)
    }

    /// An online professional with an in-progress consultation stays busy.
    async fn settle_assigned(&self, professional_id: Uuid) -> Result<ProfessionalPresence, QueueError> {
        if self.dispatcher.holds_assignment(professional_id) {
            self.presence.set_status(professional_id, PresenceStatus::Busy).await;
        }
        self.presence
            .get(professional_id)
            .await
            .ok_or(QueueError::ProfessionalNotFound(professional_id))
    }

    async fn ensure_registered(&self, user: &User) -> Result<ProfessionalPresence, QueueError> {
        if let Some(presence) = self.presence.get(user.id).await {
            return Ok(presence);
        }

        self.presence.register(user.id, user.role, true).await?;
        info!("Registered professional {} on first contact", user.id);
        self.presence
            .get(user.id)
            .await
            .ok_or(QueueError::ProfessionalNotFound(user.id))
    }

    async fn invalidate_for(&self, user: &User) {
        if let Some(specialty) = specialty_for_role(user.role) {
            self.estimator.invalidate(specialty).await;
        }
    }

    pub fn watchdog(&self) -> HeartbeatWatchdog {
        HeartbeatWatchdog::new(
            Arc::clone(&self.presence),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.broadcaster),
            WatchdogConfig::from_app_config(&self.config),
        )
    }
}
