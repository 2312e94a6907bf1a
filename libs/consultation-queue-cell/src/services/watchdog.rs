use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::WatchdogConfig;
use crate::services::broadcaster::RealtimeBroadcaster;
use crate::services::dispatch::ConsultationDispatcher;
use crate::services::presence::PresenceTracker;

/// Marks professionals offline when their heartbeats stop and hands their
/// in-progress consultations back to the queue.
pub struct HeartbeatWatchdog {
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<ConsultationDispatcher>,
    broadcaster: Arc<RealtimeBroadcaster>,
    config: WatchdogConfig,
    is_running: Arc<RwLock<bool>>,
}

impl HeartbeatWatchdog {
    pub fn new(
        presence: Arc<PresenceTracker>,
        dispatcher: Arc<ConsultationDispatcher>,
        broadcaster: Arc<RealtimeBroadcaster>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            presence,
            dispatcher,
            broadcaster,
            config,
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Release everyone whose last heartbeat is older than the window, plus
    /// anyone still holding an assignment while offline or unknown.
    /// Returns the professionals that were released.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let window = chrono::Duration::seconds(self.config.heartbeat_timeout_seconds);
        let mut stale = self.presence.stale_professionals(now, window).await;

        for professional_id in self.dispatcher.assigned_professionals() {
            let orphaned = match self.presence.get(professional_id).await {
                Some(presence) => !presence.is_online,
                None => true,
            };
            if orphaned && !stale.contains(&professional_id) {
                warn!("Professional {} holds consultations while offline", professional_id);
                stale.push(professional_id);
            }
        }

        let mut released = Vec::with_capacity(stale.len());

        for professional_id in stale {
            match self.dispatcher.release_on_disconnect(professional_id).await {
                Ok(requests) => {
                    info!(
                        "Professional {} missed heartbeats; released {} consultation(s)",
                        professional_id,
                        requests.len()
                    );
                    released.push(professional_id);
                }
                Err(e) => error!("Failed to release professional {}: {}", professional_id, e),
            }
        }

        released
    }

    pub async fn sweep(&self) -> Vec<Uuid> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn run(&self) {
        *self.is_running.write().await = true;
        let mut check_interval = interval(Duration::from_secs(self.config.check_interval_seconds));
        info!(
            "Heartbeat watchdog started (window {}s, every {}s)",
            self.config.heartbeat_timeout_seconds, self.config.check_interval_seconds
        );

        loop {
            check_interval.tick().await;

            if !*self.is_running.read().await {
                debug!("Heartbeat watchdog stopping due to shutdown");
                break;
            }

            self.sweep().await;

            let pruned = self.broadcaster.prune_empty_rooms().await;
            if pruned > 0 {
                debug!("Pruned {} empty realtime rooms", pruned);
            }
        }

        debug!("Heartbeat watchdog ended");
    }

    pub async fn stop(&self) {
        *self.is_running.write().await = false;
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}
