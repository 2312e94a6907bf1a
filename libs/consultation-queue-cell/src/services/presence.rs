use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use shared_models::user::{UserRecord, UserRole};

use crate::error::QueueError;
use crate::models::{PresenceStatus, ProfessionalPresence, Specialty};

/// The single specialty <-> role table.
pub fn role_for_specialty(specialty: Specialty) -> UserRole {
    match specialty {
        Specialty::Dentista => UserRole::Dentista,
        Specialty::Psicologo => UserRole::Psicologo,
        Specialty::MedicoClinico => UserRole::Medico,
    }
}

pub fn specialty_for_role(role: UserRole) -> Option<Specialty> {
    match role {
        UserRole::Dentista => Some(Specialty::Dentista),
        UserRole::Psicologo => Some(Specialty::Psicologo),
        UserRole::Medico => Some(Specialty::MedicoClinico),
        UserRole::Patient | UserRole::Admin => None,
    }
}

pub struct PresenceTracker {
    professionals: Arc<RwLock<HashMap<Uuid, ProfessionalPresence>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            professionals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Make a professional known to the tracker. New entries start offline.
    pub async fn register(&self, professional_id: Uuid, role: UserRole, is_active: bool) -> Result<(), QueueError> {
        if specialty_for_role(role).is_none() {
            return Err(QueueError::ValidationError(format!(
                "Role {} does not serve any specialty",
                role
            )));
        }

        let mut professionals = self.professionals.write().await;
        professionals
            .entry(professional_id)
            .and_modify(|p| {
                p.role = role;
                p.is_active = is_active;
            })
            .or_insert_with(|| ProfessionalPresence {
                professional_id,
                role,
                is_active,
                is_online: false,
                current_status: PresenceStatus::Offline,
                last_activity: Utc::now(),
            });

        Ok(())
    }

    /// Apply user records from the presence source; non-professional records
    /// are skipped. Returns how many professionals were applied.
    pub async fn sync_from_source(&self, records: &[UserRecord]) -> usize {
        let now = Utc::now();
        let mut professionals = self.professionals.write().await;
        let mut applied = 0;

        for record in records.iter().filter(|r| specialty_for_role(r.role).is_some()) {
            let entry = professionals.entry(record.id).or_insert_with(|| ProfessionalPresence {
                professional_id: record.id,
                role: record.role,
                is_active: record.is_active,
                is_online: false,
                current_status: PresenceStatus::Offline,
                last_activity: now,
            });

            entry.role = record.role;
            entry.is_active = record.is_active;

            if record.is_online && !entry.is_online {
                entry.is_online = true;
                entry.current_status = PresenceStatus::Available;
                entry.last_activity = now;
            } else if !record.is_online {
                entry.is_online = false;
                entry.current_status = PresenceStatus::Offline;
            }

            applied += 1;
        }

        debug!("Synchronised {} professionals from presence source", applied);
        applied
    }

    pub async fn set_presence(
        &self,
        professional_id: Uuid,
        is_online: bool,
        status: PresenceStatus,
    ) -> Result<ProfessionalPresence, QueueError> {
        if is_online && status == PresenceStatus::Offline {
            return Err(QueueError::ValidationError(
                "An online professional cannot report offline status".to_string(),
            ));
        }

        let mut professionals = self.professionals.write().await;
        let presence = professionals
            .get_mut(&professional_id)
            .ok_or(QueueError::ProfessionalNotFound(professional_id))?;

        presence.is_online = is_online;
        presence.current_status = if is_online { status } else { PresenceStatus::Offline };
        presence.last_activity = Utc::now();

        debug!(
            "Presence of {} set to online={} status={:?}",
            professional_id, presence.is_online, presence.current_status
        );
        Ok(presence.clone())
    }

    pub async fn heartbeat(&self, professional_id: Uuid) -> Result<ProfessionalPresence, QueueError> {
        let mut professionals = self.professionals.write().await;
        let presence = professionals
            .get_mut(&professional_id)
            .ok_or(QueueError::ProfessionalNotFound(professional_id))?;

        presence.last_activity = Utc::now();
        if !presence.is_online || presence.current_status == PresenceStatus::Offline {
            info!("Professional {} is back online", professional_id);
            presence.is_online = true;
            presence.current_status = PresenceStatus::Available;
        }

        Ok(presence.clone())
    }

    /// Mark a professional found holding a stored assignment as busy.
    /// Unknown professionals are registered online so the heartbeat window
    /// starts now; known offline ones are left for the watchdog to release.
    pub(crate) async fn restore_assignment(&self, professional_id: Uuid, role: UserRole, now: DateTime<Utc>) {
        let mut professionals = self.professionals.write().await;
        let presence = professionals
            .entry(professional_id)
            .or_insert_with(|| ProfessionalPresence {
                professional_id,
                role,
                is_active: true,
                is_online: true,
                current_status: PresenceStatus::Busy,
                last_activity: now,
            });

        if presence.is_online {
            presence.current_status = PresenceStatus::Busy;
        }
    }

    /// Status change driven by the dispatcher (busy on assume, available on
    /// release). Offline professionals stay offline.
    pub(crate) async fn set_status(&self, professional_id: Uuid, status: PresenceStatus) {
        let mut professionals = self.professionals.write().await;
        if let Some(presence) = professionals.get_mut(&professional_id) {
            if presence.is_online {
                presence.current_status = status;
            }
        }
    }

    pub async fn get(&self, professional_id: Uuid) -> Option<ProfessionalPresence> {
        let professionals = self.professionals.read().await;
        professionals.get(&professional_id).cloned()
    }

    /// Professionals of the specialty's role that are online, active and available.
    pub async fn count(&self, specialty: Specialty) -> usize {
        let role = role_for_specialty(specialty);
        let professionals = self.professionals.read().await;
        professionals
            .values()
            .filter(|p| p.role == role && p.is_available())
            .count()
    }

    /// Online professionals whose last activity is older than `window`.
    pub async fn stale_professionals(&self, now: DateTime<Utc>, window: Duration) -> Vec<Uuid> {
        let professionals = self.professionals.read().await;
        professionals
            .values()
            .filter(|p| p.is_online && now - p.last_activity > window)
            .map(|p| p.professional_id)
            .collect()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
