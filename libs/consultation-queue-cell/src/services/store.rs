use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::user::UserRecord;

use crate::error::QueueError;
use crate::models::{ConsultationRequest, ConsultationStatus, DailyCounters, FinishedTiming, Specialty};

const REQUESTS_TABLE: &str = "consultation_requests";
const DAILY_STATS_TABLE: &str = "daily_queue_statistics";
const USERS_TABLE: &str = "users";

/// Read/write contract the dispatcher and estimator need from persistence.
#[async_trait]
pub trait ConsultationStore: Send + Sync {
    async fn find_queued(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError>;

    async fn find_assigned(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError>;

    async fn find_by_id(&self, request_id: Uuid) -> Result<Option<ConsultationRequest>, QueueError>;

    async fn count_by_status(&self, specialty: Specialty, status: ConsultationStatus) -> Result<u64, QueueError>;

    async fn find_finished_since(
        &self,
        specialty: Specialty,
        since: DateTime<Utc>,
    ) -> Result<Vec<FinishedTiming>, QueueError>;

    /// Insert or replace the request row.
    async fn save(&self, request: &ConsultationRequest) -> Result<(), QueueError>;

    async fn upsert_daily_statistics(
        &self,
        specialty: Specialty,
        date: NaiveDate,
        counters: &DailyCounters,
    ) -> Result<(), QueueError>;
}

/// Source of professional user records used to seed presence.
#[async_trait]
pub trait PresenceSource: Send + Sync {
    async fn fetch_professionals(&self) -> Result<Vec<UserRecord>, QueueError>;
}

fn store_error(operation: &str, e: anyhow::Error) -> QueueError {
    error!("Consultation store {} failed: {}", operation, e);
    QueueError::StoreUnavailable(format!("{}: {}", operation, e))
}

pub struct SupabaseConsultationStore {
    client: SupabaseClient,
}

impl SupabaseConsultationStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: SupabaseClient::new(config),
        }
    }

    async fn find_by_status(
        &self,
        specialty: Specialty,
        status: ConsultationStatus,
    ) -> Result<Vec<ConsultationRequest>, QueueError> {
        let query = format!(
            "specialty=eq.{}&status=eq.{}&order=created_at.asc",
            specialty, status
        );
        self.client
            .select(REQUESTS_TABLE, &query)
            .await
            .map_err(|e| store_error("find_by_status", e))
    }
}

#[async_trait]
impl ConsultationStore for SupabaseConsultationStore {
    async fn find_queued(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError> {
        self.find_by_status(specialty, ConsultationStatus::Queued).await
    }

    async fn find_assigned(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError> {
        self.find_by_status(specialty, ConsultationStatus::Assigned).await
    }

    async fn find_by_id(&self, request_id: Uuid) -> Result<Option<ConsultationRequest>, QueueError> {
        let query = format!("id=eq.{}&limit=1", request_id);
        let rows: Vec<ConsultationRequest> = self
            .client
            .select(REQUESTS_TABLE, &query)
            .await
            .map_err(|e| store_error("find_by_id", e))?;
        Ok(rows.into_iter().next())
    }

    async fn count_by_status(&self, specialty: Specialty, status: ConsultationStatus) -> Result<u64, QueueError> {
        let query = format!("select=id&specialty=eq.{}&status=eq.{}", specialty, status);
        self.client
            .count(REQUESTS_TABLE, &query)
            .await
            .map_err(|e| store_error("count_by_status", e))
    }

    async fn find_finished_since(
        &self,
        specialty: Specialty,
        since: DateTime<Utc>,
    ) -> Result<Vec<FinishedTiming>, QueueError> {
        let query = format!(
            "select=created_at,started_at,finished_at&specialty=eq.{}&status=eq.finished&finished_at=gte.{}",
            specialty,
            since.format("%Y-%m-%dT%H:%M:%SZ")
        );
        self.client
            .select(REQUESTS_TABLE, &query)
            .await
            .map_err(|e| store_error("find_finished_since", e))
    }

    async fn save(&self, request: &ConsultationRequest) -> Result<(), QueueError> {
        let body = serde_json::to_value(request)?;
        self.client
            .upsert(REQUESTS_TABLE, "id", body)
            .await
            .map_err(|e| store_error("save", e))?;
        debug!("Persisted request {} as {}", request.id, request.status);
        Ok(())
    }

    async fn upsert_daily_statistics(
        &self,
        specialty: Specialty,
        date: NaiveDate,
        counters: &DailyCounters,
    ) -> Result<(), QueueError> {
        let body = json!({
            "specialty": specialty,
            "date": date,
            "finished": counters.finished,
            "cancelled": counters.cancelled,
            "total_wait_minutes": counters.total_wait_minutes,
            "total_duration_minutes": counters.total_duration_minutes,
            "updated_at": Utc::now(),
        });
        self.client
            .upsert(DAILY_STATS_TABLE, "specialty,date", body)
            .await
            .map_err(|e| store_error("upsert_daily_statistics", e))
    }
}

#[async_trait]
impl PresenceSource for SupabaseConsultationStore {
    async fn fetch_professionals(&self) -> Result<Vec<UserRecord>, QueueError> {
        let query = "select=id,role,is_active,is_online&role=in.(dentista,psicologo,medico)";
        self.client
            .select(USERS_TABLE, query)
            .await
            .map_err(|e| store_error("fetch_professionals", e))
    }
}

/// Store kept entirely in process memory.
pub struct InMemoryConsultationStore {
    requests: Arc<RwLock<HashMap<Uuid, ConsultationRequest>>>,
    daily: Arc<RwLock<HashMap<(Specialty, NaiveDate), DailyCounters>>>,
    users: Arc<RwLock<Vec<UserRecord>>>,
}

impl InMemoryConsultationStore {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            daily: Arc::new(RwLock::new(HashMap::new())),
            users: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn add_user(&self, record: UserRecord) {
        let mut users = self.users.write().await;
        users.retain(|u| u.id != record.id);
        users.push(record);
    }

    pub async fn daily_statistics(&self, specialty: Specialty, date: NaiveDate) -> Option<DailyCounters> {
        let daily = self.daily.read().await;
        daily.get(&(specialty, date)).cloned()
    }

    async fn find_by_status(&self, specialty: Specialty, status: ConsultationStatus) -> Vec<ConsultationRequest> {
        let requests = self.requests.read().await;
        let mut found: Vec<ConsultationRequest> = requests
            .values()
            .filter(|r| r.specialty == specialty && r.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        found
    }
}

impl Default for InMemoryConsultationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsultationStore for InMemoryConsultationStore {
    async fn find_queued(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError> {
        Ok(self.find_by_status(specialty, ConsultationStatus::Queued).await)
    }

    async fn find_assigned(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError> {
        Ok(self.find_by_status(specialty, ConsultationStatus::Assigned).await)
    }

    async fn find_by_id(&self, request_id: Uuid) -> Result<Option<ConsultationRequest>, QueueError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&request_id).cloned())
    }

    async fn count_by_status(&self, specialty: Specialty, status: ConsultationStatus) -> Result<u64, QueueError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.specialty == specialty && r.status == status)
            .count() as u64)
    }

    async fn find_finished_since(
        &self,
        specialty: Specialty,
        since: DateTime<Utc>,
    ) -> Result<Vec<FinishedTiming>, QueueError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.specialty == specialty && r.status == ConsultationStatus::Finished)
            .filter_map(|r| match (r.started_at, r.finished_at) {
                (Some(started_at), Some(finished_at)) if finished_at >= since => Some(FinishedTiming {
                    created_at: r.created_at,
                    started_at,
                    finished_at,
                }),
                _ => None,
            })
            .collect())
    }

    async fn save(&self, request: &ConsultationRequest) -> Result<(), QueueError> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn upsert_daily_statistics(
        &self,
        specialty: Specialty,
        date: NaiveDate,
        counters: &DailyCounters,
    ) -> Result<(), QueueError> {
        let mut daily = self.daily.write().await;
        daily.insert((specialty, date), counters.clone());
        Ok(())
    }
}

#[async_trait]
impl PresenceSource for InMemoryConsultationStore {
    async fn fetch_professionals(&self) -> Result<Vec<UserRecord>, QueueError> {
        let users = self.users.read().await;
        Ok(users.iter().filter(|u| u.role.is_professional()).cloned().collect())
    }
}
