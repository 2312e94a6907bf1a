use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialty {
    Dentista,
    Psicologo,
    MedicoClinico,
}

impl Specialty {
    pub const ALL: [Specialty; 3] = [Specialty::Dentista, Specialty::Psicologo, Specialty::MedicoClinico];

    pub fn as_str(&self) -> &'static str {
        match self {
            Specialty::Dentista => "dentista",
            Specialty::Psicologo => "psicologo",
            Specialty::MedicoClinico => "medico_clinico",
        }
    }
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Specialty {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dentista" => Ok(Specialty::Dentista),
            "psicologo" => Ok(Specialty::Psicologo),
            "medico_clinico" => Ok(Specialty::MedicoClinico),
            other => Err(QueueError::ValidationError(format!("Unknown specialty: {}", other))),
        }
    }
}

/// Patient-declared urgency. Variant order is the queue order (lowest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Baixa,
    Media,
    Alta,
    Urgente,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Baixa => "baixa",
            Priority::Media => "media",
            Priority::Alta => "alta",
            Priority::Urgente => "urgente",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "baixa" => Ok(Priority::Baixa),
            "media" => Ok(Priority::Media),
            "alta" => Ok(Priority::Alta),
            "urgente" => Ok(Priority::Urgente),
            other => Err(QueueError::ValidationError(format!("Unknown priority: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsultationStatus {
    Queued,
    Assigned,
    Finished,
    Cancelled,
}

impl ConsultationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationStatus::Queued => "queued",
            ConsultationStatus::Assigned => "assigned",
            ConsultationStatus::Finished => "finished",
            ConsultationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsultationStatus::Finished | ConsultationStatus::Cancelled)
    }

    pub fn can_transition_to(&self, target: &ConsultationStatus) -> bool {
        use ConsultationStatus::*;
        match (self, target) {
            (Queued, Assigned) => true,
            (Queued, Cancelled) => true,
            (Assigned, Finished) => true,
            (Assigned, Cancelled) => true,
            // disconnect release or re-queue on admin cancel
            (Assigned, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConsultationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultationRequest {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub specialty: Specialty,
    pub priority: Priority,
    pub description: String,
    pub status: ConsultationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub assigned_professional_id: Option<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ConsultationRequest {
    pub fn new(patient_id: Uuid, specialty: Specialty, priority: Priority, description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            specialty,
            priority,
            description,
            status: ConsultationStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            assigned_professional_id: None,
            notes: None,
        }
    }

    pub fn is_assigned_to(&self, professional_id: Uuid) -> bool {
        self.status == ConsultationStatus::Assigned && self.assigned_professional_id == Some(professional_id)
    }
}

/// Body of a patient submission. Kept as strings so malformed values surface
/// as validation errors instead of extractor rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConsultationRequest {
    pub specialty: String,
    pub priority: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinishConsultationRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePosition {
    pub request_id: Uuid,
    pub specialty: Specialty,
    /// 1-based rank in the priority-then-arrival order.
    pub position: usize,
    pub ahead: usize,
    pub queue_length: usize,
}

/// Immutable view of one specialty queue, republished after every commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub specialty: Specialty,
    pub waiting: Vec<ConsultationRequest>,
    pub in_progress: Vec<ConsultationRequest>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn empty(specialty: Specialty) -> Self {
        Self {
            specialty,
            waiting: Vec::new(),
            in_progress: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn queue_length(&self) -> usize {
        self.waiting.len()
    }

    pub fn position_of(&self, request_id: Uuid) -> Option<usize> {
        self.waiting.iter().position(|r| r.id == request_id).map(|idx| idx + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Available,
    Busy,
    Away,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfessionalPresence {
    pub professional_id: Uuid,
    pub role: shared_models::user::UserRole,
    pub is_active: bool,
    pub is_online: bool,
    pub current_status: PresenceStatus,
    pub last_activity: DateTime<Utc>,
}

impl ProfessionalPresence {
    pub fn is_available(&self) -> bool {
        self.is_online && self.is_active && self.current_status == PresenceStatus::Available
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPresenceRequest {
    pub is_online: bool,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTimeSnapshot {
    pub specialty: Specialty,
    /// Minutes.
    pub estimated_wait_time: u32,
    pub queue_length: usize,
    pub online_professionals: usize,
    pub confidence: Confidence,
    pub computed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    /// Queue snapshot version the estimate was computed from.
    #[serde(default)]
    pub queue_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinishedTiming {
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalStats {
    pub specialty: Specialty,
    pub days: i64,
    pub sample_count: usize,
    pub average_wait_time: Option<u32>,
    pub average_duration: Option<u32>,
    pub hourly_distribution: Vec<u32>,
    pub peak_hours: Vec<u32>,
    pub off_peak_hours: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestWaitEstimate {
    pub position: QueuePosition,
    pub estimated_wait_time: u32,
    pub online_professionals: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub specialty: Specialty,
    pub queued: usize,
    pub in_progress: usize,
    pub finished_total: u64,
    pub cancelled_total: u64,
    pub online_professionals: usize,
    pub average_wait_time: Option<u32>,
    pub average_duration: Option<u32>,
    pub estimated_wait_time: u32,
    pub confidence: Confidence,
}

/// Per-specialty counters upserted once per day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyCounters {
    pub finished: u32,
    pub cancelled: u32,
    pub total_wait_minutes: i64,
    pub total_duration_minutes: i64,
}

/// Where a request re-enters its queue after being pulled back from a
/// professional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequeuePosition {
    /// Ahead of everything else in its priority bracket.
    Front,
    /// Wherever its original creation time places it.
    Original,
    /// Behind everything currently in its priority bracket.
    Back,
}

impl FromStr for RequeuePosition {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "front" => Ok(RequeuePosition::Front),
            "original" => Ok(RequeuePosition::Original),
            "back" => Ok(RequeuePosition::Back),
            other => Err(QueueError::ValidationError(format!("Unknown requeue position: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrent_assignments: usize,
    pub requeue_on_assigned_cancel: bool,
    pub disconnect_requeue: RequeuePosition,
    pub command_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_assignments: 1,
            requeue_on_assigned_cancel: false,
            disconnect_requeue: RequeuePosition::Front,
            command_buffer: 256,
        }
    }
}

impl DispatchConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let disconnect_requeue = config
            .disconnect_requeue_position
            .parse()
            .unwrap_or_else(|e| {
                tracing::warn!("{}, falling back to front of bracket", e);
                RequeuePosition::Front
            });

        Self {
            max_concurrent_assignments: config.max_concurrent_assignments.max(1),
            requeue_on_assigned_cancel: config.requeue_on_assigned_cancel,
            disconnect_requeue,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub cache_ttl_seconds: u64,
    pub history_days: i64,
    pub default_duration_minutes: u32,
    pub confident_sample_threshold: usize,
    pub peak_multiplier: f64,
    pub off_peak_multiplier: f64,
    pub utc_offset_hours: i32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            history_days: 7,
            default_duration_minutes: 30,
            confident_sample_threshold: 10,
            peak_multiplier: 1.3,
            off_peak_multiplier: 0.7,
            utc_offset_hours: 0,
        }
    }
}

impl EstimatorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            cache_ttl_seconds: config.wait_time_cache_ttl_seconds,
            history_days: config.wait_time_history_days.max(1),
            default_duration_minutes: config.default_consultation_minutes,
            utc_offset_hours: config.estimator_utc_offset_hours,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub heartbeat_timeout_seconds: i64,
    pub check_interval_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            check_interval_seconds: 15,
        }
    }
}

impl WatchdogConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            heartbeat_timeout_seconds: config.heartbeat_timeout_seconds,
            check_interval_seconds: config.heartbeat_check_interval_seconds.max(1),
        }
    }
}
