use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConflictReason, QueueError};
use crate::models::{ConsultationRequest, ConsultationStatus, Priority, RequeuePosition, Specialty};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    Reentry,
    Regular,
}

// Field order is the queue order: priority descending, then lane, then time,
// then insertion sequence so keys stay unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    lane: Lane,
    sort_at: DateTime<Utc>,
    seq: u64,
}

/// Ordered waiting list for a single specialty.
#[derive(Debug)]
pub struct SpecialtyQueue {
    specialty: Specialty,
    entries: BTreeMap<QueueKey, ConsultationRequest>,
    index: HashMap<Uuid, QueueKey>,
    patients: HashMap<Uuid, Uuid>,
    next_seq: u64,
}

impl SpecialtyQueue {
    pub fn new(specialty: Specialty) -> Self {
        Self {
            specialty,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            patients: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Insert a freshly submitted request, returning its 1-based position.
    pub fn enqueue(&mut self, request: ConsultationRequest) -> Result<usize, QueueError> {
        let sort_at = request.created_at;
        self.insert(request, Lane::Regular, sort_at)
    }

    /// Put a request pulled back from a professional into the queue again.
    pub fn requeue(
        &mut self,
        request: ConsultationRequest,
        placement: RequeuePosition,
        now: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let (lane, sort_at) = match placement {
            RequeuePosition::Front => (Lane::Reentry, request.created_at),
            RequeuePosition::Original => (Lane::Regular, request.created_at),
            RequeuePosition::Back => (Lane::Regular, now),
        };
        self.insert(request, lane, sort_at)
    }

    fn insert(
        &mut self,
        request: ConsultationRequest,
        lane: Lane,
        sort_at: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        if request.specialty != self.specialty {
            return Err(QueueError::ValidationError(format!(
                "Request {} belongs to {} not {}",
                request.id, request.specialty, self.specialty
            )));
        }

        if request.status != ConsultationStatus::Queued {
            return Err(QueueError::ValidationError(format!(
                "Only queued requests can be enqueued, {} is {}",
                request.id, request.status
            )));
        }

        if self.index.contains_key(&request.id) {
            return Err(QueueError::conflict(
                ConflictReason::DuplicateActive,
                format!("Request {} is already queued", request.id),
            ));
        }

        if let Some(existing) = self.patients.get(&request.patient_id) {
            return Err(QueueError::conflict(
                ConflictReason::DuplicateActive,
                format!(
                    "Patient {} already has request {} waiting for {}",
                    request.patient_id, existing, self.specialty
                ),
            ));
        }

        let key = QueueKey {
            priority: Reverse(request.priority),
            lane,
            sort_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.index.insert(request.id, key);
        self.patients.insert(request.patient_id, request.id);
        self.entries.insert(key, request);

        let position = self.entries.range(..key).count() + 1;
        debug!("Queued request at position {} of {} in {}", position, self.entries.len(), self.specialty);
        Ok(position)
    }

    pub fn peek_head(&self) -> Option<&ConsultationRequest> {
        self.entries.values().next()
    }

    pub fn get(&self, request_id: &Uuid) -> Option<&ConsultationRequest> {
        self.index.get(request_id).and_then(|key| self.entries.get(key))
    }

    pub fn remove(&mut self, request_id: &Uuid) -> Option<ConsultationRequest> {
        let key = self.index.remove(request_id)?;
        let request = self.entries.remove(&key)?;
        self.patients.remove(&request.patient_id);
        Some(request)
    }

    pub fn position_of(&self, request_id: &Uuid) -> Option<usize> {
        let key = self.index.get(request_id)?;
        Some(self.entries.range(..*key).count() + 1)
    }

    pub fn has_patient(&self, patient_id: &Uuid) -> bool {
        self.patients.contains_key(patient_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsultationRequest> {
        self.entries.values()
    }
}
