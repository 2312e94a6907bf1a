mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use consultation_queue_cell::{
    ConflictReason, ConsultationStatus, ConsultationStore, InMemoryCacheStore, InMemoryConsultationStore,
    PresenceStatus, Priority, QueueError, Room, Specialty, SubmitConsultationRequest,
};
use shared_config::AppConfig;
use shared_models::user::UserRole;

use common::{
    admin, drain, harness, harness_with, harness_with_store, next_event, online_professional, patient, request_at,
    state_with_backends, today_at, FlakyStore,
};

fn submission(specialty: &str, priority: &str) -> SubmitConsultationRequest {
    SubmitConsultationRequest {
        specialty: specialty.to_string(),
        priority: priority.to_string(),
        description: "Dor de dente".to_string(),
    }
}

#[tokio::test]
async fn test_submit_returns_position_and_persists() {
    let h = harness().await;
    let first = patient();
    let second = patient();

    let p1 = h.state.dispatcher.submit(&first, submission("dentista", "media")).await.unwrap();
    let p2 = h.state.dispatcher.submit(&second, submission("dentista", "urgente")).await.unwrap();

    assert_eq!(p1.position, 1);
    assert_eq!(p2.position, 1);
    assert_eq!(p2.queue_length, 2);

    let stored = h.store.find_by_id(p1.request_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ConsultationStatus::Queued);

    let position = h.state.dispatcher.position_of(p1.request_id).await.unwrap();
    assert_eq!(position.position, 2);
    assert_eq!(position.ahead, 1);
}

#[tokio::test]
async fn test_submit_validation() {
    let h = harness().await;

    let result = h.state.dispatcher.submit(&patient(), submission("cardiologia", "media")).await;
    assert_matches!(result, Err(QueueError::ValidationError(_)));

    let result = h.state.dispatcher.submit(&patient(), submission("dentista", "altissima")).await;
    assert_matches!(result, Err(QueueError::ValidationError(_)));

    let result = h.state.dispatcher.submit(&admin(), submission("dentista", "media")).await;
    assert_matches!(result, Err(QueueError::ValidationError(_)));
}

#[tokio::test]
async fn test_duplicate_active_request_is_conflict() {
    let h = harness().await;
    let user = patient();
    let dentist = online_professional(&h.state, UserRole::Dentista).await;

    let position = h.state.dispatcher.submit(&user, submission("dentista", "media")).await.unwrap();
    let again = h.state.dispatcher.submit(&user, submission("dentista", "alta")).await;
    assert_matches!(
        again,
        Err(QueueError::Conflict { reason: ConflictReason::DuplicateActive, .. })
    );

    // still active while in progress
    h.state.dispatcher.assume(position.request_id, dentist.id).await.unwrap();
    let again = h.state.dispatcher.submit(&user, submission("dentista", "alta")).await;
    assert_matches!(
        again,
        Err(QueueError::Conflict { reason: ConflictReason::DuplicateActive, .. })
    );

    // other specialties are independent
    assert!(h.state.dispatcher.submit(&user, submission("psicologo", "media")).await.is_ok());
}

#[tokio::test]
async fn test_only_one_concurrent_assume_succeeds() {
    let h = harness().await;
    let position = h.state.dispatcher.submit(&patient(), submission("dentista", "alta")).await.unwrap();

    let mut dentists = Vec::new();
    for _ in 0..8 {
        dentists.push(online_professional(&h.state, UserRole::Dentista).await);
    }

    let attempts = dentists
        .iter()
        .map(|d| h.state.dispatcher.assume(position.request_id, d.id));
    let results = join_all(attempts).await;

    let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(
            result,
            Err(QueueError::Conflict { reason: ConflictReason::AlreadyAssigned, .. })
        );
    }

    let snapshot = h.state.dispatcher.snapshot(Specialty::Dentista).unwrap();
    assert_eq!(snapshot.queue_length(), 0);
    assert_eq!(snapshot.in_progress.len(), 1);
}

#[tokio::test]
async fn test_assume_requires_available_professional_of_specialty() {
    let h = harness().await;
    let position = h.state.dispatcher.submit(&patient(), submission("psicologo", "media")).await.unwrap();

    let dentist = online_professional(&h.state, UserRole::Dentista).await;
    let result = h.state.dispatcher.assume(position.request_id, dentist.id).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::NotAvailable, .. })
    );

    let psychologist = online_professional(&h.state, UserRole::Psicologo).await;
    h.state
        .presence
        .set_presence(psychologist.id, true, PresenceStatus::Away)
        .await
        .unwrap();
    let result = h.state.dispatcher.assume(position.request_id, psychologist.id).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::NotAvailable, .. })
    );

    let result = h.state.dispatcher.assume(position.request_id, Uuid::new_v4()).await;
    assert_matches!(result, Err(QueueError::ProfessionalNotFound(_)));
}

#[tokio::test]
async fn test_assume_marks_professional_busy_and_limits_load() {
    let h = harness().await;
    let first = h.state.dispatcher.submit(&patient(), submission("dentista", "media")).await.unwrap();
    let second = h.state.dispatcher.submit(&patient(), submission("dentista", "media")).await.unwrap();
    let dentist = online_professional(&h.state, UserRole::Dentista).await;

    let assigned = h.state.dispatcher.assume(first.request_id, dentist.id).await.unwrap();
    assert_eq!(assigned.status, ConsultationStatus::Assigned);
    assert_eq!(assigned.assigned_professional_id, Some(dentist.id));
    assert!(assigned.started_at.is_some());

    let presence = h.state.presence.get(dentist.id).await.unwrap();
    assert_eq!(presence.current_status, PresenceStatus::Busy);
    assert_eq!(h.state.presence.count(Specialty::Dentista).await, 0);

    let result = h.state.dispatcher.assume(second.request_id, dentist.id).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::NotAvailable, .. })
    );
}

#[tokio::test]
async fn test_finish_flow_and_second_finish_conflicts() {
    let h = harness().await;
    let user = patient();
    let position = h.state.dispatcher.submit(&user, submission("medico_clinico", "alta")).await.unwrap();
    let doctor = online_professional(&h.state, UserRole::Medico).await;
    let mut patient_room = h.state.broadcaster.subscribe(Room::User(user.id)).await;

    h.state.dispatcher.assume(position.request_id, doctor.id).await.unwrap();
    let finished = h
        .state
        .dispatcher
        .finish(position.request_id, doctor.id, Some("Retorno em 30 dias".to_string()))
        .await
        .unwrap();

    assert_eq!(finished.status, ConsultationStatus::Finished);
    assert_eq!(finished.notes.as_deref(), Some("Retorno em 30 dias"));
    assert!(finished.finished_at.is_some());

    let event = next_event(&mut patient_room, "consultation-finished").await;
    assert_eq!(event["data"]["request"]["id"], position.request_id.to_string());

    let presence = h.state.presence.get(doctor.id).await.unwrap();
    assert_eq!(presence.current_status, PresenceStatus::Available);

    let again = h.state.dispatcher.finish(position.request_id, doctor.id, None).await;
    assert_matches!(
        again,
        Err(QueueError::Conflict { reason: ConflictReason::AlreadyTerminal, .. })
    );
}

#[tokio::test]
async fn test_finish_requires_assignment_by_caller() {
    let h = harness().await;
    let position = h.state.dispatcher.submit(&patient(), submission("dentista", "media")).await.unwrap();
    let dentist = online_professional(&h.state, UserRole::Dentista).await;
    let other = online_professional(&h.state, UserRole::Dentista).await;

    let result = h.state.dispatcher.finish(position.request_id, dentist.id, None).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::NotAssigned, .. })
    );

    h.state.dispatcher.assume(position.request_id, dentist.id).await.unwrap();
    let result = h.state.dispatcher.finish(position.request_id, other.id, None).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::NotAssignee, .. })
    );

    let result = h.state.dispatcher.finish(Uuid::new_v4(), dentist.id, None).await;
    assert_matches!(result, Err(QueueError::RequestNotFound(_)));
}

#[tokio::test]
async fn test_cancel_permissions() {
    let h = harness().await;
    let owner = patient();
    let stranger = patient();
    let position = h.state.dispatcher.submit(&owner, submission("dentista", "baixa")).await.unwrap();

    let result = h.state.dispatcher.cancel(position.request_id, &stranger).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::NotOwner, .. })
    );

    let cancelled = h.state.dispatcher.cancel(position.request_id, &owner).await.unwrap();
    assert_eq!(cancelled.status, ConsultationStatus::Cancelled);
    assert_eq!(h.state.dispatcher.snapshot(Specialty::Dentista).unwrap().queue_length(), 0);

    let result = h.state.dispatcher.cancel(position.request_id, &owner).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::AlreadyTerminal, .. })
    );
}

#[tokio::test]
async fn test_assigned_request_only_cancelled_by_admin() {
    let h = harness().await;
    let owner = patient();
    let position = h.state.dispatcher.submit(&owner, submission("dentista", "media")).await.unwrap();
    let dentist = online_professional(&h.state, UserRole::Dentista).await;
    h.state.dispatcher.assume(position.request_id, dentist.id).await.unwrap();

    let result = h.state.dispatcher.cancel(position.request_id, &owner).await;
    assert_matches!(
        result,
        Err(QueueError::Conflict { reason: ConflictReason::NotCancellable, .. })
    );

    let cancelled = h.state.dispatcher.cancel(position.request_id, &admin()).await.unwrap();
    assert_eq!(cancelled.status, ConsultationStatus::Cancelled);

    let presence = h.state.presence.get(dentist.id).await.unwrap();
    assert_eq!(presence.current_status, PresenceStatus::Available);
    assert!(h.state.dispatcher.snapshot(Specialty::Dentista).unwrap().in_progress.is_empty());
}

#[tokio::test]
async fn test_admin_cancel_can_requeue_assigned_request() {
    let config = AppConfig {
        requeue_on_assigned_cancel: true,
        ..AppConfig::default()
    };
    let h = harness_with(config).await;
    let position = h.state.dispatcher.submit(&patient(), submission("dentista", "media")).await.unwrap();
    let dentist = online_professional(&h.state, UserRole::Dentista).await;
    h.state.dispatcher.assume(position.request_id, dentist.id).await.unwrap();

    let requeued = h.state.dispatcher.cancel(position.request_id, &admin()).await.unwrap();

    assert_eq!(requeued.status, ConsultationStatus::Queued);
    assert_eq!(requeued.assigned_professional_id, None);
    let snapshot = h.state.dispatcher.snapshot(Specialty::Dentista).unwrap();
    assert_eq!(snapshot.position_of(position.request_id), Some(1));
}

#[tokio::test]
async fn test_disconnect_releases_request_with_original_creation_time() {
    let h = harness().await;
    let user = patient();
    let dentist = online_professional(&h.state, UserRole::Dentista).await;

    let request = request_at(user.id, Specialty::Dentista, Priority::Media, today_at(9, 0));
    let created_at = request.created_at;
    h.state.dispatcher.enqueue(request.clone()).await.unwrap();
    h.state
        .dispatcher
        .enqueue(request_at(Uuid::new_v4(), Specialty::Dentista, Priority::Media, today_at(9, 10)))
        .await
        .unwrap();

    h.state.dispatcher.assume(request.id, dentist.id).await.unwrap();
    let before = h.state.dispatcher.snapshot(Specialty::Dentista).unwrap().queue_length();

    let mut patient_room = h.state.broadcaster.subscribe(Room::User(user.id)).await;
    let released = h.state.dispatcher.release_on_disconnect(dentist.id).await.unwrap();

    assert_eq!(released.len(), 1);
    let snapshot = h.state.dispatcher.snapshot(Specialty::Dentista).unwrap();
    assert_eq!(snapshot.queue_length(), before + 1);
    assert_eq!(snapshot.waiting[0].id, request.id);
    assert_eq!(snapshot.waiting[0].created_at, created_at);
    assert_eq!(snapshot.waiting[0].status, ConsultationStatus::Queued);

    let event = next_event(&mut patient_room, "consultation-released").await;
    assert_eq!(event["data"]["request"]["id"], request.id.to_string());
    assert!(drain(&mut patient_room)
        .iter()
        .all(|m| m["event"] != "consultation-finished"));

    let presence = h.state.presence.get(dentist.id).await.unwrap();
    assert!(!presence.is_online);
    assert_eq!(presence.current_status, PresenceStatus::Offline);

    let stored = h.store.find_by_id(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ConsultationStatus::Queued);
}

#[tokio::test]
async fn test_commit_broadcasts_queue_update_to_room() {
    let h = harness().await;
    let mut room = h.state.broadcaster.subscribe(Room::Specialty(Specialty::Psicologo)).await;

    h.state.dispatcher.submit(&patient(), submission("psicologo", "alta")).await.unwrap();

    let event = next_event(&mut room, "queue-updated").await;
    assert_eq!(event["data"]["queue_length"], 1);
    assert_eq!(event["data"]["waiting"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_write_failure_leaves_state_untouched() {
    let store = Arc::new(FlakyStore::new());
    let state = state_with_backends(AppConfig::default(), store.clone(), Arc::new(InMemoryCacheStore::new())).await;
    let dentist = online_professional(&state, UserRole::Dentista).await;

    let position = state
        .dispatcher
        .submit(&patient(), submission("dentista", "media"))
        .await
        .unwrap();

    store.fail_writes(true);

    let result = state.dispatcher.submit(&patient(), submission("dentista", "alta")).await;
    assert_matches!(result, Err(QueueError::StoreUnavailable(_)));

    let result = state.dispatcher.assume(position.request_id, dentist.id).await;
    assert_matches!(result, Err(QueueError::StoreUnavailable(_)));

    let snapshot = state.dispatcher.snapshot(Specialty::Dentista).unwrap();
    assert_eq!(snapshot.queue_length(), 1);
    assert!(snapshot.in_progress.is_empty());
    assert_eq!(
        state.presence.get(dentist.id).await.unwrap().current_status,
        PresenceStatus::Available
    );

    store.fail_writes(false);
    assert!(state.dispatcher.assume(position.request_id, dentist.id).await.is_ok());
}

#[tokio::test]
async fn test_engines_load_open_requests_from_store() {
    let store = Arc::new(InMemoryConsultationStore::new());
    let queued = request_at(Uuid::new_v4(), Specialty::Dentista, Priority::Media, today_at(8, 0));
    let mut assigned = request_at(Uuid::new_v4(), Specialty::Dentista, Priority::Alta, today_at(8, 5));
    let professional_id = Uuid::new_v4();
    assigned.status = ConsultationStatus::Assigned;
    assigned.started_at = Some(Utc::now());
    assigned.assigned_professional_id = Some(professional_id);
    store.save(&queued).await.unwrap();
    store.save(&assigned).await.unwrap();

    let h = harness_with_store(AppConfig::default(), store).await;

    let snapshot = h.state.dispatcher.snapshot(Specialty::Dentista).unwrap();
    assert_eq!(snapshot.waiting.len(), 1);
    assert_eq!(snapshot.waiting[0].id, queued.id);
    assert_eq!(snapshot.in_progress[0].id, assigned.id);

    let finished = h.state.dispatcher.finish(assigned.id, professional_id, None).await.unwrap();
    assert_eq!(finished.status, ConsultationStatus::Finished);
}

#[tokio::test]
async fn test_daily_statistics_follow_finish_and_cancel() {
    let h = harness().await;
    let dentist = online_professional(&h.state, UserRole::Dentista).await;

    let done = h.state.dispatcher.submit(&patient(), submission("dentista", "media")).await.unwrap();
    h.state.dispatcher.assume(done.request_id, dentist.id).await.unwrap();
    h.state.dispatcher.finish(done.request_id, dentist.id, None).await.unwrap();

    let owner = patient();
    let dropped = h.state.dispatcher.submit(&owner, submission("dentista", "media")).await.unwrap();
    h.state.dispatcher.cancel(dropped.request_id, &owner).await.unwrap();

    let counters = h
        .store
        .daily_statistics(Specialty::Dentista, Utc::now().date_naive())
        .await
        .unwrap();
    assert_eq!(counters.finished, 1);
    assert_eq!(counters.cancelled, 1);
}

#[tokio::test]
async fn test_snapshot_watchers_see_each_commit() {
    let h = harness().await;
    let mut watcher = h.state.dispatcher.engine(Specialty::MedicoClinico).unwrap().watch();
    assert_eq!(watcher.borrow_and_update().version, 0);

    h.state
        .dispatcher
        .submit(&patient(), submission("medico_clinico", "baixa"))
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), watcher.changed())
        .await
        .unwrap()
        .unwrap();
    let snapshot = watcher.borrow_and_update().clone();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.queue_length(), 1);
}

#[tokio::test]
async fn test_cancel_and_assume_race_has_one_winner() {
    for _ in 0..20 {
        let h = harness().await;
        let owner = patient();
        let dentist = online_professional(&h.state, UserRole::Dentista).await;
        let position = h.state.dispatcher.submit(&owner, submission("dentista", "media")).await.unwrap();

        let (cancelled, assumed) = tokio::join!(
            h.state.dispatcher.cancel(position.request_id, &owner),
            h.state.dispatcher.assume(position.request_id, dentist.id),
        );

        let snapshot = h.state.dispatcher.snapshot(Specialty::Dentista).unwrap();
        let presence = h.state.presence.get(dentist.id).await.unwrap();
        assert_eq!(snapshot.queue_length(), 0);

        match (cancelled, assumed) {
            (Ok(request), Err(e)) => {
                assert_eq!(request.status, ConsultationStatus::Cancelled);
                assert_matches!(e, QueueError::Conflict { reason: ConflictReason::AlreadyTerminal, .. });
                assert!(snapshot.in_progress.is_empty());
                assert_eq!(presence.current_status, PresenceStatus::Available);
            }
            (Err(e), Ok(request)) => {
                assert_eq!(request.status, ConsultationStatus::Assigned);
                assert_matches!(e, QueueError::Conflict { reason: ConflictReason::NotCancellable, .. });
                assert_eq!(snapshot.in_progress.len(), 1);
                assert_eq!(presence.current_status, PresenceStatus::Busy);
            }
            (cancelled, assumed) => panic!("expected exactly one winner, got {:?} and {:?}", cancelled, assumed),
        }
    }
}
