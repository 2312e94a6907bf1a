use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::{
    matchers::{header, header_exists, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use consultation_queue_cell::{
    ConsultationRequest, ConsultationStatus, ConsultationStore, PresenceSource, Priority, QueueError, Specialty,
    SupabaseConsultationStore,
};
use shared_models::user::UserRole;
use shared_utils::test_utils::TestConfig;

async fn store_for(mock_server: &MockServer) -> SupabaseConsultationStore {
    let mut config = TestConfig::default().to_app_config();
    config.supabase_url = mock_server.uri();
    SupabaseConsultationStore::new(&config)
}

#[tokio::test]
async fn test_find_queued_filters_by_specialty_and_status() {
    let mock_server = MockServer::start().await;
    let request = ConsultationRequest::new(
        Uuid::new_v4(),
        Specialty::Dentista,
        Priority::Alta,
        "Canal".to_string(),
    );

    Mock::given(method("GET"))
        .and(path("/rest/v1/consultation_requests"))
        .and(query_param("specialty", "eq.dentista"))
        .and(query_param("status", "eq.queued"))
        .and(header("apikey", "test-anon-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([request])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let rows = store.find_queued(Specialty::Dentista).await.unwrap();

    assert_eq!(rows, vec![request]);
}

#[tokio::test]
async fn test_save_upserts_on_id() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/consultation_requests"))
        .and(query_param("on_conflict", "id"))
        .and(header_exists("Prefer"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let request = ConsultationRequest::new(
        Uuid::new_v4(),
        Specialty::Psicologo,
        Priority::Media,
        String::new(),
    );

    store.save(&request).await.unwrap();
}

#[tokio::test]
async fn test_server_error_maps_to_store_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/consultation_requests"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database is starting up"))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/consultation_requests"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let request = ConsultationRequest::new(
        Uuid::new_v4(),
        Specialty::MedicoClinico,
        Priority::Baixa,
        String::new(),
    );

    assert_matches!(store.save(&request).await, Err(QueueError::StoreUnavailable(_)));
    assert_matches!(
        store.find_by_id(request.id).await,
        Err(QueueError::StoreUnavailable(_))
    );
}

#[tokio::test]
async fn test_find_by_id_missing_row_is_none() {
    let mock_server = MockServer::start().await;
    let request_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/consultation_requests"))
        .and(query_param("id", format!("eq.{}", request_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    assert_eq!(store.find_by_id(request_id).await.unwrap(), None);
}

#[tokio::test]
async fn test_count_by_status_reads_exact_total() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/rest/v1/consultation_requests"))
        .and(query_param("specialty", "eq.psicologo"))
        .and(query_param("status", "eq.cancelled"))
        .and(header("Prefer", "count=exact"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Range", "0-999/2417"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let count = store
        .count_by_status(Specialty::Psicologo, ConsultationStatus::Cancelled)
        .await
        .unwrap();

    assert_eq!(count, 2417);
}

#[tokio::test]
async fn test_count_without_content_range_is_store_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/rest/v1/consultation_requests"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    assert_matches!(
        store.count_by_status(Specialty::Dentista, ConsultationStatus::Queued).await,
        Err(QueueError::StoreUnavailable(_))
    );
}

#[tokio::test]
async fn test_find_finished_since_parses_timings() {
    let mock_server = MockServer::start().await;
    let created_at = Utc::now() - Duration::hours(2);
    let started_at = created_at + Duration::minutes(20);
    let finished_at = started_at + Duration::minutes(40);

    Mock::given(method("GET"))
        .and(path("/rest/v1/consultation_requests"))
        .and(query_param("status", "eq.finished"))
        .and(query_param("select", "created_at,started_at,finished_at"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "created_at": created_at,
            "started_at": started_at,
            "finished_at": finished_at
        }])))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let timings = store
        .find_finished_since(Specialty::Dentista, Utc::now() - Duration::days(7))
        .await
        .unwrap();

    assert_eq!(timings.len(), 1);
    assert_eq!(timings[0].finished_at - timings[0].started_at, Duration::minutes(40));
}

#[tokio::test]
async fn test_fetch_professionals() {
    let mock_server = MockServer::start().await;
    let dentist_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/users"))
        .and(query_param("select", "id,role,is_active,is_online"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": dentist_id, "role": "dentista", "is_active": true, "is_online": true },
            { "id": Uuid::new_v4(), "role": "psicologo", "is_active": false, "is_online": false }
        ])))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let records = store.fetch_professionals().await.unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, dentist_id);
    assert_eq!(records[0].role, UserRole::Dentista);
    assert!(!records[1].is_active);
}
