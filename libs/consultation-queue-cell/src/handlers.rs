use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    Extension,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::error::AppError;
use shared_models::user::User;

use crate::models::{FinishConsultationRequest, SetPresenceRequest, Specialty, SubmitConsultationRequest};
use crate::state::ConsultationQueueState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub days: Option<i64>,
}

fn parse_specialty(raw: &str) -> Result<Specialty, AppError> {
    Ok(raw.parse::<Specialty>()?)
}

fn require_professional(user: &User) -> Result<(), AppError> {
    if user.role.is_professional() {
        Ok(())
    } else {
        Err(AppError::Forbidden("Only professionals can perform this action".to_string()))
    }
}

fn require_staff(user: &User) -> Result<(), AppError> {
    if user.role.is_professional() || user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden("Only staff can perform this action".to_string()))
    }
}

/// Submit a consultation request for the calling patient
pub async fn submit_consultation(
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
    Json(body): Json<SubmitConsultationRequest>,
) -> Result<Json<Value>, AppError> {
    info!("Consultation submission from patient {} for {}", user.id, body.specialty);

    let position = state.dispatcher.submit(&user, body).await?;

    Ok(Json(json!({
        "success": true,
        "request_id": position.request_id,
        "position": position
    })))
}

/// Take the request out of the queue for the calling professional
pub async fn assume_consultation(
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    require_professional(&user)?;

    let request = state.dispatcher.assume(request_id, user.id).await?;

    Ok(Json(json!({
        "success": true,
        "request": request
    })))
}

pub async fn finish_consultation(
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<FinishConsultationRequest>,
) -> Result<Json<Value>, AppError> {
    require_professional(&user)?;

    let request = state.dispatcher.finish(request_id, user.id, body.notes).await?;

    Ok(Json(json!({
        "success": true,
        "request": request
    })))
}

pub async fn cancel_consultation(
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    info!("Cancel of request {} by {} ({})", request_id, user.id, user.role);

    let request = state.dispatcher.cancel(request_id, &user).await?;

    Ok(Json(json!({
        "success": true,
        "request": request
    })))
}

/// Queue position and the wait estimate for one request
pub async fn get_request_position(
    State(state): State<Arc<ConsultationQueueState>>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let estimate = state.estimator.calculate_request_wait_time(request_id).await?;
    Ok(Json(json!(estimate)))
}

pub async fn get_queue(
    State(state): State<Arc<ConsultationQueueState>>,
    Path(specialty): Path<String>,
) -> Result<Json<Value>, AppError> {
    let specialty = parse_specialty(&specialty)?;
    let snapshot = state.dispatcher.snapshot(specialty)?;
    let online = state.presence.count(specialty).await;

    Ok(Json(json!({
        "specialty": specialty,
        "waiting": snapshot.waiting,
        "in_progress": snapshot.in_progress,
        "queue_length": snapshot.queue_length(),
        "online_professionals": online,
        "version": snapshot.version,
        "updated_at": snapshot.updated_at
    })))
}

pub async fn get_wait_time(
    State(state): State<Arc<ConsultationQueueState>>,
    Path(specialty): Path<String>,
) -> Result<Json<Value>, AppError> {
    let specialty = parse_specialty(&specialty)?;
    let estimate = state.estimator.calculate_wait_time(specialty).await?;
    Ok(Json(json!(estimate)))
}

pub async fn get_wait_time_history(
    State(state): State<Arc<ConsultationQueueState>>,
    Path(specialty): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let specialty = parse_specialty(&specialty)?;
    let days = query.days.unwrap_or(state.estimator.config().history_days);
    let stats = state.estimator.historical_wait_time(specialty, days).await?;
    Ok(Json(json!(stats)))
}

pub async fn get_queue_statistics(
    State(state): State<Arc<ConsultationQueueState>>,
    Path(specialty): Path<String>,
) -> Result<Json<Value>, AppError> {
    let specialty = parse_specialty(&specialty)?;
    let stats = state.estimator.queue_statistics(specialty).await?;
    Ok(Json(json!(stats)))
}

/// External status change notification; drops the cached estimate
pub async fn notify_status_changed(
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
    Path(specialty): Path<String>,
) -> Result<Json<Value>, AppError> {
    require_staff(&user)?;
    let specialty = parse_specialty(&specialty)?;

    state.estimator.invalidate(specialty).await;
    info!("Wait-time estimate for {} invalidated by {}", specialty, user.id);

    Ok(Json(json!({
        "success": true,
        "specialty": specialty
    })))
}

pub async fn presence_heartbeat(
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    require_professional(&user)?;
    let presence = state.professional_seen(&user).await?;
    Ok(Json(json!(presence)))
}

pub async fn set_presence(
    State(state): State<Arc<ConsultationQueueState>>,
    Extension(user): Extension<User>,
    Json(body): Json<SetPresenceRequest>,
) -> Result<Json<Value>, AppError> {
    require_professional(&user)?;
    let presence = state.update_presence(&user, body.is_online, body.status).await?;
    Ok(Json(json!(presence)))
}
