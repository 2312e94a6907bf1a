use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_utils::extractor::identity_middleware;

use crate::handlers::{
    assume_consultation, cancel_consultation, finish_consultation, get_queue, get_queue_statistics,
    get_request_position, get_wait_time, get_wait_time_history, notify_status_changed, presence_heartbeat,
    set_presence, submit_consultation,
};
use crate::state::ConsultationQueueState;
use crate::websocket::websocket_handler;

pub fn create_consultation_queue_router(state: Arc<ConsultationQueueState>) -> Router {
    let protected_routes = Router::new()
        .route("/consultations", post(submit_consultation))
        .route("/consultations/{id}/assume", post(assume_consultation))
        .route("/consultations/{id}/finish", post(finish_consultation))
        .route("/consultations/{id}/cancel", post(cancel_consultation))
        .route("/consultations/{id}/position", get(get_request_position))
        .route("/specialties/{specialty}/queue", get(get_queue))
        .route("/specialties/{specialty}/wait-time", get(get_wait_time))
        .route("/specialties/{specialty}/wait-time/history", get(get_wait_time_history))
        .route("/specialties/{specialty}/statistics", get(get_queue_statistics))
        .route("/specialties/{specialty}/status-changed", post(notify_status_changed))
        .route("/presence/heartbeat", post(presence_heartbeat))
        .route("/presence", put(set_presence))
        .route("/ws", get(websocket_handler))
        .layer(middleware::from_fn(identity_middleware));

    Router::new().merge(protected_routes).with_state(state)
}
