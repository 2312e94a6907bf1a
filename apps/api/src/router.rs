use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use consultation_queue_cell::{create_consultation_queue_router, ConsultationQueueState};

pub fn create_router(state: Arc<ConsultationQueueState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Consultation queue API is running!" }))
        .nest("/queue", create_consultation_queue_router(state))
}
