pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod state;
pub mod websocket;

pub use error::*;
pub use events::*;
pub use models::*;
pub use router::create_consultation_queue_router;
pub use services::*;
pub use state::ConsultationQueueState;
