use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use shared_models::error::AppError;
use shared_models::user::{User, UserRole};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

// Authentication happens at the gateway; it forwards the verified identity
// in two headers which this middleware turns into a `User` extension.
pub async fn identity_middleware(
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let user = user_from_headers(request.headers())?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

pub fn user_from_headers(headers: &HeaderMap) -> Result<User, AppError> {
    let id = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::Auth("Missing caller identity".to_string()))?
        .to_str()
        .map_err(|_| AppError::Auth("Invalid caller identity header".to_string()))?;

    let id = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::Auth("Caller identity is not a valid UUID".to_string()))?;

    let role = headers
        .get(USER_ROLE_HEADER)
        .ok_or_else(|| AppError::Auth("Missing caller role".to_string()))?
        .to_str()
        .map_err(|_| AppError::Auth("Invalid caller role header".to_string()))?
        .parse::<UserRole>()
        .map_err(AppError::Auth)?;

    Ok(User::new(id, role))
}
