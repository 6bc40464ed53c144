use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};

use parley_gateway::auth::{AuthError, bearer_token};

use crate::auth::AppState;

/// Validate the bearer JWT and resolve it to a stored user, which handlers
/// receive as `Extension<User>`. Same checks as the gateway handshake.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    let user = state.relay.authenticate(token).await.map_err(|e| match e {
        AuthError::LookupFailed => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNAUTHORIZED,
    })?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
