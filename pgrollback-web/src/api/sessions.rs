use axum::{extract::Path, Extension, Json};
use hyper::StatusCode;
use pgrollback_core::web::SessionInfo;
use pgrollback_logging::warn;

use crate::HttpApiState;

/// Read-only view of every registered session
pub(super) async fn list(Extension(state): Extension<HttpApiState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry().infos().await)
}

/// Destroys a session: rolls back its outer transaction and closes its
/// backend connection
pub(super) async fn destroy(
    Extension(state): Extension<HttpApiState>,
    Path(test_id): Path<String>,
) -> Result<StatusCode, (StatusCode, &'static str)> {
    match state.registry().destroy(&test_id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((StatusCode::NOT_FOUND, "No such session")),
        Err(err) => {
            warn!("Failed to destroy session \"{}\": {:?}", test_id, err);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to destroy session"))
        }
    }
}

/// Clears a session's bounded query history
pub(super) async fn clear_history(
    Extension(state): Extension<HttpApiState>,
    Path(test_id): Path<String>,
) -> Result<StatusCode, (StatusCode, &'static str)> {
    if state.registry().clear_history(&test_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "No such session"))
    }
}
