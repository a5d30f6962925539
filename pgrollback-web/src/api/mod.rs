use axum::{routing, Router};

mod sessions;

pub(super) fn router() -> Router {
    Router::new()
        .route("/sessions", routing::get(sessions::list))
        .route("/sessions/:test_id", routing::delete(sessions::destroy))
        .route(
            "/sessions/:test_id/history",
            routing::delete(sessions::clear_history),
        )
}
