use axum::{
    Router,
    response::{Html, IntoResponse},
    routing::get,
};

pub(crate) const HEALTH_PATH: &str = "/health";
pub(crate) const HEALTH_BODY: &str = "ok";

// Router served for hosts routed to `home`, and for local requests over plain HTTP.
//
// The actual administration interface lives elsewhere; this only answers liveness probes
// and shows that the gateway is up.
pub(crate) fn admin_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route(HEALTH_PATH, get(health))
}

async fn index() -> impl IntoResponse {
    Html(concat!(
        "<!DOCTYPE html><html><head><title>doorway</title></head>",
        "<body><p>doorway is running.</p></body></html>"
    ))
}

async fn health() -> &'static str {
    HEALTH_BODY
}
