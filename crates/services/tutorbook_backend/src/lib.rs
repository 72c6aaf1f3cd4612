// --- File: crates/services/tutorbook_backend/src/lib.rs ---
//! Wiring for the Tutorbook HTTP service.

pub mod service_factory;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tutorbook_booking::{routes, BookingEngine};

/// Mounts the booking routes under `/api` with request tracing.
pub fn build_app(engine: Arc<BookingEngine>) -> Router {
    let api_router = Router::new()
        .route("/", get(|| async { "Welcome to the Tutorbook API!" }))
        .merge(routes::routes(engine));

    Router::new()
        .nest("/api", api_router)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_factory::TutorbookServiceFactory;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use tutorbook_booking::{BookingDeps, BookingSettings, SystemClock};
    use tutorbook_config::AppConfig;
    use tutorbook_db::MemoryStore;

    fn app() -> Router {
        let config = AppConfig::default();
        let factory = TutorbookServiceFactory::new(&config);
        let deps = BookingDeps::from_factory(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            &factory,
            BookingSettings::from_config(&config.booking).unwrap(),
        );
        build_app(Arc::new(BookingEngine::new(deps)))
    }

    #[tokio::test]
    async fn test_health_is_nested_under_api() {
        let response = app()
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
