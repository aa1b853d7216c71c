use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ingest_api::broker::MessagePublisher;
use ingest_engine::{Health, PipelineMetrics};

mod http;

#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<PipelineMetrics>,
    pub health: watch::Receiver<Health>,
    /// Publish ingress; `None` when the broker is external.
    pub publisher: Option<Arc<dyn MessagePublisher>>,
    pub topic: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(http::handle_health))
        .route("/metrics", get(http::handle_metrics))
        .route(
            "/api/partitions/{partition}/messages",
            post(http::handle_publish),
        )
        .with_state(state)
}

/// HTTP API server: health, telemetry and the development publish ingress.
pub async fn run(port: u16, state: ApiState, shutdown: CancellationToken) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind api :{port}: {e}"))?;
    tracing::info!(port, "api server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use broker_memory::{MemoryBroker, MemoryBrokerConfig};
    use ingest_api::broker::{BrokerClient, SubscriptionHandle};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(publisher: Option<Arc<dyn MessagePublisher>>) -> (ApiState, watch::Sender<Health>) {
        let (tx, rx) = watch::channel(Health::Healthy);
        let state = ApiState {
            metrics: Arc::new(PipelineMetrics::new()),
            health: rx,
            publisher,
            topic: "market-data".into(),
        };
        (state, tx)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_turns_503_when_fatal() {
        let (state, tx) = state(None);
        let app = router(state);

        let response = app.clone().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");

        tx.send(Health::Fatal("store down".into())).unwrap();
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["reason"], "store down");
    }

    #[tokio::test]
    async fn metrics_snapshot_as_json() {
        let (state, _tx) = state(None);
        state.metrics.set_lag(3, 42);
        let response = router(state).oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total_consumer_lag"], 42);
        assert_eq!(json["consumer_lag"]["3"], 42);
    }

    #[tokio::test]
    async fn publish_appends_to_broker() {
        let broker = Arc::new(MemoryBroker::new(MemoryBrokerConfig {
            partitions: 2,
            ..Default::default()
        }));
        let (state, _tx) = state(Some(broker.clone() as Arc<dyn MessagePublisher>));
        let app = router(state);

        let request = Request::post("/api/partitions/1/messages?schema=quote")
            .body(Body::from(r#"{"symbol":"AAPL","ts_ms":1,"bid":1.5}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["offset"], 0);

        let handle = SubscriptionHandle {
            topic: "market-data".into(),
            partition: 1,
        };
        let msg = broker
            .receive(&handle, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.schema_id.as_deref(), Some("quote"));

        let request = Request::post("/api/partitions/9/messages")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn publish_without_ingress_is_not_found() {
        let (state, _tx) = state(None);
        let request = Request::post("/api/partitions/0/messages")
            .body(Body::from("{}"))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
