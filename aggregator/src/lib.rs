pub mod api;
pub mod config;
pub mod deadline;
pub mod dispatcher;
pub mod emitter;
pub mod errors;
pub mod metrics_defs;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod signaling;
pub mod sink;

use crate::errors::Result;
use tokio::net::TcpListener;

/// Runs the gateway until a shutdown signal arrives, then flushes all live
/// correlations and signaling sessions.
pub async fn run(config: config::Config) -> Result<()> {
    let state = api::AppState::new(&config);
    let app = api::router(state.clone());

    let listener =
        TcpListener::bind(format!("{}:{}", config.listener.host, config.listener.port)).await?;
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        resources = config.resource_urls.len(),
        "journal aggregation gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, flushing live state");
            // Closing the channels ends every open stream, which lets the
            // in-flight connections drain.
            state.shutdown();
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AppState, router};
    use crate::config::{Config, Listener, SignalingConfig};
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(&Config {
            listener: Listener {
                host: "127.0.0.1".into(),
                port: 0,
            },
            callback_url: "http://gateway/aggregate/callback".into(),
            resource_urls: vec![],
            max_timeout_ms: 27_000,
            signaling: SignalingConfig {
                ttl_seconds: 60,
                ice_servers: json!([{ "urls": ["stun:test"] }]),
            },
            metrics: None,
        })
    }

    fn json_post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn callback_for_unknown_correlation_is_acknowledged() {
        let app = router(test_state());
        let response = app
            .oneshot(json_post(
                "/aggregate/callback",
                json!({
                    "source": "http://res-a:8081",
                    "patientId": "p1",
                    "correlationId": "long-gone",
                    "status": "ok",
                    "notes": []
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_for_unknown_correlation_is_an_empty_200() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::get("/aggregate/stream?correlationId=long-gone")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn second_stream_subscriber_conflicts() {
        let state = test_state();
        let app: Router = router(state.clone());
        let (id, _sink) = state.registry.create();

        let uri = format!("/aggregate/stream?correlationId={id}");
        let first = app
            .clone()
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn signaling_round_trip_over_http() {
        let app = router(test_state());

        let created = app
            .clone()
            .oneshot(json_post("/aggregate/webrtc/create", json!({})))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        let created = body_json(created).await;
        let session_id = created["sessionId"].as_str().unwrap().to_string();
        let token = created["token"].as_str().unwrap().to_string();
        assert_eq!(created["ttlSeconds"], 60);
        assert!(created["iceServers"].is_array());

        // Bad token fails loudly
        let unauthorized = app
            .clone()
            .oneshot(json_post(
                &format!("/aggregate/webrtc/{session_id}/signal"),
                json!({"token": "wrong", "payload": {"sdp": "offer"}}),
            ))
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        // Unknown session is a 404
        let missing = app
            .clone()
            .oneshot(json_post(
                "/aggregate/webrtc/no-such-session/signal",
                json!({"token": token, "payload": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        // Valid token fans out (to zero subscribers here)
        let accepted = app
            .oneshot(json_post(
                &format!("/aggregate/webrtc/{session_id}/signal"),
                json!({"token": token, "payload": {"sdp": "offer"}}),
            ))
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn signaling_subscribe_requires_the_token() {
        let state = test_state();
        let app = router(state.clone());
        let created = state.sessions.create();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!(
                    "/aggregate/webrtc/{}/stream?token=wrong",
                    created.session_id
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get(format!(
                    "/aggregate/webrtc/{}/stream?token={}",
                    created.session_id, created.token
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn shutdown_flushes_correlations_and_sessions() {
        let state = test_state();
        let (id, sink) = state.registry.create();
        let mut rx = sink.take_receiver().unwrap();
        state.sessions.create();

        state.shutdown();

        assert!(state.registry.get(&id).is_none());
        assert!(state.sessions.is_empty());
        // Truncated stream: closed without a COMPLETE summary
        assert!(rx.recv().await.is_none());
    }
}
