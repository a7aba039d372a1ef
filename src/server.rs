//! Read-only HTTP API
//!
//! Serves incident snapshots and the event log, mainly to the dashboard.
//! `/health` is always open; the data routes sit behind a bearer token when
//! one is configured. Nothing here mutates state.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::store::{Store, LIST_LIMIT};

#[derive(Clone)]
struct ApiState {
    store: Store,
    token: Option<String>,
}

/// Build the API router around a store handle.
pub fn router(store: Store, token: Option<String>) -> Router {
    let state = ApiState { store, token };
    let data = Router::new()
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id", get(get_incident))
        .route("/events", get(list_events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(data)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(store: Store, bind: &str, token: Option<String>) -> Result<()> {
    let app = router(store, token);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!(addr = bind, "api listening");
    axum::serve(listener, app).await.context("API server stopped")
}

async fn require_bearer(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.token else {
        return next.run(request).await;
    };
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|candidate| candidate == expected)
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        )
            .into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_incidents(State(state): State<ApiState>) -> Response {
    match state.store.list_incidents(LIST_LIMIT) {
        Ok(incidents) => Json(incidents).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn get_incident(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match incident_detail(&state.store, &id) {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown incident" })),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn list_events(State(state): State<ApiState>) -> Response {
    match state.store.list_events(LIST_LIMIT) {
        Ok(events) => Json(events).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Everything the pipeline recorded about one incident.
fn incident_detail(store: &Store, id: &str) -> Result<Option<serde_json::Value>> {
    let Some(incident) = store.get_incident(id)? else {
        return Ok(None);
    };
    Ok(Some(serde_json::json!({
        "incident": incident,
        "plans": store.plans_for(id)?,
        "validations": store.validations_for(id)?,
        "rewards": store.rewards_for(id)?,
        "events": store.events_for(id)?,
    })))
}

fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!(%err, "api query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CrashEvidence, DependencyUpdate, Ecosystem, Event, Incident, RewardSignal,
    };

    fn sample_incident() -> Incident {
        Incident::new(
            DependencyUpdate {
                name: "left-pad".to_string(),
                current_version: "1.2.0".to_string(),
                latest_version: "1.3.0".to_string(),
                ecosystem: Ecosystem::Npm,
                manifest_path: "package.json".to_string(),
            },
            CrashEvidence::default(),
            "npm install && npm test".to_string(),
        )
    }

    async fn spawn_api(store: Store, token: Option<String>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(store, token);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let base = spawn_api(Store::open_in_memory().unwrap(), Some("sekrit".to_string())).await;
        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_data_routes_enforce_bearer() {
        let base = spawn_api(Store::open_in_memory().unwrap(), Some("sekrit".to_string())).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/incidents", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(format!("{}/incidents", base))
            .header("Authorization", "Bearer wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(format!("{}/incidents", base))
            .header("Authorization", "Bearer sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_data_routes_open_without_configured_token() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_incident(&sample_incident()).unwrap();
        let base = spawn_api(store, None).await;

        let incidents: serde_json::Value = reqwest::get(format!("{}/incidents", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(incidents.as_array().unwrap().len(), 1);
        assert_eq!(incidents[0]["dependency"]["name"], "left-pad");
    }

    #[tokio::test]
    async fn test_incident_detail_collects_history() {
        let store = Store::open_in_memory().unwrap();
        let incident = sample_incident();
        let id = incident.id.clone();
        store.upsert_incident(&incident).unwrap();
        store
            .insert_reward(&RewardSignal {
                incident_id: id.clone(),
                attempt: 1,
                reward: 0,
            })
            .unwrap();
        store
            .insert_event(&Event::new(
                "attempt",
                Some(&id),
                serde_json::json!({"attempt": 1, "stage": "validation"}),
            ))
            .unwrap();

        let base = spawn_api(store, None).await;
        let detail: serde_json::Value = reqwest::get(format!("{}/incidents/{}", base, id))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detail["incident"]["id"], id.as_str());
        assert_eq!(detail["rewards"].as_array().unwrap().len(), 1);
        assert_eq!(detail["events"].as_array().unwrap().len(), 1);
        assert!(detail["plans"].as_array().unwrap().is_empty());

        let resp = reqwest::get(format!("{}/incidents/missing", base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_events_route_lists_recent() {
        let store = Store::open_in_memory().unwrap();
        for kind in ["incident", "attempt"] {
            store
                .insert_event(&Event::new(kind, Some("inc-1"), serde_json::json!({})))
                .unwrap();
        }
        let base = spawn_api(store, None).await;

        let events: serde_json::Value = reqwest::get(format!("{}/events", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(events.as_array().unwrap().len(), 2);
        // Newest first
        assert_eq!(events[0]["type"], "attempt");
    }
}
