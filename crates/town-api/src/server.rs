use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, Request as HttpRequest, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{ApiError, EngineDoc, ErrorCode, InputPayload, WorldConfig, WorldSnapshot};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::agents::{self, now_ms, SharedApi};
use crate::llm::{LlmClient, LlmConfig, LlmError};
use crate::{EngineApi, PersistenceError};

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Llm(LlmError),
    Persistence(PersistenceError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "server io error: {err}"),
            Self::Llm(err) => write!(f, "llm configuration error: {err}"),
            Self::Persistence(err) => write!(f, "persistence error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<LlmError> for ServerError {
    fn from(value: LlmError) -> Self {
        Self::Llm(value)
    }
}

impl From<PersistenceError> for ServerError {
    fn from(value: PersistenceError) -> Self {
        Self::Persistence(value)
    }
}

#[derive(Clone)]
struct AppState {
    api: SharedApi,
    step_notify: Arc<Notify>,
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn world_not_found(requested: &str, active: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::WorldNotFound,
                "world_id does not match the active world",
                Some(format!("requested={requested} active={active}")),
            ),
        }
    }

    fn input_not_found(input_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::InputNotFound,
                "no input with that id",
                Some(format!("input_id={input_id}")),
            ),
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

/// Boot a world (resuming from the database when present), spawn the engine
/// driver and the agent tasks, and serve the HTTP surface.
pub async fn serve(addr: SocketAddr, db_path: Option<PathBuf>) -> Result<(), ServerError> {
    let llm = Arc::new(LlmClient::new(LlmConfig::from_env()?));

    let api = match db_path.as_ref() {
        Some(path) => match EngineApi::load(path)? {
            Some(resumed) => {
                info!(world = resumed.world_id(), "resumed persisted world");
                resumed
            }
            None => {
                let mut fresh = EngineApi::from_config(WorldConfig::default());
                fresh.attach_sqlite_store(path)?;
                fresh
            }
        },
        None => EngineApi::from_config(WorldConfig::default()),
    };

    let api: SharedApi = Arc::new(Mutex::new(api));
    let step_notify = Arc::new(Notify::new());

    {
        let mut guard = api.lock().await;
        guard.start(now_ms());
    }
    tokio::spawn(agents::drive_engine(api.clone(), step_notify.clone()));
    agents::spawn_agents(api.clone(), Some(llm), step_notify.clone()).await;

    let state = AppState { api, step_notify };
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/worlds/{world_id}/inputs", post(send_input))
        .route("/api/v1/inputs/{input_id}", get(input_status))
        .route("/api/v1/worlds/{world_id}/engine", get(engine_status))
        .route("/api/v1/worlds/{world_id}/state", get(world_state))
        .route("/api/v1/worlds/{world_id}/start", post(start_world))
        .route("/api/v1/worlds/{world_id}/stop", post(stop_world))
        .route("/api/v1/worlds/{world_id}/kick", post(kick_world))
        .route("/api/v1/worlds/{world_id}/heartbeat", post(heartbeat))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: HttpRequest<axum::body::Body>, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
}

async fn send_input(
    State(state): State<AppState>,
    Path(world_id): Path<String>,
    Json(payload): Json<InputPayload>,
) -> Result<Json<Value>, HttpApiError> {
    let mut guard = state.api.lock().await;
    require_world(&guard, &world_id)?;
    let input_id = guard.send_input(payload, now_ms());
    drop(guard);
    state.step_notify.notify_one();
    Ok(Json(json!({ "inputId": input_id })))
}

async fn input_status(
    State(state): State<AppState>,
    Path(input_id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let guard = state.api.lock().await;
    match guard.input_status(&input_id) {
        None => Err(HttpApiError::input_not_found(&input_id)),
        Some(None) => Ok(Json(Value::Null)),
        Some(Some(return_value)) => Ok(Json(
            serde_json::to_value(return_value).unwrap_or(Value::Null),
        )),
    }
}

async fn engine_status(
    State(state): State<AppState>,
    Path(world_id): Path<String>,
) -> Result<Json<EngineDoc>, HttpApiError> {
    let mut guard = state.api.lock().await;
    require_world(&guard, &world_id)?;
    guard.heartbeat(now_ms());
    Ok(Json(guard.engine_doc()))
}

async fn world_state(
    State(state): State<AppState>,
    Path(world_id): Path<String>,
) -> Result<Json<WorldSnapshot>, HttpApiError> {
    let guard = state.api.lock().await;
    require_world(&guard, &world_id)?;
    Ok(Json(guard.snapshot()))
}

async fn start_world(
    State(state): State<AppState>,
    Path(world_id): Path<String>,
) -> Result<Json<EngineDoc>, HttpApiError> {
    let mut guard = state.api.lock().await;
    require_world(&guard, &world_id)?;
    let doc = guard.start(now_ms());
    drop(guard);
    state.step_notify.notify_one();
    Ok(Json(doc))
}

async fn stop_world(
    State(state): State<AppState>,
    Path(world_id): Path<String>,
) -> Result<Json<EngineDoc>, HttpApiError> {
    let mut guard = state.api.lock().await;
    require_world(&guard, &world_id)?;
    Ok(Json(guard.stop(now_ms())))
}

async fn kick_world(
    State(state): State<AppState>,
    Path(world_id): Path<String>,
) -> Result<Json<EngineDoc>, HttpApiError> {
    let mut guard = state.api.lock().await;
    require_world(&guard, &world_id)?;
    let doc = guard.kick(now_ms());
    drop(guard);
    state.step_notify.notify_one();
    Ok(Json(doc))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(world_id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let mut guard = state.api.lock().await;
    require_world(&guard, &world_id)?;
    guard.heartbeat(now_ms());
    Ok(Json(json!({ "ok": true })))
}

fn require_world(api: &EngineApi, world_id: &str) -> Result<(), HttpApiError> {
    if api.world_id() != world_id {
        return Err(HttpApiError::world_not_found(world_id, api.world_id()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_input_rejects_unknown_worlds() {
        let api: SharedApi = Arc::new(Mutex::new(EngineApi::from_config(WorldConfig::default())));
        let state = AppState {
            api,
            step_notify: Arc::new(Notify::new()),
        };

        let result = send_input(
            State(state),
            Path("worlds:somewhere-else".to_string()),
            Json(InputPayload::Leave {
                player_id: "players:1".to_string(),
            }),
        )
        .await;

        let err = result.err().expect("should reject");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.error.error_code, ErrorCode::WorldNotFound);
    }

    #[tokio::test]
    async fn input_lifecycle_over_the_handlers() {
        let api: SharedApi = Arc::new(Mutex::new(EngineApi::from_config(WorldConfig::default())));
        {
            api.lock().await.start(now_ms());
        }
        let state = AppState {
            api: api.clone(),
            step_notify: Arc::new(Notify::new()),
        };
        let world_id = { api.lock().await.world_id().to_string() };

        let response = send_input(
            State(state.clone()),
            Path(world_id),
            Json(InputPayload::Join {
                name: "Wren".to_string(),
                character: "f8".to_string(),
                description: "over http".to_string(),
            }),
        )
        .await
        .expect("accepted");
        let input_id = response
            .0
            .get("inputId")
            .and_then(Value::as_str)
            .expect("input id")
            .to_string();

        // Still pending before any step runs.
        let pending = input_status(State(state.clone()), Path(input_id.clone()))
            .await
            .expect("known input");
        assert_eq!(pending.0, Value::Null);

        {
            let mut guard = api.lock().await;
            let generation = guard.due_generation(now_ms()).expect("due");
            guard.run_step(generation, now_ms());
        }

        let processed = input_status(State(state), Path(input_id))
            .await
            .expect("known input");
        assert_eq!(
            processed.0.get("kind").and_then(Value::as_str),
            Some("ok")
        );
    }
}
