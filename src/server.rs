//! HTTP control API: status, live snapshots over SSE and the operator
//! controls of the rotation engine.
use crate::docker::ContainerName;
use crate::rotation::{ControlOutcome, ControlService, ForceRotateOutcome};
use crate::telemetry::FleetSnapshot;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
};
use futures_util::stream::Stream;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub struct AppState<CS: ControlService> {
    pub control: Arc<CS>,
    pub api_secret: Option<String>,
    /// Pause between two SSE snapshots.
    pub sse_interval: Duration,
}

impl<CS: ControlService> Clone for AppState<CS> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            api_secret: self.api_secret.clone(),
            sse_interval: self.sse_interval,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ScheduleRequest {
    pub in_seconds: u64,
}

async fn auth_middleware<CS: ControlService>(
    State(state): State<AppState<CS>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let api_secret = match state.api_secret {
        Some(secret) => secret,
        None => return Ok(next.run(request).await),
    };
    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    };
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));

    match token {
        Some(token) if token == api_secret => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn status<CS: ControlService>(
    State(state): State<AppState<CS>>,
) -> Json<ApiResponse<FleetSnapshot>> {
    Json(ApiResponse::success(state.control.snapshot().await))
}

async fn sse_handler<CS: ControlService>(
    State(state): State<AppState<CS>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("SSE client connected");
    let stream = async_stream::stream! {
        loop {
            let snapshot = state.control.snapshot().await;
            if let Ok(event) = Event::default().json_data(&snapshot) {
                yield Ok(event);
            }
            tokio::time::sleep(state.sse_interval).await;
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn pause<CS: ControlService>(State(state): State<AppState<CS>>) -> Json<ControlOutcome> {
    Json(state.control.pause().await)
}

async fn resume<CS: ControlService>(State(state): State<AppState<CS>>) -> Json<ControlOutcome> {
    Json(state.control.resume().await)
}

async fn force_rotate<CS: ControlService>(
    State(state): State<AppState<CS>>,
) -> Json<ForceRotateOutcome> {
    Json(state.control.force_rotate().await)
}

async fn schedule_rotation<CS: ControlService>(
    State(state): State<AppState<CS>>,
    Json(payload): Json<ScheduleRequest>,
) -> Json<ControlOutcome> {
    Json(
        state
            .control
            .schedule_rotation(Duration::from_secs(payload.in_seconds))
            .await,
    )
}

async fn kill_containers<CS: ControlService>(
    State(state): State<AppState<CS>>,
) -> Json<ApiResponse<Vec<ContainerName>>> {
    Json(ApiResponse::success(
        state.control.kill_all_containers().await,
    ))
}

pub fn create_app<CS: ControlService>(state: AppState<CS>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status::<CS>))
        .route("/sse", get(sse_handler::<CS>))
        .route("/rotation/pause", post(pause::<CS>))
        .route("/rotation/resume", post(resume::<CS>))
        .route("/rotation/force", post(force_rotate::<CS>))
        .route("/rotation/schedule", post(schedule_rotation::<CS>))
        .route("/containers/kill", post(kill_containers::<CS>))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware::<CS>,
        ))
        .with_state(state)
}

pub async fn start_server<CS: ControlService>(
    state: AppState<CS>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = create_app(state);
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    info!("Control API running on http://0.0.0.0:{port}");
    info!("Health check: http://0.0.0.0:{port}/health (no auth required)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
