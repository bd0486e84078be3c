use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use vesper_contracts::effects::EffectSettings;
use vesper_contracts::events::EventPayload;
use vesper_contracts::render::RenderModel;
use vesper_engine::{error_chain_text, ChatApp, Dispatch, UiEvent, UnknownImage, UnknownSession};

const INDEX_HTML: &str = include_str!("../assets/index.html");
const WARNING_HEADER: &str = "x-vesper-warning";

type AppState = Arc<ChatApp>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<UnknownSession>().is_some()
            || err.downcast_ref::<UnknownImage>().is_some()
        {
            return Self::not_found(err.to_string());
        }
        Self::internal(error_chain_text(&err, 512))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs engine work on the blocking pool. Turns against one session queue
/// behind each other; reads see the running turn's render instead.
async fn blocking<T, F>(app: &AppState, work: F) -> ApiResult<T>
where
    F: FnOnce(&ChatApp) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let worker = Arc::clone(app);
    let result = tokio::task::spawn_blocking(move || work(&worker))
        .await
        .map_err(|err| ApiError::internal(format!("worker task failed: {err}")))
        .and_then(|result| result.map_err(ApiError::from));
    if let Err(error) = &result {
        record_server_error(app, error);
    }
    result
}

/// Appends an `http_error` event for 5xx answers.
fn record_server_error(app: &ChatApp, error: &ApiError) {
    if !error.status.is_server_error() {
        return;
    }
    let mut payload = EventPayload::new();
    payload.insert("status".to_string(), json!(error.status.as_u16()));
    payload.insert("error".to_string(), json!(error.message));
    // The response still carries the error when the log is unwritable.
    let _ = app.event_writer().emit("http_error", payload);
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/messages", post(post_message))
        .route("/api/sessions/{id}/clear", post(clear_session))
        .route("/api/sessions/{id}/images/{key}", get(get_image))
        .route("/api/sessions/{id}/images/{key}/effects", put(put_effects))
        .route("/api/sessions/{id}/images/{key}/reset", post(reset_effects))
        .with_state(app)
}

pub async fn serve(app: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let local = listener.local_addr().context("failed to read bound address")?;
    println!("{} on http://{local}", app.variant().title());
    for notice in app.startup_notices() {
        println!("[startup] {}", notice.text);
    }
    axum::serve(listener, router(app))
        .await
        .context("http server stopped")?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn create_session(State(app): State<AppState>) -> ApiResult<(StatusCode, Json<RenderModel>)> {
    let render = blocking(&app, |app| app.open_session()).await?;
    Ok((StatusCode::CREATED, Json(render)))
}

async fn get_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RenderModel>> {
    let render = blocking(&app, move |app| app.render(&id)).await?;
    Ok(Json(render))
}

async fn delete_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let label = id.clone();
    if blocking(&app, move |app| app.destroy_session(&id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(UnknownSession(label).to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    text: String,
}

async fn post_message(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Json<Dispatch>> {
    if body.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }
    dispatch(&app, id, UiEvent::SubmitText(body.text)).await
}

async fn clear_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Dispatch>> {
    dispatch(&app, id, UiEvent::Clear).await
}

async fn put_effects(
    State(app): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    Json(settings): Json<EffectSettings>,
) -> ApiResult<Json<Dispatch>> {
    dispatch(&app, id, UiEvent::UpdateEffects { key, settings }).await
}

async fn reset_effects(
    State(app): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> ApiResult<Json<Dispatch>> {
    dispatch(&app, id, UiEvent::ResetEffects { key }).await
}

async fn dispatch(app: &AppState, id: String, event: UiEvent) -> ApiResult<Json<Dispatch>> {
    let dispatch = blocking(app, move |app| app.dispatch(&id, event)).await?;
    Ok(Json(dispatch))
}

#[derive(Debug, Default, Deserialize)]
struct ImageQuery {
    download: Option<String>,
}

impl ImageQuery {
    fn wants_attachment(&self) -> bool {
        self.download
            .as_deref()
            .map(|value| !matches!(value.trim(), "" | "0" | "false" | "no"))
            .unwrap_or(false)
    }
}

async fn get_image(
    State(app): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<Response> {
    let export = blocking(&app, move |app| app.export_png(&id, &key)).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if query.wants_attachment() {
        let disposition = format!("attachment; filename=\"{}\"", export.file_name);
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    for warning in &export.warnings {
        let ascii: String = warning.chars().filter(char::is_ascii).collect();
        if let Ok(value) = HeaderValue::from_str(&ascii) {
            headers.append(WARNING_HEADER, value);
        }
    }
    Ok((headers, export.bytes).into_response())
}
