use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path as FsPath, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use workbench_core::config::{load_runtime_env, update_runtime_env, RUNTIME_ENV_ALLOWED_KEYS};
use workbench_core::cron::Cron;
use workbench_core::runner::ContinueError;
use workbench_core::skill_router::choose_skill_id;
use workbench_runtime::{healthcheck, spawn_child};
use workbench_store::StoreError;
use workbench_types::{now_iso, Backend, Mode, PolicyScope, WorkspacePolicy};

use crate::AppState;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::not_found(format!("{what} not found")),
            StoreError::Busy => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "db is busy, please retry",
            ),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ----------------------------------------------------------------------------
// Auth
// ----------------------------------------------------------------------------

fn query_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}

/// Mutating endpoints require the shared admin token, via `x-admin-token`
/// header or `?token=` query parameter.
async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method();
    let mutating =
        !(method == Method::GET || method == Method::HEAD || method == Method::OPTIONS);
    if mutating {
        let provided = request
            .headers()
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query_token(request.uri().query()));
        if provided.as_deref() != Some(state.admin_token.as_str()) {
            return ApiError::new(
                StatusCode::UNAUTHORIZED,
                "Missing/invalid admin token. Provide ?token=... or header x-admin-token",
            )
            .into_response();
        }
    }
    next.run(request).await
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/events", get(events))
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route(
            "/api/workspaces/{id}/policies",
            get(list_policies).post(set_policy),
        )
        .route("/api/skills", get(list_skills).post(create_skill))
        .route("/api/skills/{id}/enabled", post(set_skill_enabled))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/auto", post(create_task_auto))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/continue", post(continue_task))
        .route("/api/tasks/{id}/approve/{step_id}", post(approve_step))
        .route("/api/tasks/{id}/events", get(task_events))
        .route("/api/tasks/{id}/citations", get(task_citations))
        .route("/api/tasks/{id}/files", get(task_files))
        .route("/api/tasks/{id}/files/raw/{file_id}", get(task_file_raw))
        .route("/api/tasks/{id}/files/open", post(task_file_open))
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route("/api/schedules/{id}/enabled", post(set_schedule_enabled))
        .route("/api/schedules/{id}", delete(delete_schedule))
        .route("/api/mcp_servers", get(list_mcp_servers).post(create_mcp_server))
        .route(
            "/api/mcp_servers/{id}",
            post(update_mcp_server).delete(delete_mcp_server),
        )
        .route("/api/mcp_servers/{id}/health", post(mcp_server_health))
        .route("/api/settings", get(get_settings).post(update_settings))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("workbench engine listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Health & events
// ----------------------------------------------------------------------------

async fn health(State(_state): State<AppState>) -> Json<Value> {
    Json(json!({"ok": true, "app": "workbench", "time": now_iso()}))
}

/// Live process-wide event stream. Clients filter by task id themselves and
/// reconcile gaps via the event-log endpoint (lagged subscribers drop events).
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.event_bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(ev) => {
                let data = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(Event::default().event(ev.event_type).data(data)))
            }
            // Lagged subscriber: events were dropped; the log is authoritative.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

// ----------------------------------------------------------------------------
// Workspaces & policies
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WorkspaceCreateInput {
    name: String,
    path: Option<String>,
}

fn slug(input: &str) -> String {
    let mut out = String::new();
    for c in input.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        "workspace".to_string()
    } else {
        out
    }
}

async fn list_workspaces(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.store.list_workspaces().await?)))
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(input): Json<WorkspaceCreateInput>,
) -> ApiResult<Json<Value>> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name required"));
    }
    let path = match input.path {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
        _ => state.settings.workspaces_dir.join(slug(name)),
    };
    std::fs::create_dir_all(&path)
        .map_err(|err| ApiError::bad_request(format!("cannot create workspace dir: {err}")))?;
    let ws = state
        .store
        .create_workspace(name, &path.display().to_string())
        .await?;
    Ok(Json(json!(ws)))
}

#[derive(Debug, Deserialize)]
struct PolicySetInput {
    scope: String,
    policy: String,
}

async fn list_policies(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_workspace(&id).await?;
    let configured: HashMap<&str, &str> = state
        .store
        .list_policies(&id)
        .await?
        .into_iter()
        .map(|(scope, policy)| (scope.as_str(), policy.as_str()))
        .collect();
    let out: Vec<Value> = PolicyScope::ALL
        .iter()
        .map(|scope| {
            json!({
                "scope": scope.as_str(),
                "policy": configured.get(scope.as_str()).copied(),
            })
        })
        .collect();
    Ok(Json(json!(out)))
}

async fn set_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<PolicySetInput>,
) -> ApiResult<Json<Value>> {
    state.store.get_workspace(&id).await?;
    let scope = PolicyScope::from_str(&input.scope)
        .map_err(|_| ApiError::bad_request(format!("invalid scope: {}", input.scope)))?;
    let policy = WorkspacePolicy::from_str(&input.policy)
        .map_err(|_| ApiError::bad_request(format!("invalid policy: {}", input.policy)))?;
    state.store.set_policy(&id, scope, policy).await?;
    Ok(Json(json!({"ok": true})))
}

// ----------------------------------------------------------------------------
// Skills
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SkillCreateInput {
    name: String,
    description: Option<String>,
    system_prompt: String,
    #[serde(default)]
    allowed_tools: Vec<String>,
    default_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnableInput {
    enabled: bool,
}

async fn list_skills(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.store.list_skills(false).await?)))
}

async fn create_skill(
    State(state): State<AppState>,
    Json(input): Json<SkillCreateInput>,
) -> ApiResult<Json<Value>> {
    if input.name.trim().is_empty() {
        return Err(ApiError::bad_request("name required"));
    }
    if input.system_prompt.trim().is_empty() {
        return Err(ApiError::bad_request("system_prompt required"));
    }
    let mode = parse_mode(input.default_mode.as_deref())?.unwrap_or(Mode::Fast);
    let skill = state
        .store
        .create_skill(
            input.name.trim(),
            input.description.as_deref(),
            None,
            &input.system_prompt,
            &input.allowed_tools,
            mode,
        )
        .await?;
    Ok(Json(json!(skill)))
}

async fn set_skill_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<EnableInput>,
) -> ApiResult<Json<Value>> {
    state.store.get_skill(&id).await?;
    state.store.set_skill_enabled(&id, input.enabled).await?;
    Ok(Json(json!({"ok": true})))
}

fn parse_mode(raw: Option<&str>) -> ApiResult<Option<Mode>> {
    match raw {
        None => Ok(None),
        Some(raw) => Mode::from_str(raw)
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("invalid mode: {raw}"))),
    }
}

// ----------------------------------------------------------------------------
// Tasks
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TaskCreateInput {
    workspace_id: String,
    skill_id: String,
    goal: String,
    mode: Option<String>,
    backend: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AutoTaskInput {
    goal: String,
    hint: Option<String>,
    mode: Option<String>,
    workspace_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CancelInput {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskContinueInput {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalDecisionInput {
    decision: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    after: Option<i64>,
    limit: Option<usize>,
    tail: Option<bool>,
}

async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.store.list_tasks().await?)))
}

async fn create_task(
    State(state): State<AppState>,
    Json(input): Json<TaskCreateInput>,
) -> ApiResult<Json<Value>> {
    if input.goal.trim().is_empty() {
        return Err(ApiError::bad_request("goal required"));
    }
    state.store.get_workspace(&input.workspace_id).await?;
    let skill = state.store.get_skill(&input.skill_id).await?;
    let mode = parse_mode(input.mode.as_deref())?.unwrap_or(skill.default_mode);
    let backend = match input.backend.as_deref() {
        None => None,
        Some(raw) => Some(
            Backend::from_str(raw)
                .map_err(|_| ApiError::bad_request(format!("invalid backend: {raw}")))?,
        ),
    };
    let task = state
        .store
        .create_task(&input.workspace_id, &input.skill_id, input.goal.trim(), mode, backend)
        .await?;
    state.runner.start_task_background(&task.id);
    Ok(Json(json!({"ok": true, "task_id": task.id})))
}

/// Pick a workspace (explicit > first) and route the skill, then create and
/// start the task.
async fn create_task_auto(
    State(state): State<AppState>,
    Json(input): Json<AutoTaskInput>,
) -> ApiResult<Json<Value>> {
    let goal = input.goal.trim();
    if goal.is_empty() {
        return Err(ApiError::bad_request("goal required"));
    }
    let workspaces = state.store.list_workspaces().await?;
    if workspaces.is_empty() {
        return Err(ApiError::bad_request("no workspaces available"));
    }
    let workspace_id = input
        .workspace_id
        .filter(|id| workspaces.iter().any(|w| &w.id == id))
        .unwrap_or_else(|| workspaces[0].id.clone());

    let skills = state.store.list_skills(true).await?;
    if skills.is_empty() {
        return Err(ApiError::bad_request("no skills available"));
    }
    let routing_mode = parse_mode(input.mode.as_deref())?.unwrap_or(Mode::Fast);
    let provider = provider_if_configured(&state);
    let skill_id = choose_skill_id(
        provider,
        &state.settings.model_for(routing_mode),
        goal,
        &skills,
        input.hint.as_deref(),
    )
    .await?;

    let skill = state.store.get_skill(&skill_id).await?;
    let mode = parse_mode(input.mode.as_deref())?.unwrap_or(skill.default_mode);
    let task = state
        .store
        .create_task(&workspace_id, &skill_id, goal, mode, None)
        .await?;
    state.runner.start_task_background(&task.id);
    Ok(Json(json!({
        "ok": true,
        "task_id": task.id,
        "workspace_id": workspace_id,
        "skill_id": skill_id,
        "mode": mode.as_str(),
    })))
}

fn provider_if_configured(state: &AppState) -> Option<&dyn workbench_providers::ChatProvider> {
    let key = state.settings.llm_api_key.trim();
    if key.is_empty() || key == "CHANGE_ME" {
        return None;
    }
    Some(state.provider.as_ref())
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let task = state.store.get_task(&id).await?;
    let steps = state.store.list_steps(&id).await?;
    let approvals = state.store.list_approvals(&id).await?;
    Ok(Json(json!({"task": task, "steps": steps, "approvals": approvals})))
}

/// Idempotent delete: unknown ids succeed, store rows cascade, and the
/// generated outputs/artifacts directories are removed best-effort.
async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = match state.store.get_task(&id).await {
        Ok(task) => task,
        Err(StoreError::NotFound(_)) => return Ok(Json(json!({"ok": true}))),
        Err(err) => return Err(err.into()),
    };
    if let Ok(ws) = state.store.get_workspace(&task.workspace_id).await {
        let out_dir = PathBuf::from(ws.path).join("outputs").join(&id);
        let _ = std::fs::remove_dir_all(out_dir);
    }
    let _ = std::fs::remove_dir_all(state.settings.task_artifacts_dir(&id));
    state.store.delete_task(&id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    // The body is optional; an empty or non-JSON body cancels without a reason.
    let reason = serde_json::from_slice::<CancelInput>(&body)
        .ok()
        .and_then(|input| input.reason);
    let ok = state.runner.cancel_task(&id, reason.as_deref()).await?;
    Ok(Json(json!({"ok": ok})))
}

async fn continue_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<TaskContinueInput>,
) -> ApiResult<Json<Value>> {
    match state.runner.continue_task(&id, &input.message).await {
        Ok(workbench_core::runner::ContinueOutcome::ApprovalDecision { decision, step_id }) => {
            Ok(Json(json!({"ok": true, "approved": true, "decision": decision, "step_id": step_id})))
        }
        Ok(workbench_core::runner::ContinueOutcome::Resumed) => Ok(Json(json!({"ok": true}))),
        Err(err) => Err(map_continue_error(err)),
    }
}

fn map_continue_error(err: ContinueError) -> ApiError {
    match err {
        ContinueError::EmptyMessage => ApiError::bad_request(err.to_string()),
        ContinueError::NeedsDecision | ContinueError::NoPendingApproval => {
            ApiError::conflict(err.to_string())
        }
        ContinueError::Busy(_) => ApiError::conflict(err.to_string()),
        ContinueError::UnsupportedBackend => ApiError::bad_request(err.to_string()),
        ContinueError::Store(store) => store.into(),
        ContinueError::Other(message) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message),
    }
}

async fn approve_step(
    State(state): State<AppState>,
    Path((task_id, step_id)): Path<(String, String)>,
    Json(input): Json<ApprovalDecisionInput>,
) -> ApiResult<Json<Value>> {
    if !matches!(input.decision.as_str(), "approve" | "reject") {
        return Err(ApiError::bad_request("decision must be approve or reject"));
    }
    state.store.get_task(&task_id).await?;
    state.store.get_step(&step_id).await?;
    let changed = state
        .runner
        .approve_step(&task_id, &step_id, &input.decision, input.reason.as_deref())
        .await?;
    Ok(Json(json!({"ok": true, "changed": changed})))
}

async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Value>> {
    let events = state
        .store
        .list_events(
            &id,
            query.after.unwrap_or(0),
            query.limit.unwrap_or(200),
            query.tail.unwrap_or(false),
        )
        .await?;
    Ok(Json(json!(events)))
}

/// Evidence markers collected from the task's assistant output:
/// `[source: ...]` markers and bare URLs, deduplicated in first-seen order.
async fn task_citations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_task(&id).await?;
    let events = state.store.list_events(&id, 0, 2000, false).await?;
    let mut sources: Vec<String> = Vec::new();
    for event in events {
        if event.event_type != "chat_message" {
            continue;
        }
        if event.payload.get("role").and_then(|r| r.as_str()) != Some("assistant") {
            continue;
        }
        let Some(content) = event.payload.get("content").and_then(|c| c.as_str()) else {
            continue;
        };
        for source in extract_citation_sources(content) {
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
    }
    let citations: Vec<Value> = sources.iter().map(|s| json!({"source": s})).collect();
    Ok(Json(json!({"task_id": id, "citations": citations})))
}

fn extract_citation_sources(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("[source:") {
        let after = &rest[start + "[source:".len()..];
        let Some(end) = after.find(']') else {
            break;
        };
        let source = after[..end].trim();
        if !source.is_empty() {
            out.push(source.to_string());
        }
        rest = &after[end + 1..];
    }
    for token in text.split_whitespace() {
        let token = token.trim_end_matches(['.', ',', ')', ']', ';']);
        if token.starts_with("http://") || token.starts_with("https://") {
            out.push(token.to_string());
        }
    }
    out
}

// ----------------------------------------------------------------------------
// Task files
// ----------------------------------------------------------------------------

fn encode_file_id(root: &str, rel: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{root}:{rel}"))
}

fn decode_file_id(file_id: &str) -> Option<(String, String)> {
    let decoded = URL_SAFE_NO_PAD.decode(file_id).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (root, rel) = text.split_once(':')?;
    Some((root.to_string(), rel.to_string()))
}

fn safe_rel(rel: &str) -> Option<PathBuf> {
    let path = FsPath::new(rel);
    if path.is_absolute() {
        return None;
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return None;
    }
    Some(path.to_path_buf())
}

async fn task_roots(state: &AppState, task_id: &str) -> ApiResult<Vec<(String, PathBuf)>> {
    let task = state.store.get_task(task_id).await?;
    let ws = state.store.get_workspace(&task.workspace_id).await?;
    Ok(vec![
        (
            "outputs".to_string(),
            PathBuf::from(ws.path).join("outputs").join(task_id),
        ),
        (
            "artifacts".to_string(),
            state.settings.task_artifacts_dir(task_id),
        ),
    ])
}

async fn task_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let mut files = Vec::new();
    for (root_name, root) in task_roots(&state, &id).await? {
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&root) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push(json!({
                    "id": encode_file_id(&root_name, &rel),
                    "root": root_name,
                    "path": rel,
                    "size": size,
                }));
            }
        }
    }
    files.sort_by(|a, b| {
        a["path"]
            .as_str()
            .unwrap_or("")
            .cmp(b["path"].as_str().unwrap_or(""))
    });
    Ok(Json(json!({"files": files})))
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "md" => "text/markdown; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" | "log" => "text/plain; charset=utf-8",
        "json" | "jsonl" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn resolve_task_file(
    state: &AppState,
    task_id: &str,
    file_id: &str,
) -> ApiResult<PathBuf> {
    let (root_name, rel) = decode_file_id(file_id)
        .ok_or_else(|| ApiError::bad_request("invalid file id"))?;
    let rel = safe_rel(&rel).ok_or_else(|| ApiError::bad_request("invalid file path"))?;
    let roots = task_roots(state, task_id).await?;
    let root = roots
        .into_iter()
        .find(|(name, _)| *name == root_name)
        .map(|(_, path)| path)
        .ok_or_else(|| ApiError::bad_request("invalid file root"))?;
    let path = root.join(rel);
    if !path.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(path)
}

async fn task_file_raw(
    State(state): State<AppState>,
    Path((id, file_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let path = resolve_task_file(&state, &id, &file_id).await?;
    let bytes = std::fs::read(&path)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type_for(&path)),
    );
    Ok((headers, bytes).into_response())
}

#[derive(Debug, Deserialize)]
struct FileOpenInput {
    file_id: String,
}

/// Best-effort: ask the host OS to open the file.
async fn task_file_open(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<FileOpenInput>,
) -> ApiResult<Json<Value>> {
    let path = resolve_task_file(&state, &id, &input.file_id).await?;
    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(target_os = "windows")]
    let opener = "explorer";
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let opener = "xdg-open";
    let spawned = spawn_child(
        opener,
        &[path.display().to_string()],
        &HashMap::new(),
    )
    .spawn()
    .is_ok();
    Ok(Json(json!({"ok": spawned})))
}

// ----------------------------------------------------------------------------
// Schedules
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScheduleCreateInput {
    name: String,
    cron_expr: String,
    workspace_id: String,
    skill_id: String,
    mode: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    payload: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

async fn list_schedules(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.store.list_schedules(false).await?)))
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(input): Json<ScheduleCreateInput>,
) -> ApiResult<Json<Value>> {
    if input.name.trim().is_empty() {
        return Err(ApiError::bad_request("name required"));
    }
    Cron::parse(&input.cron_expr)
        .map_err(|err| ApiError::bad_request(format!("invalid cron_expr: {err}")))?;
    state.store.get_workspace(&input.workspace_id).await?;
    state.store.get_skill(&input.skill_id).await?;
    let mode = parse_mode(input.mode.as_deref())?.unwrap_or(Mode::Fast);
    let schedule = state
        .store
        .create_schedule(
            input.name.trim(),
            input.cron_expr.trim(),
            &input.workspace_id,
            &input.skill_id,
            mode,
            input.enabled,
            input.payload,
        )
        .await?;
    Ok(Json(json!(schedule)))
}

async fn set_schedule_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<EnableInput>,
) -> ApiResult<Json<Value>> {
    state.store.get_schedule(&id).await?;
    state.store.set_schedule_enabled(&id, input.enabled).await?;
    Ok(Json(json!({"ok": true})))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.delete_schedule(&id).await?;
    Ok(Json(json!({"ok": true})))
}

// ----------------------------------------------------------------------------
// MCP servers
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct McpServerInput {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    healthcheck_args: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

async fn list_mcp_servers(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.store.list_mcp_servers(false).await?)))
}

async fn create_mcp_server(
    State(state): State<AppState>,
    Json(input): Json<McpServerInput>,
) -> ApiResult<Json<Value>> {
    if input.name.trim().is_empty() || input.command.trim().is_empty() {
        return Err(ApiError::bad_request("name and command required"));
    }
    let entry = state
        .store
        .create_mcp_server(
            input.name.trim(),
            input.command.trim(),
            &input.args,
            &input.env,
            &input.healthcheck_args,
            input.enabled,
        )
        .await?;
    Ok(Json(json!(entry)))
}

async fn update_mcp_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<McpServerInput>,
) -> ApiResult<Json<Value>> {
    let mut entry = state.store.get_mcp_server(&id).await?;
    entry.name = input.name.trim().to_string();
    entry.command = input.command.trim().to_string();
    entry.args = input.args;
    entry.env = input.env;
    entry.healthcheck_args = input.healthcheck_args;
    entry.enabled = input.enabled;
    state.store.update_mcp_server(&entry).await?;
    Ok(Json(json!(entry)))
}

async fn delete_mcp_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.delete_mcp_server(&id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn mcp_server_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let entry = state.store.get_mcp_server(&id).await?;
    let report = healthcheck(&entry).await;
    Ok(Json(json!(report)))
}

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let values = load_runtime_env(&state.settings.data_dir);
    Ok(Json(json!({
        "values": values,
        "allowed_keys": RUNTIME_ENV_ALLOWED_KEYS,
    })))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(updates): Json<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let values = update_runtime_env(&state.settings.data_dir, &updates)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({"ok": true, "values": values})))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use workbench_core::config::Settings;
    use workbench_core::permissions::{ApprovalDefaults, PolicyEngine};
    use workbench_core::runner::Runner;
    use workbench_providers::{ChatProvider, ChatRequest, ChatResponse};
    use workbench_store::{EventBus, Store};
    use workbench_tools::ToolRegistry;

    struct NullProvider;

    #[async_trait::async_trait]
    impl ChatProvider for NullProvider {
        async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse::default())
        }
    }

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let settings = Arc::new(Settings {
            db_path: data_dir.join("workbench.db"),
            workspaces_dir: data_dir.join("workspaces"),
            artifacts_dir: data_dir.join("artifacts"),
            logs_dir: data_dir.join("logs"),
            data_dir: data_dir.clone(),
            llm_base_url: String::new(),
            llm_api_key: String::new(),
            model_fast: "fast".into(),
            model_pro: "pro".into(),
            require_approval_shell: true,
            require_approval_fs_write: true,
            require_approval_fs_delete: true,
            require_approval_browser_click: true,
            scheduler_enabled: false,
            scheduler_tick_seconds: 5,
            shell_allow: false,
            shell_container_image: None,
            browser_enabled: false,
            browser_headless: true,
            browser_timeout_ms: 1,
            ui_admin_token: Some("secret".into()),
            log_retention_days: 14,
        });
        let bus = EventBus::new();
        let store = Arc::new(
            Store::open(&settings.db_path, bus.clone()).await.unwrap(),
        );
        let tools = ToolRegistry::new();
        let policy = Arc::new(PolicyEngine::new(store.clone(), ApprovalDefaults::default()));
        let provider: Arc<dyn ChatProvider> = Arc::new(NullProvider);
        let runner = Runner::new(
            store.clone(),
            tools.clone(),
            policy,
            provider.clone(),
            settings.clone(),
        );
        let state = AppState {
            store,
            event_bus: bus,
            settings,
            tools,
            runner,
            provider,
            admin_token: "secret".into(),
        };
        (state, dir)
    }

    #[tokio::test]
    async fn health_is_open() {
        let (state, _dir) = test_state().await;
        let app = app_router(state);
        let response = app
            .oneshot(
                HttpRequest::get("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mutating_routes_require_the_admin_token() {
        let (state, _dir) = test_state().await;
        let app = app_router(state);

        let denied = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/workspaces")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name": "W1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/workspaces")
                    .header("content-type", "application/json")
                    .header("x-admin-token", "secret")
                    .body(Body::from(r#"{"name": "W1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        // Query-parameter form works too.
        let via_query = app
            .oneshot(
                HttpRequest::post("/api/workspaces?token=secret")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name": "W2"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(via_query.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn schedule_with_bad_cron_is_rejected() {
        let (state, _dir) = test_state().await;
        let ws = state.store.create_workspace("W", "/tmp/w").await.unwrap();
        let skill = state
            .store
            .create_skill("S", None, None, "p", &[], Mode::Fast)
            .await
            .unwrap();
        let app = app_router(state);
        let body = json!({
            "name": "bad",
            "cron_expr": "whenever",
            "workspace_id": ws.id,
            "skill_id": skill.id,
        });
        let response = app
            .oneshot(
                HttpRequest::post("/api/schedules")
                    .header("content-type", "application/json")
                    .header("x-admin-token", "secret")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deleting_an_unknown_task_is_a_no_op() {
        let (state, _dir) = test_state().await;
        let app = app_router(state);
        let response = app
            .oneshot(
                HttpRequest::delete("/api/tasks/nope")
                    .header("x-admin-token", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn file_ids_round_trip_and_reject_escapes() {
        let id = encode_file_id("outputs", "report.md");
        assert_eq!(
            decode_file_id(&id),
            Some(("outputs".to_string(), "report.md".to_string()))
        );
        assert!(safe_rel("../etc/passwd").is_none());
        assert!(safe_rel("/abs").is_none());
        assert!(safe_rel("sub/report.md").is_some());
    }

    #[test]
    fn citation_sources_are_extracted_from_text() {
        let text = "Claim one [source: notes.txt]. See also https://example.com/a, done.";
        let sources = extract_citation_sources(text);
        assert!(sources.contains(&"notes.txt".to_string()));
        assert!(sources.contains(&"https://example.com/a".to_string()));
    }

    #[test]
    fn slug_is_filesystem_friendly() {
        assert_eq!(slug("My Workspace #1"), "my-workspace-1");
        assert_eq!(slug("   "), "workspace");
    }
}
