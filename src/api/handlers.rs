//! Request handlers for the control API.
//!
//! Every handler drains the manager's status stream before acting, so
//! decisions are made against the freshest view. Client errors map to
//! 4xx with a JSON `reason`; the 418 responses for time-travel requests
//! keep the teapot wording existing clients match on.

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::api::{ApiState, TRANSFER_SIZE_LIMIT, session_id};
use crate::protocol::{Command, StatusEvent};
use crate::stage::Stage;

#[derive(Deserialize)]
pub struct RunPostQuery {
    test: Option<String>,
    #[serde(rename = "break")]
    break_at: Option<String>,
    heartbeat: Option<u64>,
}

#[derive(Deserialize)]
pub struct RunGetQuery {
    session: String,
    #[serde(rename = "break")]
    break_at: Option<String>,
    heartbeat: Option<u64>,
}

#[derive(Deserialize)]
pub struct SessionQuery {
    session: String,
}

#[derive(Deserialize)]
pub struct StatusQuery {
    session: Option<String>,
}

#[derive(Deserialize)]
pub struct ArtifactQuery {
    session: String,
    filename: Option<String>,
    maxsize: Option<u64>,
}

#[derive(Deserialize)]
pub struct UploadQuery {
    session: String,
    filename: String,
}

fn reply(code: StatusCode, body: Value) -> Response {
    (code, axum::Json(body)).into_response()
}

/// Reply fields with the session status overlaid. The status's own fields
/// win over the handler's boilerplate, so a stored `reason` (e.g. a worker
/// death report) survives into the reply.
fn reply_with_status(code: StatusCode, event: &StatusEvent, extra: Value) -> Response {
    let mut body = extra;
    if let (Some(map), Ok(Value::Object(status_fields))) =
        (body.as_object_mut(), serde_json::to_value(event))
    {
        map.extend(status_fields);
    }
    reply(code, body)
}

fn invalid_break() -> Response {
    reply(
        StatusCode::BAD_REQUEST,
        json!({
            "reason": "Specified break is not a valid test stage name.",
            "hint": {"breakpoints": Stage::names()},
        }),
    )
}

fn unknown_session(session: &str) -> Response {
    reply(
        StatusCode::NOT_FOUND,
        json!({"reason": "No session with this ID.", "session": session}),
    )
}

fn parse_break(raw: Option<&str>) -> Result<Stage, Response> {
    raw.unwrap_or("finished").parse().map_err(|_| invalid_break())
}

/// A name usable as a single path component inside a session directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

/// `POST /run` — admit a new session.
pub async fn run_post(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RunPostQuery>,
    config: Bytes,
) -> Response {
    state.drain_status().await;
    let break_at = match parse_break(query.break_at.as_deref()) {
        Ok(stage) => stage,
        Err(response) => return response,
    };

    let session_id = {
        let mut view = state.view.lock().await;
        if let Some(running) = view.running_id.clone() {
            let running_status = view.sessions.get(&running).cloned().unwrap_or_else(|| {
                StatusEvent::starting(&running, Stage::Finished)
            });
            return reply_with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                &running_status,
                json!({"reason": "Another test is already running."}),
            );
        }

        let (session_id, _work_dir) =
            match session_id::claim(&state.tests_dir, query.test.as_deref()) {
                Ok(claimed) => claimed,
                Err(session_id::SessionIdError::Exhausted) => {
                    return reply(
                        StatusCode::SERVICE_UNAVAILABLE,
                        json!({"reason": "Failed to generate session id."}),
                    );
                }
                Err(err) => {
                    return reply(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({"reason": format!("Failed to create working directory: {err}")}),
                    );
                }
            };

        view.admit(&session_id, break_at, query.heartbeat.map(Duration::from_secs));
        session_id
    };

    info!(session = session_id, %break_at, "admitting new session");
    let run = Command::Run {
        session: session_id.clone(),
        break_at,
        config: Some(config.to_vec()),
    };
    if state.command(run).await.is_err() {
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"reason": "Manager is not accepting commands."}),
        );
    }
    reply(StatusCode::OK, json!({"test": session_id, "session": session_id}))
}

/// `GET /run` — advance the break of the running session.
pub async fn run_get(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RunGetQuery>,
) -> Response {
    state.drain_status().await;
    let break_at = match parse_break(query.break_at.as_deref()) {
        Ok(stage) => stage,
        Err(response) => return response,
    };

    {
        let mut view = state.view.lock().await;
        let Some(event) = view.sessions.get(&query.session).cloned() else {
            return unknown_session(&query.session);
        };
        let is_running = view.running_id.as_deref() == Some(query.session.as_str());
        let time_travel = event.break_at.is_some_and(|current| break_at.is_earlier(current));
        if !is_running || time_travel {
            return reply_with_status(
                StatusCode::IM_A_TEAPOT,
                &event,
                json!({
                    "reason": "I am a teapot! I know nothing of time-travel!",
                    "hint": {"breakpoints": Stage::names()},
                }),
            );
        }
        if let Some(heartbeat) = query.heartbeat {
            view.hb_timeout = Duration::from_secs(heartbeat);
        }
        view.touch(&query.session);
    }

    let run = Command::Run { session: query.session.clone(), break_at, config: None };
    if state.command(run).await.is_err() {
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"reason": "Manager is not accepting commands."}),
        );
    }
    reply(StatusCode::OK, json!({"reason": format!("Will try to set break before {break_at}")}))
}

/// `GET /stop` — soft-stop a session.
pub async fn stop(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    state.drain_status().await;
    {
        let mut view = state.view.lock().await;
        let Some(event) = view.sessions.get(&query.session) else {
            return unknown_session(&query.session);
        };
        if event.status.is_terminal() {
            return reply(
                StatusCode::CONFLICT,
                json!({"reason": "This session is already stopped.", "session": query.session}),
            );
        }
        view.touch(&query.session);
    }

    if state.command(Command::Stop { session: query.session }).await.is_err() {
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"reason": "Manager is not accepting commands."}),
        );
    }
    reply(StatusCode::OK, json!({"reason": "Will try to stop tank process."}))
}

/// `GET /status` — one session's status, or the whole map.
pub async fn status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    state.drain_status().await;
    let mut view = state.view.lock().await;
    match query.session {
        Some(session) => match view.sessions.get(&session).cloned() {
            Some(event) => {
                view.touch(&session);
                reply(StatusCode::OK, serde_json::to_value(&event).unwrap_or_else(|_| json!({})))
            }
            None => unknown_session(&session),
        },
        None => reply(
            StatusCode::OK,
            serde_json::to_value(&view.sessions).unwrap_or_else(|_| json!({})),
        ),
    }
}

/// Whether any known session is still running a stage before
/// `postprocess`; large artifact downloads would contend with it.
fn test_running_before_postprocess(sessions: &std::collections::HashMap<String, StatusEvent>) -> bool {
    sessions.values().any(|event| {
        !event.status.is_terminal()
            && event
                .current_stage
                .is_none_or(|stage| stage.is_earlier(Stage::Postprocess))
    })
}

/// `GET /artifact` — list session files, or stream one of them.
pub async fn artifact(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ArtifactQuery>,
) -> Response {
    state.drain_status().await;

    let work_dir = state.tests_dir.join(&query.session);
    if !is_plain_name(&query.session) || !work_dir.is_dir() {
        return reply(
            StatusCode::NOT_FOUND,
            json!({"reason": "No test with this ID found", "test": query.session}),
        );
    }
    // Any test that went past the lock stage has a status.json.
    if !work_dir.join("status.json").is_file() {
        return reply(
            StatusCode::NOT_FOUND,
            json!({"reason": "Test was not performed, no artifacts.", "test": query.session}),
        );
    }

    let Some(filename) = query.filename else {
        return list_artifacts(&work_dir);
    };

    let file_path = work_dir.join(&filename);
    if !is_plain_name(&filename) || !file_path.is_file() {
        return reply(
            StatusCode::NOT_FOUND,
            json!({"reason": "No such file", "test": query.session, "filename": filename}),
        );
    }

    let file_size = match std::fs::metadata(&file_path) {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            return reply(
                StatusCode::NOT_FOUND,
                json!({"reason": format!("No such file: {err}"), "filename": filename}),
            );
        }
    };

    if let Some(maxsize) = query.maxsize {
        if file_size > maxsize {
            return reply(
                StatusCode::CONFLICT,
                json!({
                    "reason": "File is too large",
                    "filename": filename,
                    "filesize": file_size,
                    "maxsize": maxsize,
                }),
            );
        }
    }

    {
        let mut view = state.view.lock().await;
        if file_size > TRANSFER_SIZE_LIMIT && test_running_before_postprocess(&view.sessions) {
            return reply(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "reason": "File is too large and test is running",
                    "test": query.session,
                    "filename": filename,
                    "filesize": file_size,
                    "limit": TRANSFER_SIZE_LIMIT,
                }),
            );
        }
        view.touch(&query.session);
    }

    stream_file(&file_path).await
}

fn list_artifacts(work_dir: &Path) -> Response {
    let entries = match std::fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(err) => {
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"reason": format!("Failed to list artifacts: {err}")}),
            );
        }
    };
    let mut files: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    reply(StatusCode::OK, json!(files))
}

async fn stream_file(path: &Path) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return reply(
                StatusCode::NOT_FOUND,
                json!({"reason": format!("No such file: {err}")}),
            );
        }
    };
    let stream = ReaderStream::with_capacity(file, TRANSFER_SIZE_LIMIT as usize);
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// `POST /upload` — store a file into the running session's working
/// directory.
pub async fn upload(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<UploadQuery>,
    contents: Bytes,
) -> Response {
    state.drain_status().await;
    {
        let mut view = state.view.lock().await;
        if view.running_id.as_deref() != Some(query.session.as_str()) {
            return reply(
                StatusCode::NOT_FOUND,
                json!({"reason": "Session is not running.", "session": query.session}),
            );
        }
        view.touch(&query.session);
    }

    if !is_plain_name(&query.filename) {
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"reason": "Filename must be a plain file name.", "filename": query.filename}),
        );
    }

    let path = state.tests_dir.join(&query.session).join(&query.filename);
    if let Err(err) = tokio::fs::write(&path, &contents).await {
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"reason": format!("Failed to store file: {err}")}),
        );
    }
    info!(session = query.session, filename = query.filename, "stored uploaded file");
    reply(StatusCode::OK, json!({"session": query.session, "filename": query.filename}))
}
