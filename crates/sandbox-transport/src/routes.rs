//! axum routes for the sandbox tool surface.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    routing::{get, post},
};
use futures::stream::BoxStream;
use remote_sandbox_core::{OutputBroker, SandboxConfig};
use remote_sandbox_executor::{
    ExecuteRequest, ExecutionCoordinator, ExecutionResult, FileContent, WorkspaceFiles, WriteFileRequest,
    WriteFileResult,
};
use remote_sandbox_session::{ReconnectionResolver, SessionRegistry};

use crate::{
    ApiError, FileListResponse, FilesQuery, ReadFileQuery, StreamQuery,
    protocol::present,
};

/// Shared state of the sandbox routes.
#[derive(Clone)]
pub struct SandboxState {
    broker: Arc<OutputBroker>,
    coordinator: Arc<ExecutionCoordinator>,
    files: WorkspaceFiles,
}

impl SandboxState {
    /// Wire broker, coordinator and file access around one registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: &SandboxConfig) -> Self {
        let broker = Arc::new(OutputBroker::new(config.stream_grace));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&broker),
            config,
        ));
        let files = WorkspaceFiles::new(ReconnectionResolver::new(registry), config.file_preview_limit);
        Self {
            broker,
            coordinator,
            files,
        }
    }

    #[must_use]
    pub const fn broker(&self) -> &Arc<OutputBroker> {
        &self.broker
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }
}

/// Create the sandbox router.
///
/// # Example
/// ```ignore
/// let app = Router::new().merge(router(SandboxState::new(registry, &config)));
/// ```
#[must_use]
pub fn router(state: SandboxState) -> Router {
    Router::new()
        .route("/api/sandbox/stream", get(stream_handler))
        .route("/api/sandbox/files", get(list_files_handler))
        .route("/api/sandbox/files/read", get(read_file_handler))
        .route("/api/sandbox/files/write", post(write_file_handler))
        .route("/api/sandbox/execute", post(execute_handler))
        .with_state(state)
}

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// Live output of a chat's current (or just finished) execution.
///
/// The response ends after the `done` event. Closing the connection only
/// unsubscribes; the command keeps running.
async fn stream_handler(
    State(state): State<SandboxState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    let chat_id = present(query.chat_id.as_ref()).ok_or(ApiError::BadRequest("Missing chatId parameter"))?;
    tracing::debug!(chat_id, "Output stream subscribed");
    let events = state.broker.subscribe(chat_id).into_sse_stream();
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn list_files_handler(
    State(state): State<SandboxState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<FileListResponse>, ApiError> {
    let chat_id = present(query.chat_id.as_ref()).ok_or(ApiError::BadRequest("Missing chatId"))?;
    let files = state.files.list(chat_id, present(query.remote_id.as_ref())).await;
    Ok(Json(FileListResponse { files }))
}

async fn read_file_handler(
    State(state): State<SandboxState>,
    Query(query): Query<ReadFileQuery>,
) -> Result<Json<FileContent>, ApiError> {
    let (Some(chat_id), Some(path)) = (present(query.chat_id.as_ref()), present(query.path.as_ref())) else {
        return Err(ApiError::BadRequest("Missing chatId or path"));
    };
    state
        .files
        .read(chat_id, path, present(query.remote_id.as_ref()))
        .await
        .map(Json)
        .ok_or(ApiError::FileNotFound)
}

async fn execute_handler(
    State(state): State<SandboxState>,
    Json(request): Json<ExecuteRequest>,
) -> Json<ExecutionResult> {
    tracing::debug!(
        language = %request.language,
        conversation_id = request.conversation_id.as_deref(),
        "Execute request"
    );
    Json(state.coordinator.execute(&request).await)
}

async fn write_file_handler(
    State(state): State<SandboxState>,
    Json(request): Json<WriteFileRequest>,
) -> Json<WriteFileResult> {
    tracing::debug!(
        file_path = %request.file_path,
        conversation_id = request.conversation_id.as_deref(),
        "Write file request"
    );
    Json(state.coordinator.write_file(&request).await)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use remote_sandbox_core::{
        CommandParts, SandboxProvider,
        mock::{MockProvider, MockReply},
    };
    use remote_sandbox_session::RegistryConfig;
    use tower::ServiceExt;

    use super::*;

    fn responder(cmd: &CommandParts) -> MockReply {
        let script = cmd.args.get(1).map_or("", String::as_str);
        match cmd.program.as_str() {
            "python3" => MockReply::stdout("42\n"),
            "sh" if script.starts_with("find") => MockReply::stdout("f 12 /vercel/sandbox/main.py\n"),
            _ => MockReply::default(),
        }
    }

    fn app() -> (Arc<MockProvider>, Router) {
        let provider = Arc::new(MockProvider::with_responder(responder));
        let config = SandboxConfig::default();
        let registry = SessionRegistry::new(
            Arc::clone(&provider) as Arc<dyn SandboxProvider>,
            RegistryConfig::from(&config),
        );
        (provider, router(SandboxState::new(registry, &config)))
    }

    async fn get_request(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> serde_json::Value {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_missing_parameters_are_rejected() {
        let (_, app) = app();

        let (status, body) = get_request(app.clone(), "/api/sandbox/stream").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, r#"{"error":"Missing chatId parameter"}"#);

        let (status, _) = get_request(app.clone(), "/api/sandbox/files?chatId=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get_request(app, "/api/sandbox/files/read?chatId=c1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, r#"{"error":"Missing chatId or path"}"#);
    }

    #[tokio::test]
    async fn test_unknown_chat_has_no_files() {
        let (_, app) = app();

        let (status, body) = get_request(app.clone(), "/api/sandbox/files?chatId=nobody").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"files":[]}"#);

        let (status, body) = get_request(app, "/api/sandbox/files/read?chatId=nobody&path=/x&remoteId=sbx_gone").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, r#"{"error":"File not found or sandbox expired"}"#);
    }

    #[tokio::test]
    async fn test_execute_then_replay_stream_and_list_files() {
        let (provider, app) = app();

        let result = post_json(
            app.clone(),
            "/api/sandbox/execute",
            serde_json::json!({"language": "python", "code": "print(40+2)", "conversationId": "c1"}),
        )
        .await;
        assert_eq!(
            result,
            serde_json::json!({"stdout": "42\n", "stderr": "", "exitCode": 0, "remoteId": "sbx_mock_1"})
        );
        assert_eq!(provider.create_count(), 1);

        // Joining within the grace window replays the finished run.
        let (status, body) = get_request(app.clone(), "/api/sandbox/stream?chatId=c1").await;
        assert_eq!(status, StatusCode::OK);
        let stdout = body.find(r#"data: {"type":"stdout","data":"42\n"}"#).unwrap();
        let done = body.find(r#"data: {"type":"done"}"#).unwrap();
        assert!(stdout < done);

        let (status, body) = get_request(app, "/api/sandbox/files?chatId=c1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"files":[{"path":"/vercel/sandbox/main.py","type":"file","size":12}]}"#);
    }

    #[tokio::test]
    async fn test_write_file_route() {
        let (provider, app) = app();

        let result = post_json(
            app,
            "/api/sandbox/files/write",
            serde_json::json!({"filePath": "notes.md", "content": "# hi", "language": "python"}),
        )
        .await;
        assert_eq!(result, serde_json::json!({"success": true, "filePath": "notes.md"}));
        assert!(provider.created()[0].is_stopped());
    }
}
