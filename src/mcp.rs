//! MCP server implementation using rmcp.
//!
//! A thin adapter exposing the session manager and file store as MCP tools.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::language::Language;
use crate::manager::SessionManager;
use crate::session::{FileRef, RunRequest, RunResult};
use crate::storage::StoredFile;

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer {
    manager: Arc<SessionManager>,
    tool_router: ToolRouter<Self>,
}

/// A stored file passed to a run.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileRefParams {
    #[schemars(description = "Id of a previously uploaded or generated file")]
    pub id: String,

    #[schemars(description = "Session owning the file (defaults to the run's session)")]
    pub session_id: Option<String>,
}

/// Parameters for the run_code tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCodeParams {
    #[schemars(description = "Language: python, javascript, java, cpp, go or r (aliases like 'py' work)")]
    pub language: String,

    #[schemars(description = "Source code to execute")]
    pub code: String,

    #[schemars(description = "Session to run in; reuse it to keep files between runs. Generated when omitted")]
    pub session_id: Option<String>,

    #[schemars(description = "Command-line arguments passed to the program")]
    #[serde(default)]
    pub args: Vec<String>,

    #[schemars(description = "Timeout in seconds, capped by the server maximum")]
    pub timeout_seconds: Option<u64>,

    #[schemars(description = "Stored files to copy into the working directory before running")]
    #[serde(default)]
    pub files: Vec<FileRefParams>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionParams {
    #[schemars(description = "Session identifier")]
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UploadFileParams {
    #[schemars(description = "Session to store the file under")]
    pub session_id: String,

    #[schemars(description = "File name used inside the sandbox working directory")]
    pub filename: String,

    #[schemars(description = "File content, base64 encoded")]
    pub content_base64: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileParams {
    #[schemars(description = "Session owning the file")]
    pub session_id: String,

    #[schemars(description = "File identifier")]
    pub file_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DownloadFileParams {
    #[schemars(description = "File identifier, as returned by upload_file or run_code")]
    pub file_id: String,

    #[schemars(description = "Session owning the file (all sessions are searched when omitted)")]
    pub session_id: Option<String>,
}

#[derive(Serialize)]
struct DownloadResponse {
    #[serde(flatten)]
    file: StoredFile,
    content_base64: String,
}

#[derive(Serialize)]
struct RunResponse {
    run_id: String,
    session_id: String,
    language: Language,
    #[serde(flatten)]
    result: RunResult,
}

#[tool_router]
impl SandboxServer {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    /// Execute code in a session, creating the session if needed.
    #[tool(description = "Run code in a persistent sandbox session. Files written to the working directory are returned as stored files")]
    async fn run_code(
        &self,
        Parameters(params): Parameters<RunCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        let language: Language = params.language.parse().map_err(to_mcp_error)?;
        let session_id = params
            .session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut request = RunRequest::new(session_id.clone(), language, params.code);
        request.args = params.args;
        request.timeout = params.timeout_seconds.map(Duration::from_secs);
        request.files = params
            .files
            .into_iter()
            .map(|f| FileRef {
                id: f.id,
                session_id: f.session_id,
            })
            .collect();

        let inputs = self
            .manager
            .resolve_input_files(&session_id, &request.files)
            .await
            .map_err(to_mcp_error)?;

        info!(session = %session_id, language = %language, code_len = request.code.len(), "Executing code");

        match self.manager.run_code(&request, &inputs).await {
            Ok(result) => {
                let is_error = result.exit_code != 0;
                let body = to_json(&RunResponse {
                    run_id: Uuid::new_v4().to_string(),
                    session_id,
                    language,
                    result,
                })?;
                if is_error {
                    Ok(CallToolResult::error(vec![Content::text(body)]))
                } else {
                    Ok(CallToolResult::success(vec![Content::text(body)]))
                }
            }
            Err(ProxyError::Timeout(timeout)) => Ok(CallToolResult::error(vec![Content::text(
                format!("Execution timed out after {}s", timeout.as_secs()),
            )])),
            Err(e @ (ProxyError::Validation(_) | ProxyError::NotFound(_))) => Err(to_mcp_error(e)),
            Err(e) => {
                error!(session = %session_id, error = %e, "Execution failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Execution error: {e}"
                ))]))
            }
        }
    }

    #[tool(description = "List active sandbox sessions with their age and expiry state")]
    async fn list_sessions(&self) -> Result<CallToolResult, McpError> {
        let sessions = self.manager.list_sessions().await;
        Ok(CallToolResult::success(vec![Content::text(to_json(&sessions)?)]))
    }

    #[tool(description = "Delete a session, its sandbox and all of its files")]
    async fn delete_session(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        if !self.manager.delete_session(&params.session_id).await {
            return Err(McpError::resource_not_found(
                format!("Session '{}' not found", params.session_id),
                None,
            ));
        }
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Session '{}' deleted",
            params.session_id
        ))]))
    }

    #[tool(description = "Store a file for a session so runs can reference it")]
    async fn upload_file(
        &self,
        Parameters(params): Parameters<UploadFileParams>,
    ) -> Result<CallToolResult, McpError> {
        let content = base64::engine::general_purpose::STANDARD
            .decode(params.content_base64.trim())
            .map_err(|e| McpError::invalid_params(format!("Invalid base64 content: {e}"), None))?;

        let stored = self
            .manager
            .store()
            .save_file(&params.session_id, &params.filename, &content)
            .await
            .map_err(to_mcp_error)?;
        info!(session = %params.session_id, file = %stored.id, size = stored.size, "Uploaded file");
        Ok(CallToolResult::success(vec![Content::text(to_json(&stored)?)]))
    }

    #[tool(description = "List the files stored for a session")]
    async fn list_files(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let files = self.manager.store().list_files(&params.session_id).await;
        Ok(CallToolResult::success(vec![Content::text(to_json(&files)?)]))
    }

    #[tool(description = "Fetch a stored file's metadata and base64-encoded content")]
    async fn download_file(
        &self,
        Parameters(params): Parameters<DownloadFileParams>,
    ) -> Result<CallToolResult, McpError> {
        let store = self.manager.store();
        let found = match params.session_id.as_deref().filter(|id| !id.is_empty()) {
            Some(session_id) => store.get_file(session_id, &params.file_id).await,
            None => store.find_file(&params.file_id).await,
        };
        let Some(file) = found else {
            return Err(McpError::resource_not_found(
                format!("File '{}' not found", params.file_id),
                None,
            ));
        };

        let content = tokio::fs::read(&file.path).await.map_err(|e| {
            error!(file = %file.id, error = %e, "Failed to read stored file");
            McpError::internal_error(format!("Failed to read file '{}'", file.id), None)
        })?;
        let response = DownloadResponse {
            content_base64: base64::engine::general_purpose::STANDARD.encode(content),
            file,
        };
        Ok(CallToolResult::success(vec![Content::text(to_json(&response)?)]))
    }

    #[tool(description = "Delete one stored file")]
    async fn delete_file(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        if !self
            .manager
            .store()
            .delete_file(&params.session_id, &params.file_id)
            .await
        {
            return Err(McpError::resource_not_found(
                format!("File '{}' not found", params.file_id),
                None,
            ));
        }
        Ok(CallToolResult::success(vec![Content::text(format!(
            "File '{}' deleted",
            params.file_id
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let languages: Vec<_> = self
            .manager
            .config()
            .supported_languages
            .iter()
            .map(|l| l.as_str())
            .collect();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "code-interpreter-proxy".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run code in persistent sandbox sessions.\n\
                 Supported languages: {languages:?}\n\
                 \n\
                 Use 'run_code' with a session_id to keep files between runs.\n\
                 Upload inputs with 'upload_file' and pass their ids in 'files'.\n\
                 Fetch generated files with 'download_file'."
            )),
        }
    }
}

fn to_mcp_error(error: ProxyError) -> McpError {
    match error {
        ProxyError::Validation(message) => McpError::invalid_params(message, None),
        ProxyError::NotFound(message) => McpError::resource_not_found(message, None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Failed to encode response: {e}"), None))
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio(manager: Arc<SessionManager>) -> anyhow::Result<()> {
    let server = SandboxServer::new(manager);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
