use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    chat::{Answer, Tutor},
    config::Config,
    config_db::ConfigDb,
    error,
    llm::LanguageModel,
    retrieval::{Retrieved, Retriever},
    session_store::{DEFAULT_SESSION, SessionStore},
    text_util::{DEFAULT_SNIPPET_MAX_CHARS, extract_snippet},
};

const DEFAULT_SEARCH_LIMIT: usize = 5;

pub(crate) struct McpState {
    config: Config,
    config_db: ConfigDb,
    retriever: Retriever,
    /// The chat model, or why it could not be set up.
    language_model: Result<Box<dyn LanguageModel>, String>,
    /// Held across load, ask and save of one session id.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl McpState {
    fn new(
        config: Config,
        config_db: ConfigDb,
        retriever: Retriever,
        language_model: Result<Box<dyn LanguageModel>, String>,
    ) -> Self {
        Self {
            config,
            config_db,
            retriever,
            language_model,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_lock(
        &self,
        session: &str,
    ) -> Result<Arc<Mutex<()>>, rmcp::ErrorData> {
        let mut locks = self
            .session_locks
            .lock()
            .map_err(|_| mcp_error("session lock poisoned", session))?;
        Ok(Arc::clone(locks.entry(session.to_string()).or_default()))
    }
}

#[derive(Clone)]
pub struct CoursedexMcpServer {
    state: Arc<McpState>,
    tool_router: ToolRouter<Self>,
}

impl CoursedexMcpServer {
    fn new(state: Arc<McpState>) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }

    /// Run blocking work (HTTP calls, redb) off the async executor.
    async fn blocking<T, F>(&self, work: F) -> Result<T, rmcp::ErrorData>
    where
        T: Send + 'static,
        F: FnOnce(&McpState) -> Result<T, rmcp::ErrorData> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || work(state.as_ref()))
            .await
            .map_err(|e| mcp_error("worker task failed", e))?
    }
}

#[tool_router(router = tool_router)]
impl CoursedexMcpServer {
    /// Search the course material for chunks relevant to a query.
    #[tool(
        name = "coursedex_search",
        description = "Search the indexed course material. Returns the closest chunks with their section labels."
    )]
    pub async fn coursedex_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let query = params.query.clone();

        let results = self
            .blocking(move |state| {
                let k = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
                let retrieval = &state.config.retrieval;
                let results = if params.similarity.unwrap_or(false) {
                    state.retriever.similarity(&params.query, k)
                } else {
                    state.retriever.mmr(
                        &params.query,
                        k,
                        retrieval.fetch_k.max(k),
                        retrieval.lambda,
                    )
                };
                results.map_err(|e| mcp_error("search failed", e))
            })
            .await?;

        let items: Vec<SearchResultItem> = results
            .into_iter()
            .map(|r| SearchResultItem::new(r, &query))
            .collect();
        let summary = format_search_summary(&items, &query);
        let structured = serde_json::to_value(SearchResponse {
            query,
            result_count: items.len(),
            results: items,
        })
        .map_err(|e| mcp_error("failed to serialize search results", e))?;

        Ok(CallToolResult {
            content: vec![Content::text(summary)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Ask the course tutor a question.
    #[tool(
        name = "coursedex_ask",
        description = "Ask the course tutor a question. Follow-ups in the same session see earlier exchanges."
    )]
    pub async fn coursedex_ask(
        &self,
        params: Parameters<AskParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;

        let answer = self
            .blocking(move |state| {
                let model = state.language_model.as_ref().map_err(|reason| {
                    rmcp::ErrorData::internal_error(
                        format!("chat model unavailable: {reason}"),
                        None,
                    )
                })?;
                let session =
                    params.session.as_deref().unwrap_or(DEFAULT_SESSION);
                let lock = state.session_lock(session)?;
                let _guard = lock
                    .lock()
                    .map_err(|_| mcp_error("session lock poisoned", session))?;
                let sessions = SessionStore::new(
                    &state.config_db,
                    state.config.chat.history_turns,
                );
                let mut history = sessions
                    .load(session)
                    .map_err(|e| mcp_error("failed to load session", e))?;

                let tutor = Tutor::new(
                    &state.retriever,
                    model.as_ref(),
                    &state.config.chat,
                    &state.config.retrieval,
                );
                let answer = tutor
                    .ask(&mut history, &params.question)
                    .map_err(|e| mcp_error("ask failed", e))?;
                sessions
                    .save(session, &history)
                    .map_err(|e| mcp_error("failed to save session", e))?;
                Ok(answer)
            })
            .await?;

        let summary = format_answer_summary(&answer);
        let structured = serde_json::to_value(&answer)
            .map_err(|e| mcp_error("failed to serialize answer", e))?;

        Ok(CallToolResult {
            content: vec![Content::text(summary)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for CoursedexMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "coursedex".to_string(),
                title: Some("coursedex MCP".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Use coursedex_search to find passages in the study \
                 material for {}. Use coursedex_ask for tutoring answers \
                 grounded in that material.",
                self.state.config.chat.course_name
            )),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Search query string.
    pub query: String,
    /// Maximum number of results (default: 5).
    pub limit: Option<usize>,
    /// Plain nearest-neighbour order instead of diverse (MMR) results.
    pub similarity: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AskParams {
    /// The question for the tutor.
    pub question: String,
    /// Conversation session id (default: "default").
    pub session: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    query: String,
    result_count: usize,
    results: Vec<SearchResultItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultItem {
    id: u64,
    section: String,
    distance: f32,
    text: String,
    snippet: Option<String>,
}

impl SearchResultItem {
    fn new(r: Retrieved, query: &str) -> Self {
        Self {
            snippet: extract_snippet(
                &r.chunk.text,
                query,
                DEFAULT_SNIPPET_MAX_CHARS,
            ),
            id: r.id,
            section: r.chunk.section,
            distance: r.distance,
            text: r.chunk.text,
        }
    }
}

fn format_search_summary(results: &[SearchResultItem], query: &str) -> String {
    if results.is_empty() {
        return format!("No results found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} result{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for item in results {
        lines.push(format!(
            "#{} {:.3} [{}] {}",
            item.id,
            item.distance,
            item.section,
            item.snippet.as_deref().unwrap_or_default()
        ));
    }

    lines.join("\n")
}

fn format_answer_summary(answer: &Answer) -> String {
    if answer.sources.is_empty() {
        return answer.text.clone();
    }
    let sections: Vec<String> = answer
        .sources
        .iter()
        .map(|s| format!("{} #{}", s.chunk.section, s.id))
        .collect();
    format!("{}\n\nSources: {}", answer.text, sections.join(", "))
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(
    config: Config,
    config_db: ConfigDb,
    retriever: Retriever,
    language_model: Result<Box<dyn LanguageModel>, String>,
) -> error::Result<()> {
    if let Err(reason) = &language_model {
        tracing::warn!(%reason, "coursedex_ask is unavailable");
    }

    let state = Arc::new(McpState::new(
        config,
        config_db,
        retriever,
        language_model,
    ));
    let server = CoursedexMcpServer::new(Arc::clone(&state));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    let served = runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        running.waiting().await.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    });

    // Blocking HTTP clients must not be dropped on the async executor.
    drop(runtime);
    drop(state);
    served
}
