use anyhow::Result;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{
    ErrorData as McpError, ServerHandler, model::*, schemars, tool, tool_handler, tool_router,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::extractor::{Entity, Extractor};
use crate::linker::{Linker, LinkerResponse};
use crate::retriever::{RetrieveParams, VectorSearchRetriever};
use crate::vector_search::{FilterClause, VectorSearch};

/// Maximum allowed top_k to prevent DoS via memory exhaustion
pub const MAX_TOP_K: usize = 100;

#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct EntityInput {
    #[serde(rename = "type")]
    #[schemars(description = "Entity type, e.g. Person or Organization")]
    pub entity_type: String,
    #[schemars(description = "Entity mention as it appears in the text")]
    pub name: serde_json::Value,
}

impl From<EntityInput> for Entity {
    fn from(input: EntityInput) -> Self {
        Entity::new(input.entity_type, input.name)
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct ExtractRequest {
    #[schemars(description = "Text to extract entities from")]
    pub text: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct LinkRequest {
    #[schemars(description = "Text the entities were mentioned in")]
    pub text: String,
    #[schemars(description = "Entities to link against the knowledge base")]
    pub entities: Vec<EntityInput>,
    #[schemars(description = "Candidates retrieved per entity (default: LINK_TOP_K)")]
    pub top_k: Option<usize>,
    #[schemars(description = "Minimum candidate similarity (default: LINK_SCORE_THRESHOLD)")]
    pub score_threshold: Option<f32>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct ExtractAndLinkRequest {
    #[schemars(description = "Text to extract and link entities from")]
    pub text: String,
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct SearchRequest {
    #[schemars(description = "The search query")]
    pub query: String,
    #[schemars(description = "Number of results to return (default: 5)")]
    pub top_k: Option<usize>,
    #[schemars(description = "Minimum similarity for scored documents (default: 0.0)")]
    pub score_threshold: Option<f32>,
    #[schemars(
        description = "Optional filter clauses: [{key, type?: must|must_not|should, range?|match?|in?}]"
    )]
    pub filters: Option<serde_json::Value>,
}

/// Shared services behind both the MCP tools and the plain HTTP endpoints.
#[derive(Clone)]
pub struct AppState {
    pub linker: Arc<Linker>,
    pub extractor: Arc<Extractor>,
    pub retriever: Arc<VectorSearchRetriever>,
    pub vector_search: Arc<dyn VectorSearch>,
    pub default_top_k: usize,
    pub default_score_threshold: f32,
}

impl AppState {
    fn top_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_top_k).clamp(1, MAX_TOP_K)
    }

    fn score_threshold(&self, requested: Option<f32>) -> f32 {
        requested.unwrap_or(self.default_score_threshold)
    }

    async fn extract_and_link(
        &self,
        text: &str,
        top_k: Option<usize>,
        score_threshold: Option<f32>,
    ) -> Result<LinkerResponse> {
        let entities = self.extractor.extract(text).await?;
        self.linker
            .link(text, entities, self.top_k(top_k), self.score_threshold(score_threshold))
            .await
    }
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value).map_err(|e| McpError::internal_error(e.to_string(), None))
}

#[derive(Clone)]
pub struct LinkerMcpServer {
    tool_router: ToolRouter<Self>,
    state: AppState,
}

#[tool_router]
impl LinkerMcpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            tool_router: Self::tool_router(),
            state,
        }
    }

    #[tool(description = "Extract typed named entities from text")]
    async fn extract_entities(
        &self,
        Parameters(params): Parameters<ExtractRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.state.extractor.extract(&params.text).await {
            Ok(entities) => Ok(CallToolResult::success(vec![Content::text(to_pretty_json(
                &entities,
            )?)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Extraction error: {e}"
            ))])),
        }
    }

    #[tool(
        description = "Link entity mentions to knowledge-base records using vector search and LLM verification"
    )]
    async fn link_entities(
        &self,
        Parameters(params): Parameters<LinkRequest>,
    ) -> Result<CallToolResult, McpError> {
        let entities: Vec<Entity> = params.entities.into_iter().map(Entity::from).collect();
        let result = self
            .state
            .linker
            .link(
                &params.text,
                entities,
                self.state.top_k(params.top_k),
                self.state.score_threshold(params.score_threshold),
            )
            .await;

        match result {
            Ok(response) => Ok(CallToolResult::success(vec![Content::text(to_pretty_json(
                &response,
            )?)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Linking error: {e}"
            ))])),
        }
    }

    #[tool(description = "Extract entities from text and link them to knowledge-base records")]
    async fn extract_and_link(
        &self,
        Parameters(params): Parameters<ExtractAndLinkRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .state
            .extract_and_link(&params.text, params.top_k, params.score_threshold)
            .await
        {
            Ok(response) => Ok(CallToolResult::success(vec![Content::text(to_pretty_json(
                &response,
            )?)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Linking error: {e}"
            ))])),
        }
    }

    #[tool(description = "Search indexed documents by semantic similarity with optional filters")]
    async fn search_documents(
        &self,
        Parameters(params): Parameters<SearchRequest>,
    ) -> Result<CallToolResult, McpError> {
        let filters: Vec<FilterClause> = match params.filters {
            Some(raw) => match serde_json::from_value(raw) {
                Ok(filters) => filters,
                Err(e) => {
                    return Ok(CallToolResult::error(vec![Content::text(format!(
                        "Invalid filters: {e}"
                    ))]));
                }
            },
            None => Vec::new(),
        };
        let retrieve_params = RetrieveParams {
            top_k: self.state.top_k(params.top_k),
            score_threshold: params.score_threshold.unwrap_or(0.0),
            filters,
        };

        match self
            .state
            .retriever
            .retrieve_for_query(&params.query, &retrieve_params)
            .await
        {
            Ok(docs) if docs.is_empty() => Ok(CallToolResult::success(vec![Content::text(
                "No results found.".to_string(),
            )])),
            Ok(docs) => {
                let formatted = docs
                    .iter()
                    .enumerate()
                    .map(|(i, doc)| {
                        format!(
                            "**Result {}** [{}] (source: {}, idx {})\n{}\n",
                            i + 1,
                            doc.id.as_deref().unwrap_or("-"),
                            doc.source_id.as_deref().unwrap_or("-"),
                            doc.index.map_or_else(|| "-".to_string(), |idx| idx.to_string()),
                            doc.content
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n---\n\n");
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Found {} results for '{}':\n\n{}",
                    docs.len(),
                    params.query,
                    formatted
                ))]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Search error: {e}"
            ))])),
        }
    }
}

#[tool_handler]
impl ServerHandler for LinkerMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "rust-entity-linker".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Extracts named entities from text and links them to records of a vector-indexed knowledge base."
                    .to_string(),
            ),
        }
    }
}

/// Liveness handler - always returns 200 OK if process is alive
async fn healthz() -> axum::http::StatusCode {
    axum::http::StatusCode::OK
}

/// Readiness handler - returns 200 when the vector index answers in time
async fn readyz(
    axum::extract::State(app_state): axum::extract::State<AppState>,
) -> axum::http::StatusCode {
    match tokio::time::timeout(
        std::time::Duration::from_millis(500),
        app_state.vector_search.list_documents(1, &[]),
    )
    .await
    {
        Ok(Ok(_)) => axum::http::StatusCode::OK,
        Ok(Err(e)) => {
            tracing::warn!("Readiness check failed: {}", e);
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        }
        Err(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Debug, serde::Deserialize)]
struct HttpLinkRequest {
    text: String,
    /// Extracted from `text` when omitted.
    #[serde(default)]
    entities: Option<Vec<Entity>>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    score_threshold: Option<f32>,
}

async fn http_link(
    axum::extract::State(app_state): axum::extract::State<AppState>,
    axum::extract::Json(request): axum::extract::Json<HttpLinkRequest>,
) -> Result<axum::Json<LinkerResponse>, (axum::http::StatusCode, String)> {
    let result = match request.entities {
        Some(entities) => {
            app_state
                .linker
                .link(
                    &request.text,
                    entities,
                    app_state.top_k(request.top_k),
                    app_state.score_threshold(request.score_threshold),
                )
                .await
        }
        None => {
            app_state
                .extract_and_link(&request.text, request.top_k, request.score_threshold)
                .await
        }
    };

    match result {
        Ok(response) => Ok(axum::Json(response)),
        Err(e) => {
            tracing::error!("Linking error: {}", e);
            Err((
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Linking failed: {e}"),
            ))
        }
    }
}

/// Router with the MCP endpoint mounted at `endpoint_path`.
pub fn router(app_state: AppState, endpoint_path: &str) -> axum::Router {
    use rmcp::transport::streamable_http_server::{
        StreamableHttpService, session::local::LocalSessionManager,
    };

    let service = StreamableHttpService::new(
        {
            let app_state = app_state.clone();
            move || Ok(LinkerMcpServer::new(app_state.clone()))
        },
        LocalSessionManager::default().into(),
        Default::default(),
    );

    axum::Router::new()
        .route("/healthz", axum::routing::get(healthz))
        .route("/readyz", axum::routing::get(readyz))
        .route("/link", axum::routing::post(http_link))
        .route(endpoint_path, axum::routing::any_service(service))
        .with_state(app_state)
}

pub async fn start_mcp_server(app_state: AppState, bind: &str, endpoint_path: &str) -> Result<()> {
    let bind: SocketAddr = bind.parse()?;

    tracing::info!(
        "Starting MCP Streamable HTTP server on http://{}{}",
        bind,
        endpoint_path
    );
    tracing::info!("Health endpoints: /healthz (liveness), /readyz (readiness)");
    tracing::info!("HTTP linking endpoint: POST /link");

    let tcp_listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(tcp_listener, router(app_state, endpoint_path))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Conversation;
    use crate::llm::LanguageModel;
    use crate::vector_search::{BatchFilters, Payload, ScoredDocument};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use serde_json::json;

    struct OneHitSearch;

    #[async_trait]
    impl VectorSearch for OneHitSearch {
        async fn retrieve_documents(
            &self,
            _query: &str,
            _limit: usize,
            _filters: &[FilterClause],
        ) -> Result<Vec<ScoredDocument>> {
            Ok(vec![ScoredDocument::new(
                json!({"id": "d1", "content": "Alice works at Acme"}),
                0.9,
            )])
        }

        async fn batch_retrieve_documents(
            &self,
            queries: &[String],
            _limit: usize,
            _filters: &BatchFilters,
        ) -> Result<Vec<Vec<ScoredDocument>>> {
            Ok(queries
                .iter()
                .map(|q| vec![ScoredDocument::new(json!({"id": "p1", "name": q}), 0.9)])
                .collect())
        }

        async fn list_documents(&self, _limit: usize, _filters: &[FilterClause]) -> Result<Vec<Payload>> {
            Ok(vec![])
        }
    }

    /// Extraction prompts get a JSON object, verification prompts get "1".
    struct RoutingLlm;

    #[async_trait]
    impl LanguageModel for RoutingLlm {
        async fn response(&self, conversation: &Conversation) -> Result<String> {
            let prompt = &conversation.last().unwrap().content;
            if prompt.contains("Extract the named entities") {
                Ok(r#"{"Person": ["Alice"]}"#.to_string())
            } else {
                Ok("1".to_string())
            }
        }

        async fn streaming_response(
            &self,
            _conversation: &Conversation,
        ) -> Result<BoxStream<'static, Result<String>>> {
            anyhow::bail!("streaming not used")
        }
    }

    fn state() -> AppState {
        let search: Arc<dyn VectorSearch> = Arc::new(OneHitSearch);
        let llm: Arc<dyn LanguageModel> = Arc::new(RoutingLlm);
        AppState {
            linker: Arc::new(Linker::builder(search.clone(), llm.clone()).build()),
            extractor: Arc::new(Extractor::new(llm, crate::extractor::DEFAULT_EXTRACTOR_PROMPT)),
            retriever: Arc::new(VectorSearchRetriever::new(search.clone())),
            vector_search: search,
            default_top_k: 5,
            default_score_threshold: 0.5,
        }
    }

    #[test]
    fn test_top_k_is_clamped() {
        let state = state();
        assert_eq!(state.top_k(None), 5);
        assert_eq!(state.top_k(Some(0)), 1);
        assert_eq!(state.top_k(Some(10_000)), MAX_TOP_K);
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state(), "/mcp")).await.unwrap();
        });

        let client = reqwest::Client::new();
        let health = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);

        let ready = client
            .get(format!("http://{addr}/readyz"))
            .send()
            .await
            .unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);

        let linked: LinkerResponse = client
            .post(format!("http://{addr}/link"))
            .json(&json!({"text": "Alice joined Acme"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(linked.linked_entities.len(), 1);
        assert_eq!(linked.linked_entities[0].metadata["id"], "p1");

        let explicit: LinkerResponse = client
            .post(format!("http://{addr}/link"))
            .json(&json!({"text": "x", "entities": [{"type": "Code", "name": 7}]}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(explicit.unlinked_entities, vec![Entity::new("Code", 7)]);
    }
}
