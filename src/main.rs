use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use entity_linker::config::{Config, load_prompt_template};
use entity_linker::embeddings::{Embedder, EmbeddingService};
use entity_linker::extractor::{DEFAULT_EXTRACTOR_PROMPT, Extractor};
use entity_linker::linker::{DEFAULT_LINKER_PROMPT, Linker};
use entity_linker::llm::{LanguageModel, OllamaLlm};
use entity_linker::mcp_server::{self, AppState};
use entity_linker::retriever::VectorSearchRetriever;
use entity_linker::vector_search::{Qdrant, VectorSearch};

const LOG_FILE_NAME: &str = "rust-entity-linker.log";

fn get_log_dir() -> String {
    std::env::var("LOG_DIR").unwrap_or_else(|_| {
        if std::path::Path::new("/var/log").exists() && is_writable("/var/log") {
            "/var/log/rust-entity-linker".to_string()
        } else {
            "./logs".to_string()
        }
    })
}

fn get_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn get_log_max_mb() -> u64 {
    std::env::var("LOG_MAX_MB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5)
}

fn is_writable(path: &str) -> bool {
    let check_file = format!("{}/.entity_linker_write_check", path);
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&check_file)
        .map(|_| {
            let _ = std::fs::remove_file(&check_file);
            true
        })
        .unwrap_or(false)
}

fn setup_logging(log_dir: &str) -> Result<()> {
    let log_level = get_log_level();

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {log_dir}"))?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let is_development = std::env::var("DEVELOPMENT").is_ok() || std::env::var("DEV").is_ok();
    let force_console = std::env::var("CONSOLE_LOGS").is_ok();

    if is_development || force_console {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .init();
        tracing::info!("Development mode: logging to console");
    } else {
        let log_file = format!("{}/{}", log_dir, LOG_FILE_NAME);
        let file_appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("Failed to open log file {log_file}"))?;

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .json()
            .init();
    }

    tracing::info!("Logging initialized");
    tracing::info!("Log directory: {}", log_dir);
    tracing::info!("Log level: {}", log_level);
    Ok(())
}

fn start_log_cleanup_task(log_dir: String, max_mb: u64) {
    let max_bytes = max_mb * 1024 * 1024;
    let log_file = format!("{}/{}", log_dir, LOG_FILE_NAME);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));

        loop {
            interval.tick().await;

            if let Ok(metadata) = std::fs::metadata(&log_file)
                && metadata.len() > max_bytes
                && let Err(e) = std::fs::write(
                    &log_file,
                    format!("[LOG TRUNCATED - Size exceeded {}MB]\n", max_mb),
                )
            {
                eprintln!("Failed to truncate log file: {}", e);
            }
        }
    });
}

async fn build_state(config: &Config) -> Result<AppState> {
    let embedder: Arc<dyn Embedder> = Arc::new(
        EmbeddingService::connect(&config.ollama_url, &config.embedding_model)
            .await
            .context("Embedding service unavailable")?,
    );
    let llm: Arc<dyn LanguageModel> = Arc::new(
        OllamaLlm::connect(&config.ollama_url, &config.llm_model)
            .await
            .context("Language model unavailable")?,
    );
    let vector_search: Arc<dyn VectorSearch> = Arc::new(Qdrant::new(config.qdrant(), embedder)?);

    let linker_prompt = load_prompt_template(&config.prompts_dir, "linker.txt", DEFAULT_LINKER_PROMPT);
    let extractor_prompt =
        load_prompt_template(&config.prompts_dir, "extractor.txt", DEFAULT_EXTRACTOR_PROMPT);

    let linker = Linker::builder(vector_search.clone(), llm.clone())
        .prompt_template(linker_prompt)
        .cross_search_types(config.cross_search_types.clone())
        .skip_llm_check_confidence(config.skip_llm_confidence)
        .verification_policy(config.verification_policy())
        .build();

    Ok(AppState {
        linker: Arc::new(linker),
        extractor: Arc::new(Extractor::new(llm, extractor_prompt)),
        retriever: Arc::new(VectorSearchRetriever::new(vector_search.clone())),
        vector_search,
        default_top_k: config.top_k,
        default_score_threshold: config.score_threshold,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let log_dir = get_log_dir();
    let log_max_mb = get_log_max_mb();
    setup_logging(&log_dir)?;

    start_log_cleanup_task(log_dir, log_max_mb);
    tracing::info!("Started automatic log cleanup task (max: {}MB)", log_max_mb);

    let config = Config::from_env();
    tracing::info!("Configuration: {}", config.summary());

    let state = match build_state(&config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Startup failed: {:#}", e);
            return Err(e);
        }
    };

    mcp_server::start_mcp_server(state, &config.http_bind, &config.http_endpoint).await?;

    Ok(())
}
