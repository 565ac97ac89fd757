pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod extractor;
pub mod linker;
pub mod llm;
pub mod mcp_server;
pub mod ollama;
pub mod postprocess;
pub mod prompt;
pub mod retriever;
pub mod vector_search;

pub use extractor::Entity;
pub use linker::{LinkedEntity, Linker, LinkerBuilder, LinkerResponse};
