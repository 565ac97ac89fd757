//! Shared Ollama plumbing: base URL normalization and model discovery.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Model entry from the `/api/tags` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

/// Adds `http://` when missing and strips trailing slashes.
pub fn normalize_base_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{base}")
    }
}

pub async fn fetch_models(client: &Client, base_url: &str) -> Result<Vec<OllamaModel>> {
    let response = client
        .get(format!("{base_url}/api/tags"))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .with_context(|| {
            format!("Cannot connect to Ollama at {base_url}. Make sure Ollama is running.")
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!(
            "Failed to list models from Ollama: {} - {}",
            status,
            body
        ));
    }

    let tags: TagsResponse = response
        .json()
        .await
        .context("Invalid response from Ollama /api/tags")?;
    Ok(tags.models)
}

/// Fails unless `model` (or a tagged variant of it) has been pulled.
pub async fn verify_model(client: &Client, base_url: &str, model: &str) -> Result<()> {
    let models = fetch_models(client, base_url).await?;
    if !model_available(&models, model) {
        let available: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        return Err(anyhow::anyhow!(
            "Model '{}' not found. Available: {:?}. Run: ollama pull {}",
            model,
            available,
            model
        ));
    }

    tracing::info!("Model '{}' verified at {}", model, base_url);
    Ok(())
}

fn model_available(models: &[OllamaModel], model: &str) -> bool {
    models.iter().any(|m| m.name.starts_with(model))
}
