// ABOUTME: asks a language model for one remediation command per log line.
// ABOUTME: returns the raw model text; the orchestrator sanitizes and evaluates it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "Senior SRE. Provide only one safe bash command to fix the log. No prose.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait CommandProposer: Send + Sync {
    /// `Ok(None)` means the model answered with nothing usable.
    async fn propose(&self, log_line: &str) -> anyhow::Result<Option<String>>;
}

pub struct GeminiProposer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    prompt_file: PathBuf,
}

impl GeminiProposer {
    pub fn new(config: &LlmConfig, prompt_file: PathBuf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build llm http client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            prompt_file,
        })
    }

    fn url(&self) -> String {
        generate_url(&self.endpoint, &self.model)
    }
}

fn generate_url(endpoint: &str, model: &str) -> String {
    format!("{}/models/{model}:generateContent", endpoint.trim_end_matches('/'))
}

#[async_trait]
impl CommandProposer for GeminiProposer {
    async fn propose(&self, log_line: &str) -> anyhow::Result<Option<String>> {
        // Re-read every time so operators can edit the prompt without a restart.
        let system_prompt = load_system_prompt(&self.prompt_file).await;
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(build_prompt(&system_prompt, log_line)),
                }],
            }],
        };

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("send generateContent request")?
            .error_for_status()
            .context("generateContent returned an error status")?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .context("decode generateContent response")?;

        Ok(first_candidate_text(&parsed))
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

fn build_prompt(system_prompt: &str, log_line: &str) -> String {
    format!("{system_prompt}\n\nLog: {log_line}")
}

fn first_candidate_text(response: &GenerateResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect();
    (!text.trim().is_empty()).then_some(text)
}

pub async fn load_system_prompt(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to load prompt; using default");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

/// Replaces the prompt file through a sibling temp file and a rename, so a concurrent
/// `propose` reads either the old prompt or the new one.
pub async fn store_system_prompt(path: &Path, text: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create prompt directory {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .with_context(|| format!("prompt path has no file name: {}", path.display()))?;
    let mut staged_name = file_name.to_os_string();
    staged_name.push(".tmp");
    let staged = path.with_file_name(staged_name);

    tokio::fs::write(&staged, format!("{}\n", text.trim()))
        .await
        .with_context(|| format!("write {}", staged.display()))?;
    tokio::fs::rename(&staged, path)
        .await
        .with_context(|| format!("replace {}", path.display()))?;
    tracing::info!(path = %path.display(), chars = text.trim().chars().count(), "system prompt updated");
    Ok(())
}
