//! Patch repair through an external chat-completion gateway.
//!
//! Given a failed attempt, the fixer locates the implicated file (when the
//! error text names one), sends the original patch, the error and a slice of
//! that file to the gateway, and accepts the answer only if it looks like a
//! unified diff.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::models::truncate_chars;
use crate::config::LlmConfig;
use crate::errors::FixerError;

const CONTEXT_CHARS: usize = 3000;

const SYSTEM_PROMPT: &str = "You are an expert debugger. Output ONLY corrected patches.";

/// Failure context handed to a fixer.
#[derive(Debug, Clone, Copy)]
pub struct FixRequest<'a> {
    pub error_message: &'a str,
    /// The patch from the validation request, never a previous correction.
    pub original_patch: &'a str,
    pub repo_path: &'a Path,
}

/// Produces a corrected unified diff for a failed attempt.
/// Real implementation: `LlmFixer`. Test double: `testing::ScriptedFixer`.
#[async_trait]
pub trait Fixer: Send + Sync {
    async fn fix(&self, request: FixRequest<'_>) -> Result<String, FixerError>;
}

/// Best-effort file and line extracted from an error message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
}

static PY_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)""#).expect("valid regex"));
static PY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"line (\d+)").expect("valid regex"));
static PATH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_./\-]+\.[A-Za-z0-9]+):(\d+)(?::\d+)?").expect("valid regex")
});

/// Find the file and line an error message points at, if any.
pub fn locate_error(message: &str) -> ErrorLocation {
    let file = PY_FILE.captures(message).map(|c| c[1].to_string());
    let line = PY_LINE.captures(message).and_then(|c| c[1].parse().ok());
    if file.is_some() {
        return ErrorLocation { file, line };
    }

    if let Some(caps) = PATH_LINE.captures(message) {
        return ErrorLocation {
            file: Some(caps[1].to_string()),
            line: caps[2].parse().ok().or(line),
        };
    }
    ErrorLocation { file: None, line }
}

/// Map a path as reported inside the sandbox onto the host checkout.
fn resolve_in_repo(repo_path: &Path, reported: &str) -> Option<PathBuf> {
    if reported.split('/').any(|part| part == "..") {
        return None;
    }
    let cleaned = reported.trim_start_matches("./");
    let mut candidates = Vec::new();
    if let Some(idx) = cleaned.rfind("/repo/") {
        candidates.push(&cleaned[idx + "/repo/".len()..]);
    }
    candidates.push(cleaned.trim_start_matches('/'));

    candidates
        .into_iter()
        .map(|rel| repo_path.join(rel))
        .find(|p| p.is_file())
}

/// Up to `CONTEXT_CHARS` characters of the file an error points at.
pub async fn read_context(repo_path: &Path, location: &ErrorLocation) -> Option<String> {
    let path = resolve_in_repo(repo_path, location.file.as_deref()?)?;
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Some(truncate_chars(&text, CONTEXT_CHARS)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read code context");
            None
        }
    }
}

pub fn build_prompt(
    original_patch: &str,
    error_message: &str,
    location: &ErrorLocation,
    code_context: &str,
) -> String {
    let mut error_section = error_message.to_string();
    if let Some(file) = &location.file {
        error_section.push_str(&format!("\n\nReported location: {}", file));
        if let Some(line) = location.line {
            error_section.push_str(&format!(" (line {})", line));
        }
    }

    format!(
        "The following patch was applied but caused a validation error:\n\n\
         ## Original Patch\n```diff\n{patch}\n```\n\n\
         ## Validation Error\n{error}\n\n\
         ## Code Context\n```\n{context}\n```\n\n\
         ## Task\n\
         Generate a CORRECTED unified diff patch that:\n\
         1. Fixes the error\n\
         2. Maintains the original intent\n\
         3. Uses proper unified diff format\n\n\
         Output ONLY the corrected patch.\n",
        patch = original_patch.trim_end(),
        error = error_section,
        context = code_context,
    )
}

/// Unwrap a Markdown code fence, if the text has one.
fn strip_code_fence(text: &str) -> String {
    let Some(start) = text.find("```") else {
        return text.to_string();
    };
    let after_marker = &text[start + 3..];
    let Some(newline) = after_marker.find('\n') else {
        return text.to_string();
    };
    let body = &after_marker[newline + 1..];
    let end = body.find("```").unwrap_or(body.len());
    body[..end].to_string()
}

/// Accept gateway output only if it looks like a unified diff.
pub fn extract_patch(response: &str) -> Result<String, FixerError> {
    let mut patch = strip_code_fence(response.trim());
    if !(patch.contains("---") && patch.contains("+++")) {
        return Err(FixerError::MalformedPatch);
    }
    if !patch.ends_with('\n') {
        patch.push('\n');
    }
    Ok(patch)
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: String,
}

/// `Fixer` that asks the LLM gateway for a corrected patch.
pub struct LlmFixer {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmFixer {
    pub fn new(config: LlmConfig) -> Result<Self, FixerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/v1/chat", self.config.gateway_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Fixer for LlmFixer {
    async fn fix(&self, request: FixRequest<'_>) -> Result<String, FixerError> {
        let location = locate_error(request.error_message);
        let context = read_context(request.repo_path, &location)
            .await
            .unwrap_or_default();
        let prompt = build_prompt(
            request.original_patch,
            request.error_message,
            &location,
            &context,
        );

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        tracing::debug!(url = %self.chat_url(), file = ?location.file, "Requesting patch correction");
        let mut req = self.client.post(self.chat_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FixerError::Status {
                status: status.as_u16(),
                body: truncate_chars(&body, 500),
            });
        }

        let chat: ChatResponse = resp.json().await?;
        extract_patch(&chat.content)
    }
}
