//! Mentor chat agents: a live chat-completion backend and a canned fallback,
//! chosen once at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ospm_core::Program;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "ospm-mentor";

/// Number of catalog entries handed to the agent as context.
pub const CONTEXT_PROGRAMS: usize = 8;

pub const MENTOR_INSTRUCTION: &str = "You are an OpenSource Mentor Agent. \
Use the provided program list to recommend programs based on the user's profile, \
difficulty preferences, and timelines. Explain your reasoning briefly in friendly language.";

pub const CONTRIBUTION_WORKFLOW_REPLY: &str = "Here is the usual way to make an open-source contribution:\n\
1. Fork the repository on GitHub to get your own copy.\n\
2. Clone your fork locally with `git clone`.\n\
3. Create a branch for your change (`git checkout -b my-fix`).\n\
4. Make the change and commit it with a clear message.\n\
5. Push the branch to your fork.\n\
6. Open a pull request against the original repository.\n\
7. Respond to review feedback until a maintainer merges it.\n\
Browse the programs list to find an initiative that matches your level.";

#[derive(Debug, Error)]
pub enum MentorError {
    #[error("chat backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chat backend returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("chat backend response could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("chat backend returned no assistant content")]
    EmptyReply,
}

#[async_trait]
pub trait MentorAgent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reply(&self, message: &str, context: &[Program]) -> Result<String, MentorError>;
}

/// Leading slice of the catalog used as chat context.
pub fn context_window(programs: &[Program]) -> &[Program] {
    &programs[..programs.len().min(CONTEXT_PROGRAMS)]
}

#[derive(Debug, Clone)]
pub struct MentorConfig {
    pub model: String,
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl MentorConfig {
    pub fn from_env() -> Self {
        Self {
            model: std::env::var("MENTOR_MODEL").unwrap_or_else(|_| "gemini-1.5-flash".to_string()),
            api_base_url: std::env::var("MENTOR_API_BASE").unwrap_or_else(|_| {
                "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
            }),
            api_key: std::env::var("MENTOR_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            timeout: Duration::from_secs(
                std::env::var("MENTOR_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

/// Live agent when an API key is configured, canned fallback otherwise.
pub fn mentor_from_config(config: MentorConfig) -> anyhow::Result<Arc<dyn MentorAgent>> {
    let agent: Arc<dyn MentorAgent> = match config.api_key.clone() {
        Some(api_key) => Arc::new(LiveMentor::new(config, api_key)?),
        None => Arc::new(FallbackMentor),
    };
    info!(agent = agent.name(), "mentor agent selected");
    Ok(agent)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackMentor;

#[async_trait]
impl MentorAgent for FallbackMentor {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn reply(&self, _message: &str, _context: &[Program]) -> Result<String, MentorError> {
        Ok(CONTRIBUTION_WORKFLOW_REPLY.to_string())
    }
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug)]
pub struct LiveMentor {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl LiveMentor {
    pub fn new(config: MentorConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base_url.trim_end_matches('/')),
            model: config.model,
            api_key,
        })
    }
}

#[async_trait]
impl MentorAgent for LiveMentor {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn reply(&self, message: &str, context: &[Program]) -> Result<String, MentorError> {
        let span = info_span!("mentor_chat", model = %self.model, context = context.len());
        async {
            let body = chat_request_body(&self.model, &system_prompt(context), message);
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;
            if !status.is_success() {
                return Err(MentorError::Provider {
                    status: status.as_u16(),
                    body: text,
                });
            }
            extract_reply(&text)
        }
        .instrument(span)
        .await
    }
}

pub fn system_prompt(context: &[Program]) -> String {
    let programs = context
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "difficulty": p.difficulty,
                "program_type": p.program_type,
                "timeline": p.timeline,
                "deadline": p.deadline,
                "tags": p.tags,
                "official_site": p.official_site,
            })
        })
        .collect::<Vec<_>>();
    format!(
        "{MENTOR_INSTRUCTION}\n\nAvailable programs (JSON):\n{}",
        serde_json::Value::Array(programs)
    )
}

pub fn chat_request_body(model: &str, system_prompt: &str, message: &str) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": system_prompt },
            { "role": "user", "content": message },
        ],
    })
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub fn extract_reply(body: &str) -> Result<String, MentorError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(MentorError::EmptyReply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ospm_core::default_catalog;

    fn config(api_key: Option<&str>) -> MentorConfig {
        MentorConfig {
            model: "test-model".into(),
            api_base_url: "http://127.0.0.1:9/v1/".into(),
            api_key: api_key.map(str::to_string),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn fallback_describes_the_contribution_workflow() {
        let reply = FallbackMentor.reply("how do I start?", &[]).await.unwrap();
        for step in ["Fork", "Clone", "branch", "commit", "Push", "pull request", "merges"] {
            assert!(reply.contains(step), "missing step {step}");
        }
    }

    #[test]
    fn agent_variant_is_chosen_by_api_key() {
        assert_eq!(mentor_from_config(config(None)).unwrap().name(), "fallback");
        assert_eq!(mentor_from_config(config(Some("k"))).unwrap().name(), "live");
    }

    #[tokio::test]
    async fn unreachable_backend_surfaces_request_error() {
        let agent = LiveMentor::new(config(Some("k")), "k".into()).unwrap();
        assert_eq!(agent.endpoint, "http://127.0.0.1:9/v1/chat/completions");
        let err = agent.reply("hi", &default_catalog()).await.unwrap_err();
        assert!(matches!(err, MentorError::Request(_)));
    }

    #[test]
    fn context_window_caps_at_eight() {
        let many: Vec<Program> = (0..12)
            .map(|i| {
                let mut p = default_catalog()[0].clone();
                p.id = i;
                p
            })
            .collect();
        assert_eq!(context_window(&many).len(), CONTEXT_PROGRAMS);
        assert_eq!(context_window(&many[..3]).len(), 3);
    }

    #[test]
    fn system_prompt_embeds_program_context() {
        let prompt = system_prompt(&default_catalog());
        assert!(prompt.starts_with(MENTOR_INSTRUCTION));
        assert!(prompt.contains("Hacktoberfest"));
        assert!(prompt.contains("\"difficulty\":\"intermediate\""));
    }

    #[test]
    fn request_body_orders_system_before_user() {
        let body = chat_request_body("m", "sys", "hello");
        assert_eq!(body["model"], "m");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
    }

    #[test]
    fn reply_extraction() {
        let ok = r#"{"choices":[{"message":{"role":"assistant","content":"  Try GSoC!  "}}]}"#;
        assert_eq!(extract_reply(ok).unwrap(), "Try GSoC!");

        let blank = r#"{"choices":[{"message":{"content":"   "}}]}"#;
        assert!(matches!(extract_reply(blank), Err(MentorError::EmptyReply)));

        let none = r#"{"choices":[]}"#;
        assert!(matches!(extract_reply(none), Err(MentorError::EmptyReply)));

        assert!(matches!(extract_reply("<html>"), Err(MentorError::Parse(_))));
    }
}
