//! Llama Worker - Local LLM backend for the agent
//!
//! Uses Ollama/Llama for:
//! - Goal planning (objective → JSON step list)
//! - Generic step execution for actions with no registered tool
//! - Suggestion ideas from a user's memory

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::agent::planner::{extract_json, parse_plan_response, PlannedStep, Planner};
use crate::agent::tools::AiExecutor;
use crate::autonomous::goals::{Goal, Parameters, Priority};
use crate::autonomous::suggestions::{SuggestionDraft, SuggestionSource, SuggestionType};
use crate::config::Config;
use crate::memory::AgentMemory;

/// Interactions included in a suggestion prompt
const PROMPT_INTERACTIONS: usize = 10;

/// Llama Worker configuration
#[derive(Debug, Clone)]
pub struct LlamaWorkerConfig {
    pub ollama_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for LlamaWorkerConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

impl From<&Config> for LlamaWorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            ollama_url: config.ollama_url.clone(),
            model: config.model.clone(),
            ..Self::default()
        }
    }
}

/// Ollama generate response
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Llama Worker for local LLM operations
pub struct LlamaWorker {
    config: LlamaWorkerConfig,
    client: reqwest::Client,
}

impl LlamaWorker {
    pub fn with_config(config: LlamaWorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    /// Check if Ollama is available
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.config.ollama_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Generate a completion, retrying transport failures
    pub async fn generate(&self, prompt: &str, temperature: f32) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.generate_once(prompt, temperature).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!("Ollama request failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn generate_once(&self, prompt: &str, temperature: f32) -> Result<String> {
        let url = format!("{}/api/generate", self.config.ollama_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": temperature,
                    "num_predict": 2048,
                }
            }))
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama error {}: {}", status, body);
        }

        let result: OllamaGenerateResponse = response.json().await.context("Failed to parse Ollama response")?;

        Ok(result.response.trim().to_string())
    }
}

#[async_trait]
impl Planner for LlamaWorker {
    async fn plan(&self, description: &str, priority: Priority) -> Result<Vec<PlannedStep>> {
        let response = self.generate(&plan_prompt(description, priority), 0.1).await?;
        debug!("Plan response: {}", response);
        Ok(parse_plan_response(&response)?)
    }
}

#[async_trait]
impl AiExecutor for LlamaWorker {
    async fn execute_step(&self, action: &str, parameters: &Parameters, goal: &Goal) -> Result<Value> {
        let response = self.generate(&step_prompt(action, parameters, goal), 0.3).await?;

        // Prefer structured output when the model produced it
        if let Some(json) = extract_json(&response) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(json) {
                return Ok(value);
            }
        }
        Ok(serde_json::json!({ "output": response }))
    }
}

#[async_trait]
impl SuggestionSource for LlamaWorker {
    async fn propose(&self, memory: &AgentMemory) -> Result<Vec<SuggestionDraft>> {
        let response = self.generate(&suggestion_prompt(memory), 0.5).await?;
        Ok(parse_suggestions(&response))
    }
}

fn plan_prompt(description: &str, priority: Priority) -> String {
    format!(
        "Break the following goal into a small number of concrete steps.\n\
        Respond with JSON only, in this shape:\n\
        {{\"steps\": [{{\"id\": \"step_1\", \"action\": \"snake_case_action\", \
        \"parameters\": {{}}, \"dependencies\": []}}]}}\n\
        Dependencies list ids of earlier steps that must finish first.\n\n\
        Priority: {}\nGoal: {}\n",
        priority.as_str(),
        description
    )
}

fn step_prompt(action: &str, parameters: &Parameters, goal: &Goal) -> String {
    format!(
        "You are carrying out one step of a larger goal.\n\
        Goal: {}\nStep action: {}\nStep parameters: {}\n\n\
        Perform the step and report the result concisely. \
        If the result is structured, respond with a JSON object.",
        goal.description,
        action,
        Value::Object(parameters.clone())
    )
}

fn suggestion_prompt(memory: &AgentMemory) -> String {
    let current: Vec<String> = memory
        .working_memory
        .current_goals
        .iter()
        .map(|g| format!("- {} ({})", g.title, g.status.as_str()))
        .collect();
    let completed: Vec<String> = memory
        .long_term_memory
        .completed_goals
        .iter()
        .rev()
        .take(5)
        .map(|g| format!("- {}", g.title))
        .collect();
    let recent: Vec<String> = memory
        .working_memory
        .recent_interactions
        .iter()
        .rev()
        .take(PROMPT_INTERACTIONS)
        .map(|i| format!("- [{}] {}", i.kind, i.summary))
        .collect();

    format!(
        "Suggest up to 3 helpful next actions for this user.\n\
        Respond with a JSON array only: [{{\"type\": \"task|improvement|insight|reminder|opportunity\", \
        \"title\": \"...\", \"description\": \"...\", \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}}]\n\n\
        Current goals:\n{}\n\nRecently completed:\n{}\n\nRecent activity:\n{}\n",
        or_none(&current),
        or_none(&completed),
        or_none(&recent)
    )
}

fn or_none(lines: &[String]) -> String {
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Parse model output into drafts, skipping malformed entries
fn parse_suggestions(response: &str) -> Vec<SuggestionDraft> {
    #[derive(Deserialize)]
    struct SuggestionJson {
        #[serde(rename = "type")]
        suggestion_type: Option<String>,
        title: Option<String>,
        description: Option<String>,
        confidence: Option<f64>,
        reasoning: Option<String>,
    }

    let Some(json) = extract_json(response) else {
        return vec![];
    };
    let Ok(items) = serde_json::from_str::<Vec<SuggestionJson>>(json) else {
        warn!("Unparseable suggestion response");
        return vec![];
    };

    items
        .into_iter()
        .filter_map(|item| {
            let title = item.title.filter(|t| !t.trim().is_empty())?;
            let suggestion_type = item
                .suggestion_type
                .as_deref()
                .and_then(SuggestionType::parse)
                .unwrap_or(SuggestionType::Task);

            Some(
                SuggestionDraft::new(suggestion_type, &title, item.description.as_deref().unwrap_or(""))
                    .with_confidence(item.confidence.unwrap_or(0.5))
                    .with_reasoning(item.reasoning.as_deref().unwrap_or("Suggested by language model")),
            )
        })
        .collect()
}
