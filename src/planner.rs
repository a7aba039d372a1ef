//! Repair-plan proposals from the reasoning service
//!
//! Formats one incident (plus attempt number and the most recent reward)
//! into an OpenAI-style JSON-mode chat request, then validates the response
//! against the repair-plan schema. Anything that comes back malformed is a
//! hard failure for the current attempt; the orchestrator charges it
//! against the attempt budget and moves on.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{FilePatch, Incident, RepairPlan, RewardSignal};
use crate::workflow::PlanProvider;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TEMPERATURE: f64 = 0.2;

const SYSTEM_PROMPT: &str = "You are a dependency-upgrade repair engineer. A dependency upgrade \
broke a project's test suite inside a sandbox. Propose file patches that make the tests pass \
against the new version. Respond with a single JSON object and nothing else.";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// The schema the reasoner must return. Deserialization failures and an
/// empty patchset are schema violations, not transport errors.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanJson {
    summary: String,
    confidence: f64,
    rationale: String,
    patchset: Vec<PatchJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchJson {
    path: String,
    instructions: String,
    patch_text: String,
}

pub struct Planner {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl Planner {
    pub fn new(url: String, model: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create reasoner HTTP client")?;
        Ok(Self {
            client,
            url,
            model,
            api_key,
        })
    }
}

impl PlanProvider for Planner {
    /// Ask the reasoner for a repair plan for this attempt.
    async fn propose(
        &self,
        incident: &Incident,
        attempt: u32,
        latest_reward: Option<&RewardSignal>,
    ) -> Result<RepairPlan> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt(incident, attempt, latest_reward)?,
                },
            ],
            temperature: TEMPERATURE,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let mut call = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", format!("Bearer {}", key));
        }

        let response = call.send().await.context("Reasoner request failed")?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read reasoner response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "Reasoner returned {}: {}",
                status,
                truncate_str(&body, 200)
            ));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).context("Failed to parse reasoner response envelope")?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow!("Reasoner response contained no choices"))?;

        parse_plan(content, &incident.id)
    }
}

fn user_prompt(
    incident: &Incident,
    attempt: u32,
    latest_reward: Option<&RewardSignal>,
) -> Result<String> {
    let incident_json =
        serde_json::to_string_pretty(incident).context("Failed to serialize incident")?;
    let reward_line = match latest_reward {
        Some(reward) if reward.reward == 1 => format!(
            "Attempt {} was rewarded 1 (its validation passed).",
            reward.attempt
        ),
        Some(reward) => format!(
            "Attempt {} was rewarded 0: the previous plan did not fix the tests. Propose a different repair.",
            reward.attempt
        ),
        None => "This is the first repair attempt for this incident.".to_string(),
    };

    Ok(format!(
        "Incident:\n{}\n\nThis is repair attempt {}. {}\n\n\
         Return a JSON object with exactly these fields:\n\
         {{\"summary\": string, \"confidence\": number between 0 and 1, \"rationale\": string, \
         \"patchset\": [{{\"path\": string, \"instructions\": string, \"patchText\": string}}]}}\n\
         patchset must contain at least one entry. Each patchText must be a unified diff that \
         applies with `patch -p0` from the project root.",
        incident_json, attempt, reward_line
    ))
}

/// Parse and validate the reasoner's message content as a repair plan.
fn parse_plan(content: &str, incident_id: &str) -> Result<RepairPlan> {
    let clean = strip_markdown_fences(content);
    let fragment = extract_json_fragment(clean, '{', '}').unwrap_or(clean);

    let plan: PlanJson = serde_json::from_str(fragment)
        .with_context(|| format!("Reasoner returned a schema-violating plan: {}", truncate_str(clean, 200)))?;

    if plan.patchset.is_empty() {
        return Err(anyhow!("Reasoner returned an empty patchset"));
    }
    for patch in &plan.patchset {
        if patch.path.trim().is_empty() {
            return Err(anyhow!("Reasoner returned a patch without a path"));
        }
        if patch.patch_text.trim().is_empty() {
            return Err(anyhow!("Reasoner returned an empty patch for {}", patch.path));
        }
    }

    Ok(RepairPlan {
        incident_id: incident_id.to_string(),
        summary: plan.summary,
        confidence: plan.confidence.clamp(0.0, 1.0),
        rationale: plan.rationale,
        patchset: plan
            .patchset
            .into_iter()
            .map(|p| FilePatch {
                path: p.path,
                instructions: p.instructions,
                patch_text: p.patch_text,
            })
            .collect(),
    })
}

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters.
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Truncate a string for error messages (Unicode-safe).
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    if s.chars().count() <= max_chars {
        s
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        &s[..byte_idx]
    }
}
