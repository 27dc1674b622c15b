use serde::{Deserialize, Serialize};

use crate::config::Config;

const SYSTEM_PROMPT: &str = "You are Koffers, a personal-finance assistant. \
Answer questions about budgeting, spending and saving clearly and briefly. \
You do not give legal or tax advice and you never ask for account credentials.";

const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Conversation sent upstream: prior turns then the new user message.
pub fn build_messages(history: &[ChatTurn], message: &str) -> Vec<ChatTurn> {
    history
        .iter()
        .filter(|t| !t.content.trim().is_empty())
        .cloned()
        .chain(std::iter::once(ChatTurn {
            role: ChatRole::User,
            content: message.to_string(),
        }))
        .collect()
}

pub async fn ask(
    http: &reqwest::Client,
    config: &Config,
    history: &[ChatTurn],
    message: &str,
) -> anyhow::Result<String> {
    let response = http
        .post(format!("{}/v1/messages", config.claude_api_url))
        .header("x-api-key", &config.claude_api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&serde_json::json!({
            "model": config.claude_model,
            "max_tokens": MAX_TOKENS,
            "system": SYSTEM_PROMPT,
            "messages": build_messages(history, message),
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Claude API error {}: {}", status, body);
    }

    let parsed: MessagesResponse = response.json().await?;
    let reply: String = parsed
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text)
        .collect::<Vec<_>>()
        .join("\n");

    if reply.trim().is_empty() {
        anyhow::bail!("Claude API returned no text");
    }
    Ok(reply)
}
