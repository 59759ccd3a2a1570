use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which class of model a call should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Small,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

/// Text generation backend used by the reflection cycle.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(
        &self,
        tier: ModelTier,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    large_model: Option<String>,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            large_model: None,
            system_prompt: None,
            client: reqwest::Client::new(),
        }
    }

    /// Route `ModelTier::Large` calls to a different model.
    pub fn with_large_model(mut self, model: Option<String>) -> Self {
        self.large_model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Small => &self.model,
            ModelTier::Large => self.large_model.as_deref().unwrap_or(&self.model),
        }
    }

    /// Generate a completion using the OpenAI API format
    pub async fn generate_with_model(
        &self,
        messages: Vec<Message>,
        model: &str,
        options: GenerationOptions,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url.trim_end_matches('/'));

        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature: Some(options.temperature),
            max_tokens: Some(options.max_tokens),
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }

    fn build_messages(&self, prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        });
        messages
    }
}

#[async_trait]
impl GenerativeModel for LlmClient {
    async fn generate(
        &self,
        tier: ModelTier,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<String> {
        let model = self.model_for(tier).to_string();
        self.generate_with_model(self.build_messages(prompt), &model, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_tier_falls_back_to_default_model() {
        let client = LlmClient::new(
            "http://localhost:11434/v1".to_string(),
            String::new(),
            "llama3.2".to_string(),
        );
        assert_eq!(client.model_for(ModelTier::Large), "llama3.2");

        let client = client.with_large_model(Some("qwen2.5:32b".to_string()));
        assert_eq!(client.model_for(ModelTier::Large), "qwen2.5:32b");
        assert_eq!(client.model_for(ModelTier::Small), "llama3.2");
    }

    #[test]
    fn system_prompt_leads_messages() {
        let client = LlmClient::new(String::new(), String::new(), "m".to_string())
            .with_system_prompt("be terse");
        let messages = client.build_messages("critique this");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "critique this");
    }
}
