//! OpenAI Chat Completions Adapter

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    classify_http_status, classify_transport_error, reject_vision_if_unsupported, LlmError,
    LlmErrorKind, LlmProvider, LlmRequest, LlmResponse, Provider,
};
use crate::models::TokenUsage;
use crate::pricing::PricingTable;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            timeout_secs: std::env::var("OPENAI_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
        })
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: Client,
    pricing: Arc<PricingTable>,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig, pricing: Arc<PricingTable>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            config,
            client,
            pricing,
        })
    }

    fn supports_vision(model: &str) -> bool {
        model.starts_with("gpt-4o")
    }

    fn build_body(request: &LlmRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        let user_content = match (&request.image, request.is_vision) {
            (Some(image), true) => json!([
                { "type": "text", "text": request.prompt },
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", image.mime_type, image.base64)
                    }
                },
            ]),
            _ => json!(request.prompt),
        };
        messages.push(json!({ "role": "user", "content": user_content }));

        json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> Provider {
        Provider::OpenAi
    }

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        reject_vision_if_unsupported(
            Provider::OpenAi,
            request,
            Self::supports_vision(&request.model),
        )?;

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| classify_transport_error(Provider::OpenAi, &request.model, &e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(Provider::OpenAi, &request.model, &e))?;
        if !(200..300).contains(&status) {
            return Err(classify_http_status(
                Provider::OpenAi,
                &request.model,
                status,
                &body,
            ));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            LlmError::new(
                Provider::OpenAi,
                &request.model,
                LlmErrorKind::ApiError,
                true,
                format!("unparseable response body: {e}"),
            )
        })?;

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = TokenUsage::new(
            value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        );
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(model = %request.model, latency_ms, "openai call completed");

        Ok(LlmResponse {
            content,
            estimated_cost: self.pricing.estimate(
                Provider::OpenAi,
                &request.model,
                usage.input_tokens,
                usage.output_tokens,
            ),
            usage,
            latency_ms,
            provider: Provider::OpenAi,
            model: request.model.clone(),
        })
    }
}
