//! Anthropic Messages API Adapter

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

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl AnthropicConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            timeout_secs: std::env::var("ANTHROPIC_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
        })
    }
}

pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: Client,
    pricing: Arc<PricingTable>,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig, pricing: Arc<PricingTable>) -> Result<Self> {
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
        model.contains("sonnet") || model.contains("opus")
    }

    fn build_body(request: &LlmRequest) -> Value {
        let user_content = match (&request.image, request.is_vision) {
            (Some(image), true) => json!([
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": image.mime_type,
                        "data": image.base64,
                    }
                },
                { "type": "text", "text": request.prompt },
            ]),
            _ => json!(request.prompt),
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{ "role": "user", "content": user_content }],
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> Provider {
        Provider::Anthropic
    }

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        reject_vision_if_unsupported(
            Provider::Anthropic,
            request,
            Self::supports_vision(&request.model),
        )?;

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| classify_transport_error(Provider::Anthropic, &request.model, &e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(Provider::Anthropic, &request.model, &e))?;
        if !(200..300).contains(&status) {
            return Err(classify_http_status(
                Provider::Anthropic,
                &request.model,
                status,
                &body,
            ));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            LlmError::new(
                Provider::Anthropic,
                &request.model,
                LlmErrorKind::ApiError,
                true,
                format!("unparseable response body: {e}"),
            )
        })?;

        let content = value["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = TokenUsage::new(
            value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        );
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(model = %request.model, latency_ms, "anthropic call completed");

        Ok(LlmResponse {
            content,
            estimated_cost: self.pricing.estimate(
                Provider::Anthropic,
                &request.model,
                usage.input_tokens,
                usage.output_tokens,
            ),
            usage,
            latency_ms,
            provider: Provider::Anthropic,
            model: request.model.clone(),
        })
    }
}
