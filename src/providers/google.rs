//! Google Gemini Adapter

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
pub struct GoogleConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl GoogleConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: std::env::var("GOOGLE_API_KEY").unwrap_or_default(),
            base_url: std::env::var("GOOGLE_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string()),
            timeout_secs: std::env::var("GOOGLE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
        })
    }
}

pub struct GoogleProvider {
    config: GoogleConfig,
    client: Client,
    pricing: Arc<PricingTable>,
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig, pricing: Arc<PricingTable>) -> Result<Self> {
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

    // Gemini models are multimodal across the board.
    fn supports_vision(_model: &str) -> bool {
        true
    }

    fn build_body(request: &LlmRequest) -> Value {
        let mut parts = vec![json!({ "text": request.prompt })];
        if let (Some(image), true) = (&request.image, request.is_vision) {
            parts.push(json!({
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": image.base64,
                }
            }));
        }

        let mut body = json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        });
        if let Some(system) = &request.system_prompt {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn id(&self) -> Provider {
        Provider::Google
    }

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        reject_vision_if_unsupported(
            Provider::Google,
            request,
            Self::supports_vision(&request.model),
        )?;

        let started = Instant::now();
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config.base_url, request.model, self.config.api_key
        );
        let response = self
            .client
            .post(url)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| classify_transport_error(Provider::Google, &request.model, &e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(Provider::Google, &request.model, &e))?;
        if !(200..300).contains(&status) {
            return Err(classify_http_status(
                Provider::Google,
                &request.model,
                status,
                &body,
            ));
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| {
            LlmError::new(
                Provider::Google,
                &request.model,
                LlmErrorKind::ApiError,
                true,
                format!("unparseable response body: {e}"),
            )
        })?;

        // Safety blocks come back 200 with no candidates; treat them as
        // non-retryable caller errors.
        let candidates = value["candidates"].as_array();
        if candidates.map(|c| c.is_empty()).unwrap_or(true) {
            return Err(LlmError::new(
                Provider::Google,
                &request.model,
                LlmErrorKind::InvalidRequest,
                false,
                "response blocked or empty",
            ));
        }

        let content = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = TokenUsage::new(
            value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            value["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0) as u32,
        );
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(model = %request.model, latency_ms, "google call completed");

        Ok(LlmResponse {
            content,
            estimated_cost: self.pricing.estimate(
                Provider::Google,
                &request.model,
                usage.input_tokens,
                usage.output_tokens,
            ),
            usage,
            latency_ms,
            provider: Provider::Google,
            model: request.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_generation_config_and_inline_image() {
        let request = LlmRequest {
            model: "gemini-2.0-flash".into(),
            prompt: "what is this".into(),
            system_prompt: None,
            max_tokens: 512,
            temperature: 0.2,
            image: Some(super::super::ImageData {
                base64: "aGVsbG8=".into(),
                mime_type: "image/png".into(),
            }),
            is_vision: true,
        };
        let body = GoogleProvider::build_body(&request);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(
            body["contents"][0]["parts"][1]["inline_data"]["mime_type"],
            "image/png"
        );
    }
}
