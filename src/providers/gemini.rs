use crate::config::ProviderConfig;
use crate::error::RelayError;
use crate::providers::Provider;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// 上游错误体的最大保留长度
const MAX_ERROR_BODY_CHARS: usize = 4096;

/// Gemini API 请求格式
#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

/// Gemini API 响应格式
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Google Gemini `generateContent` 客户端
///
/// 构造时绑定凭据，之后只读。
#[derive(Debug)]
pub struct GeminiProvider {
    client: Client,
    api_base: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(10)
            .build()?;

        let api_base = if config.api_base.is_empty() {
            DEFAULT_API_BASE.to_string()
        } else {
            config.api_base.trim_end_matches('/').to_string()
        };

        Ok(Self {
            client,
            api_base,
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.api_base, model)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiPart { text: prompt }],
            }],
        };

        // 通过 HTTP 头传递 API 密钥，避免出现在 URL 和日志里
        let response = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = upstream_message(&body);
            warn!(status = status.as_u16(), "Gemini 返回错误: {}", message);
            return Err(RelayError::upstream(status.as_u16(), message));
        }

        let body = response.bytes().await?;
        let gemini_resp: GeminiResponse = serde_json::from_slice(&body)
            .map_err(|e| RelayError::MalformedResponse(format!("JSON inválido: {}", e)))?;
        extract_text(gemini_resp, model)
    }
}

/// 从错误体中取出提供商的原始错误消息
fn upstream_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) => body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    }
}

fn extract_text(resp: GeminiResponse, model: &str) -> Result<String> {
    if let Some(usage) = &resp.usage_metadata {
        debug!(
            model,
            prompt_tokens = usage.prompt_token_count,
            completion_tokens = usage.candidates_token_count,
            total_tokens = usage.total_token_count,
            "Gemini token 用量"
        );
    }

    let Some(candidate) = resp.candidates.into_iter().next() else {
        let reason = resp
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .map(|reason| format!("prompt bloqueado ({})", reason))
            .unwrap_or_else(|| "sin candidatos".to_string());
        return Err(RelayError::MalformedResponse(reason));
    };

    let text: String = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect();

    if text.is_empty() {
        let reason = candidate
            .finish_reason
            .unwrap_or_else(|| "UNKNOWN".to_string());
        return Err(RelayError::MalformedResponse(format!(
            "candidato sin texto (finishReason: {})",
            reason
        )));
    }

    Ok(text)
}
