use async_trait::async_trait;
use ditch_config::OpenAiSettings;
use ditch_core::{
    BanterError, ChatMessage, CompletionClient, CompletionRequest, CompletionResponse,
    FinishReason, Result, Role, TokenUsage,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Client for any endpoint speaking the OpenAI chat-completions protocol.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiClient {
    pub fn new(settings: &OpenAiSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(BanterError::ConfigError(
                "OpenAI API key is not set (openai.api_key or DITCH_OPENAI_API_KEY)".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| BanterError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn create_completion(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let body = ChatCompletionRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            messages: &request.messages,
        };

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)?;
        into_completion(parsed)
    }

    fn provider(&self) -> &'static str {
        "openai"
    }
}

fn map_transport_error(e: reqwest::Error) -> BanterError {
    if e.is_timeout() {
        BanterError::Transient(format!("request timed out: {e}"))
    } else {
        BanterError::Transient(format!("network error: {e}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> BanterError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::TOO_MANY_REQUESTS => BanterError::RateLimited(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BanterError::AuthError(detail),
        _ => BanterError::Transient(detail),
    }
}

fn into_completion(response: ChatCompletionResponse) -> Result<CompletionResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or(BanterError::EmptyResponse)?;

    let role = match choice.message.role.as_str() {
        "system" => Role::System,
        "user" => Role::User,
        _ => Role::Assistant,
    };
    let finish_reason = choice
        .finish_reason
        .as_deref()
        .map(FinishReason::from)
        .unwrap_or_else(|| FinishReason::Other("unknown".to_string()));
    let usage = response
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(CompletionResponse {
        message: ChatMessage::new(role, choice.message.content.unwrap_or_default()),
        finish_reason,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let body = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 65, "completion_tokens": 10, "total_tokens": 75}
        }"#;

        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let completion = into_completion(parsed).unwrap();

        assert_eq!(completion.message, ChatMessage::assistant("Hello there!"));
        assert_eq!(completion.finish_reason, FinishReason::Stop);
        assert_eq!(completion.usage, TokenUsage::new(65, 10));
    }

    #[test]
    fn test_parse_truncated_completion() {
        let body = r#"{
            "choices": [{
                "message": {"role": "assistant", "content": "Hello th"},
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3}
        }"#;

        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let completion = into_completion(parsed).unwrap();
        assert_eq!(completion.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_empty_choices() {
        let parsed: ChatCompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            into_completion(parsed),
            Err(BanterError::EmptyResponse)
        ));
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![ChatMessage::system("be nice"), ChatMessage::user("hi")];
        let body = ChatCompletionRequest {
            model: "gpt-3.5-turbo",
            max_tokens: 512,
            messages: &messages,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-3.5-turbo");
        assert_eq!(json["max_tokens"], 512);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            BanterError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            BanterError::AuthError(_)
        ));
        let err = classify_status(StatusCode::BAD_GATEWAY, " upstream \n");
        assert_eq!(err.to_string(), "Completion request failed: HTTP 502: upstream");
    }

    #[test]
    fn test_missing_api_key() {
        let settings = OpenAiSettings::default();
        assert!(matches!(
            OpenAiClient::new(&settings),
            Err(BanterError::ConfigError(_))
        ));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let settings = OpenAiSettings {
            api_key: "sk-test".into(),
            base_url: "http://localhost:8080/v1/".into(),
            timeout_secs: 5,
        };
        let client = OpenAiClient::new(&settings).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(client.provider(), "openai");
    }
}
