use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_bedrockruntime as bedrock;
use aws_sdk_bedrockruntime::operation::converse::ConverseError;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, InferenceConfiguration, Message, StopReason,
    SystemContentBlock,
};
use ditch_config::AwsSettings;
use ditch_core::{
    BanterError, ChatMessage, CompletionClient, CompletionRequest, CompletionResponse,
    FinishReason, Result, Role, TokenUsage,
};
use tracing::{debug, info};

/// Completion client backed by the Bedrock Converse API.
pub struct BedrockCompletionClient {
    client: bedrock::Client,
    region: Region,
}

impl BedrockCompletionClient {
    pub async fn new(settings: &AwsSettings) -> Result<Self> {
        let aws_config = Self::build_aws_config(settings).await;
        let client = bedrock::Client::new(&aws_config);
        let region = aws_config
            .region()
            .cloned()
            .unwrap_or_else(|| Region::new(settings.region.clone()));

        Ok(Self { client, region })
    }

    async fn build_aws_config(settings: &AwsSettings) -> aws_config::SdkConfig {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));

        if let Some(profile) = &settings.profile {
            info!("Using AWS profile: {}", profile);
            config_loader = config_loader.profile_name(profile);
        }

        let aws_config = config_loader.load().await;
        debug!("AWS config loaded for region: {}", settings.region);
        aws_config
    }

    pub fn get_region(&self) -> &str {
        self.region.as_ref()
    }
}

#[async_trait]
impl CompletionClient for BedrockCompletionClient {
    async fn create_completion(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let (system, messages) = split_system(&request.messages)?;

        let inference_config = InferenceConfiguration::builder()
            .max_tokens(i32::try_from(request.max_tokens).unwrap_or(i32::MAX))
            .build();

        let response = self
            .client
            .converse()
            .model_id(&request.model)
            .set_system((!system.is_empty()).then_some(system))
            .set_messages(Some(messages))
            .inference_config(inference_config)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(ConverseError::ThrottlingException(_)) => {
                    BanterError::RateLimited(format!("Bedrock throttled the request: {e}"))
                }
                Some(ConverseError::AccessDeniedException(_)) => {
                    BanterError::AuthError(format!("Bedrock denied access: {e}"))
                }
                _ => BanterError::Transient(format!("Bedrock API error: {e}")),
            })?;

        let message = response
            .output()
            .and_then(|output| output.as_message().ok())
            .ok_or(BanterError::EmptyResponse)?;

        let text = message
            .content()
            .iter()
            .filter_map(|block| block.as_text().ok().cloned())
            .collect::<Vec<_>>()
            .join("");

        let usage = response
            .usage()
            .map(|u| {
                TokenUsage::new(
                    u32::try_from(u.input_tokens()).unwrap_or(0),
                    u32::try_from(u.output_tokens()).unwrap_or(0),
                )
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            message: ChatMessage::assistant(text),
            finish_reason: map_stop_reason(response.stop_reason()),
            usage,
        })
    }

    fn provider(&self) -> &'static str {
        "bedrock"
    }
}

/// Converse takes system text out of band and wants the rest to open with a
/// user message and alternate roles.
///
/// Leading assistant turns (left behind by head trimming) are dropped, and
/// runs of the same role (left behind by a failed turn) are merged into one
/// message with a text block per turn.
fn split_system(messages: &[ChatMessage]) -> Result<(Vec<SystemContentBlock>, Vec<Message>)> {
    let mut system = Vec::new();
    let mut runs: Vec<(ConversationRole, Vec<ContentBlock>)> = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::System => {
                system.push(SystemContentBlock::Text(message.content.clone()));
                continue;
            }
            Role::User => ConversationRole::User,
            Role::Assistant if runs.is_empty() => {
                debug!("Dropping leading assistant turn for Converse");
                continue;
            }
            Role::Assistant => ConversationRole::Assistant,
        };

        let block = ContentBlock::Text(message.content.clone());
        match runs.last_mut() {
            Some((last_role, blocks)) if *last_role == role => blocks.push(block),
            _ => runs.push((role, vec![block])),
        }
    }

    let converted = runs
        .into_iter()
        .map(|(role, blocks)| {
            Message::builder()
                .role(role)
                .set_content(Some(blocks))
                .build()
                .map_err(|e| BanterError::Transient(format!("Failed to build message: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((system, converted))
}

fn map_stop_reason(reason: &StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ContentFiltered | StopReason::GuardrailIntervened => {
            FinishReason::ContentFilter
        }
        StopReason::ToolUse => FinishReason::ToolCalls,
        other => FinishReason::Other(other.as_str().to_string()),
    }
}
