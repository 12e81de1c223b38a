use ditch_config::{DitchConfig, ModelSettings};
use ditch_core::{
    BanterError, ChatMessage, CompletionClient, CompletionRequest, CompletionResponse,
    ConversationId, DialogTurn, Result,
};
use ditch_metrics::{RequestMetrics, TokenTracker};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::dialog::Dialog;
use crate::retry::RetryPolicy;

/// Read-only model parameters shared by every conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSettings {
    pub model: String,
    pub max_tokens: u32,
    pub reserved_tokens: u32,
    pub retry_attempts: u32,
    /// Sent ahead of the dialog on every call; never trimmed or charged.
    pub system_prompt: Option<String>,
}

impl ConversationSettings {
    pub fn new(model: impl Into<String>, max_tokens: u32, reserved_tokens: u32) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            reserved_tokens,
            ..Self::default()
        }
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn from_config(config: &DitchConfig) -> Self {
        Self::from(&config.model)
    }
}

impl From<&ModelSettings> for ConversationSettings {
    fn from(model: &ModelSettings) -> Self {
        Self {
            model: model.name.clone(),
            max_tokens: model.max_tokens,
            reserved_tokens: model.reserved_tokens,
            retry_attempts: model.retry_attempts,
            system_prompt: model.system_prompt.clone(),
        }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self::from(&ModelSettings::default())
    }
}

/// Everything a conversation borrows from the process: settings, the
/// completion endpoint and the usage counters.
pub struct ConversationContext {
    settings: ConversationSettings,
    client: Arc<dyn CompletionClient>,
    tracker: Arc<TokenTracker>,
    metrics: Arc<RequestMetrics>,
}

impl ConversationContext {
    pub fn new(settings: ConversationSettings, client: Arc<dyn CompletionClient>) -> Self {
        Self {
            settings,
            client,
            tracker: Arc::new(TokenTracker::new()),
            metrics: Arc::new(RequestMetrics::new()),
        }
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    pub fn tracker(&self) -> Arc<TokenTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn metrics(&self) -> Arc<RequestMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// One identity's dialog and the logic that keeps it under budget.
///
/// Concurrent [`Conversation::banter`] calls on the same conversation are
/// serialised by an internal lock held for the whole call.
pub struct Conversation {
    id: ConversationId,
    context: Arc<ConversationContext>,
    dialog: Mutex<Dialog>,
}

impl Conversation {
    pub fn new(id: ConversationId, context: Arc<ConversationContext>) -> Self {
        Self {
            id,
            context,
            dialog: Mutex::new(Dialog::new()),
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Send `user_text` with the conversation so far and return the reply.
    ///
    /// On failure the user turn stays in the dialog with a cost of 0 and no
    /// assistant turn is added.
    #[instrument(skip(self, user_text, cancel), fields(conversation = %self.id))]
    pub async fn banter(&self, user_text: &str, cancel: &CancellationToken) -> Result<String> {
        let started = Instant::now();
        let settings = &self.context.settings;
        let mut dialog = self.dialog.lock().await;

        let evicted = dialog.trim(settings.max_tokens, settings.reserved_tokens);
        if !evicted.is_empty() {
            debug!(
                evicted = evicted.len(),
                remaining = dialog.len(),
                "Trimmed dialog to fit token budget"
            );
        }

        let tokens_before = dialog.total_tokens();
        let user_index = dialog.push(DialogTurn::user(user_text));
        let request = self.build_request(&dialog);

        let metrics = &self.context.metrics;
        let outcome = RetryPolicy::new(settings.retry_attempts)
            .run(cancel, |attempt| {
                let request = request.clone();
                async move {
                    metrics.record_attempt();
                    debug!(attempt, "Requesting completion");
                    self.complete(request).await
                }
            })
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                metrics.record_request(started.elapsed(), false);
                return Err(e);
            }
        };

        let user_cost = i64::from(response.usage.prompt_tokens) - tokens_before;
        if user_cost <= 0 {
            warn!(
                prompt_tokens = response.usage.prompt_tokens,
                tokens_before,
                user_cost,
                "Prompt tokens do not exceed dialog total; keeping non-positive cost"
            );
        }
        dialog.set_token_cost(user_index, user_cost);

        let reply = response.message.content.clone();
        dialog.push(DialogTurn::assistant(
            reply.clone(),
            i64::from(response.usage.completion_tokens),
        ));

        self.context.tracker.record(&settings.model, &response.usage);
        metrics.record_request(started.elapsed(), true);

        debug!(
            response = %serde_json::to_string(&response).unwrap_or_else(|e| e.to_string()),
            "Completion response"
        );
        debug!(tokens = dialog.total_tokens(), turns = dialog.len(), "Dialog updated");

        Ok(reply)
    }

    fn build_request(&self, dialog: &Dialog) -> CompletionRequest {
        let settings = &self.context.settings;
        let mut messages = Vec::with_capacity(dialog.len() + 1);
        if let Some(system_prompt) = &settings.system_prompt {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }
        messages.extend(dialog.messages());

        CompletionRequest {
            model: settings.model.clone(),
            max_tokens: settings.reserved_tokens,
            messages,
        }
    }

    /// One remote call; anything but a natural stop counts as a failure.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let response = self.context.client.create_completion(request).await?;

        if !response.finish_reason.is_normal() {
            return Err(BanterError::AbnormalCompletion {
                reason: response.finish_reason,
            });
        }

        Ok(response)
    }

    /// Copy of the current dialog, oldest turn first.
    pub async fn snapshot(&self) -> Vec<DialogTurn> {
        self.dialog.lock().await.to_vec()
    }

    pub async fn total_tokens(&self) -> i64 {
        self.dialog.lock().await.total_tokens()
    }

    pub async fn turn_count(&self) -> usize {
        self.dialog.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditch_core::{FinishReason, MockCompletionClient, Role, TokenUsage};

    fn reply(content: &str, finish_reason: FinishReason, usage: TokenUsage) -> CompletionResponse {
        CompletionResponse {
            message: ChatMessage::assistant(content),
            finish_reason,
            usage,
        }
    }

    fn conversation(client: MockCompletionClient, settings: ConversationSettings) -> Conversation {
        let context = Arc::new(ConversationContext::new(settings, Arc::new(client)));
        Conversation::new(ConversationId::new("user-1", "channel-1"), context)
    }

    #[tokio::test]
    async fn test_banter_records_costs() {
        let mut client = MockCompletionClient::new();
        client
            .expect_create_completion()
            .times(1)
            .returning(|request| {
                assert_eq!(request.model, "gpt-test");
                assert_eq!(request.max_tokens, 20);
                assert_eq!(request.messages, vec![ChatMessage::user("hello")]);
                Ok(reply("hi there", FinishReason::Stop, TokenUsage::new(12, 4)))
            });

        let conv = conversation(client, ConversationSettings::new("gpt-test", 100, 20));
        let answer = conv.banter("hello", &CancellationToken::new()).await.unwrap();

        assert_eq!(answer, "hi there");
        let turns = conv.snapshot().await;
        assert_eq!(turns.len(), 2);
        assert_eq!((turns[0].role, turns[0].token_cost), (Role::User, 12));
        assert_eq!((turns[1].role, turns[1].token_cost), (Role::Assistant, 4));
        assert_eq!(conv.total_tokens().await, 16);
        assert_eq!(conv.context.tracker().get_stats().total_tokens, 16);
    }

    #[tokio::test]
    async fn test_system_prompt_is_sent_but_not_stored() {
        let mut client = MockCompletionClient::new();
        client.expect_create_completion().times(1).returning(|request| {
            assert_eq!(
                request.messages,
                vec![ChatMessage::system("be terse"), ChatMessage::user("hello")]
            );
            Ok(reply("ok", FinishReason::Stop, TokenUsage::new(9, 1)))
        });

        let settings = ConversationSettings::new("gpt-test", 100, 20).with_system_prompt("be terse");
        let conv = conversation(client, settings);
        conv.banter("hello", &CancellationToken::new()).await.unwrap();

        let turns = conv.snapshot().await;
        assert_eq!(turns.len(), 2);
        // The system prompt's tokens land on the user turn.
        assert_eq!(turns[0].token_cost, 9);
    }

    #[tokio::test]
    async fn test_abnormal_finish_is_retried() {
        let mut client = MockCompletionClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_create_completion()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(reply("trunc", FinishReason::Length, TokenUsage::new(5, 20))));
        client
            .expect_create_completion()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(reply("complete", FinishReason::Stop, TokenUsage::new(5, 3))));

        let conv = conversation(client, ConversationSettings::new("gpt-test", 100, 20));
        let answer = conv.banter("hello", &CancellationToken::new()).await.unwrap();

        assert_eq!(answer, "complete");
        assert_eq!(conv.turn_count().await, 2);
        assert_eq!(conv.context.metrics().get_summary().total_attempts, 2);
    }

    #[tokio::test]
    async fn test_negative_marginal_cost_is_kept() {
        let mut client = MockCompletionClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_create_completion()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(reply("first", FinishReason::Stop, TokenUsage::new(30, 30))));
        client
            .expect_create_completion()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(reply("second", FinishReason::Stop, TokenUsage::new(50, 5))));

        let conv = conversation(client, ConversationSettings::new("gpt-test", 1000, 20));
        let cancel = CancellationToken::new();
        conv.banter("one", &cancel).await.unwrap();
        conv.banter("two", &cancel).await.unwrap();

        let turns = conv.snapshot().await;
        // 50 reported prompt tokens against 60 already held.
        assert_eq!(turns[2].token_cost, -10);
        assert_eq!(turns[3].token_cost, 5);
    }

    #[tokio::test]
    async fn test_cancelled_banter_keeps_user_turn() {
        let mut client = MockCompletionClient::new();
        client.expect_create_completion().never();

        let conv = conversation(client, ConversationSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = conv.banter("hello", &cancel).await.unwrap_err();
        assert!(matches!(err, BanterError::Cancelled));

        let turns = conv.snapshot().await;
        assert_eq!(turns.len(), 1);
        assert_eq!((turns[0].role, turns[0].token_cost), (Role::User, 0));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = DitchConfig::default();
        config.model.name = "gpt-4o".into();
        config.model.system_prompt = Some("hi".into());

        let settings = ConversationSettings::from_config(&config);
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.max_tokens, 4096);
        assert_eq!(settings.reserved_tokens, 512);
        assert_eq!(settings.retry_attempts, 3);
        assert_eq!(settings.system_prompt.as_deref(), Some("hi"));
    }
}
