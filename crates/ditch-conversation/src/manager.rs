use ditch_core::{CompletionClient, ConversationId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::conversation::{Conversation, ConversationContext, ConversationSettings};

/// Registry of live conversations, one per identity.
///
/// Conversations are created on first contact and kept for as long as the
/// manager lives; they are never replaced or removed.
pub struct ConversationManager {
    context: Arc<ConversationContext>,
    conversations: RwLock<HashMap<ConversationId, Arc<Conversation>>>,
}

impl ConversationManager {
    pub fn new(settings: ConversationSettings, client: Arc<dyn CompletionClient>) -> Self {
        Self::with_context(ConversationContext::new(settings, client))
    }

    pub fn with_context(context: ConversationContext) -> Self {
        Self {
            context: Arc::new(context),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Return the conversation for `id`, creating it if this is first contact.
    pub async fn get_or_create(&self, id: &ConversationId) -> Arc<Conversation> {
        {
            let conversations = self.conversations.read().await;
            if let Some(conversation) = conversations.get(id) {
                return Arc::clone(conversation);
            }
        }

        // Re-checked under the write lock: another task may have won the race.
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.entry(id.clone()).or_insert_with(|| {
            info!(conversation = %id, "Starting new conversation");
            Arc::new(Conversation::new(id.clone(), Arc::clone(&self.context)))
        });
        Arc::clone(conversation)
    }

    pub async fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.read().await.get(id).cloned()
    }

    pub async fn banter(
        &self,
        id: &ConversationId,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.get_or_create(id).await.banter(user_text, cancel).await
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<ConversationId> {
        self.conversations.read().await.keys().cloned().collect()
    }
}
