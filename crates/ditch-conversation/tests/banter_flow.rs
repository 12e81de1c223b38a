use std::sync::Arc;

use ditch_conversation::{ConversationManager, ConversationSettings};
use ditch_core::{
    BanterError, ChatMessage, CompletionResponse, ConversationId, FinishReason,
    MockCompletionClient, Role, TokenUsage,
};
use mockall::Sequence;
use tokio_util::sync::CancellationToken;

fn reply(content: &str, prompt_tokens: u32, completion_tokens: u32) -> CompletionResponse {
    CompletionResponse {
        message: ChatMessage::assistant(content),
        finish_reason: FinishReason::Stop,
        usage: TokenUsage::new(prompt_tokens, completion_tokens),
    }
}

fn shape(turns: &[ditch_core::DialogTurn]) -> Vec<(Role, i64)> {
    turns.iter().map(|t| (t.role, t.token_cost)).collect()
}

#[tokio::test]
async fn trims_then_charges_marginal_prompt_cost() {
    let mut client = MockCompletionClient::new();
    let mut seq = Sequence::new();
    client
        .expect_create_completion()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(reply("first reply", 40, 50)));
    client
        .expect_create_completion()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|request| {
            // The 40-token user turn was evicted before this call.
            assert_eq!(
                request.messages,
                vec![ChatMessage::assistant("first reply"), ChatMessage::user("second")]
            );
            Ok(reply("second reply", 65, 10))
        });

    let manager = ConversationManager::new(
        ConversationSettings::new("gpt-test", 100, 20),
        Arc::new(client),
    );
    let id = ConversationId::new("alice", "general");
    let cancel = CancellationToken::new();

    manager.banter(&id, "first", &cancel).await.unwrap();
    let conversation = manager.get_or_create(&id).await;
    assert_eq!(
        shape(&conversation.snapshot().await),
        vec![(Role::User, 40), (Role::Assistant, 50)]
    );

    let answer = manager.banter(&id, "second", &cancel).await.unwrap();
    assert_eq!(answer, "second reply");

    let turns = conversation.snapshot().await;
    assert_eq!(
        shape(&turns),
        vec![(Role::Assistant, 50), (Role::User, 15), (Role::Assistant, 10)]
    );
    assert_eq!(turns[1].content, "second");
    assert_eq!(turns[2].content, "second reply");

    let stats = manager.context().tracker().get_stats();
    assert_eq!(stats.prompt_tokens, 105);
    assert_eq!(stats.completion_tokens, 60);
    assert_eq!(stats.calls, 2);
}

#[tokio::test]
async fn successful_banter_appends_exactly_one_pair() {
    let mut client = MockCompletionClient::new();
    client
        .expect_create_completion()
        .times(3)
        .returning(|request| {
            let last = request.messages.last().cloned().unwrap();
            assert_eq!(last.role, Role::User);
            Ok(reply(&format!("re: {}", last.content), 10, 5))
        });

    let manager = ConversationManager::new(ConversationSettings::default(), Arc::new(client));
    let id = ConversationId::new("bob", "dm");
    let cancel = CancellationToken::new();

    for text in ["a", "b", "c"] {
        let before = manager.get_or_create(&id).await.snapshot().await;
        manager.banter(&id, text, &cancel).await.unwrap();
        let after = manager.get_or_create(&id).await.snapshot().await;

        assert_eq!(after.len(), before.len() + 2);
        assert_eq!(&after[..before.len()], before.as_slice());
        assert_eq!(after[before.len()].role, Role::User);
        assert_eq!(after[before.len()].content, text);
        assert_eq!(after[before.len() + 1].role, Role::Assistant);
        assert_eq!(after[before.len() + 1].content, format!("re: {text}"));
    }
}

#[tokio::test]
async fn exhausted_retries_leave_unanswered_user_turn() {
    let mut client = MockCompletionClient::new();
    let mut seq = Sequence::new();
    client
        .expect_create_completion()
        .times(3)
        .in_sequence(&mut seq)
        .returning(|_| Err(BanterError::RateLimited("429".into())));
    client
        .expect_create_completion()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|request| {
            // The failed turn is still part of the history.
            assert_eq!(
                request.messages,
                vec![ChatMessage::user("lost"), ChatMessage::user("again")]
            );
            Ok(reply("finally", 20, 4))
        });

    let manager = ConversationManager::new(
        ConversationSettings::new("gpt-test", 4096, 512).with_retry_attempts(3),
        Arc::new(client),
    );
    let id = ConversationId::new("carol", "general");
    let cancel = CancellationToken::new();

    let err = manager.banter(&id, "lost", &cancel).await.unwrap_err();
    match &err {
        BanterError::RetryExhausted { attempts, source } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**source, BanterError::RateLimited(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let conversation = manager.get_or_create(&id).await;
    assert_eq!(shape(&conversation.snapshot().await), vec![(Role::User, 0)]);

    manager.banter(&id, "again", &cancel).await.unwrap();
    assert_eq!(
        shape(&conversation.snapshot().await),
        vec![(Role::User, 0), (Role::User, 20), (Role::Assistant, 4)]
    );

    let summary = manager.context().metrics().get_summary();
    assert_eq!(summary.total_requests, 2);
    assert_eq!(summary.failed_requests, 1);
    assert_eq!(summary.total_attempts, 4);
}

#[tokio::test]
async fn abnormal_finish_on_every_attempt_fails() {
    let mut client = MockCompletionClient::new();
    client.expect_create_completion().times(2).returning(|_| {
        Ok(CompletionResponse {
            message: ChatMessage::assistant("partial"),
            finish_reason: FinishReason::ContentFilter,
            usage: TokenUsage::new(10, 10),
        })
    });

    let manager = ConversationManager::new(
        ConversationSettings::default().with_retry_attempts(2),
        Arc::new(client),
    );
    let id = ConversationId::new("dave", "general");

    let err = manager
        .banter(&id, "hello", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        BanterError::AbnormalCompletion {
            reason: FinishReason::ContentFilter
        }
    ));

    let conversation = manager.get(&id).await.unwrap();
    assert_eq!(shape(&conversation.snapshot().await), vec![(Role::User, 0)]);
    assert_eq!(manager.context().tracker().get_stats().calls, 0);
}
