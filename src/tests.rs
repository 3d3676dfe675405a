//! Manager-level scenarios over an in-memory store.
//!
//! These exercise the public contract end to end: session lifecycle,
//! extraction on close, retrieval side effects, caps, export/import.

use crate::config::MemoryConfig;
use crate::error::Error;
use crate::extract::rules::RuleExtractor;
use crate::extract::{Extractor, FallbackExtractor};
use crate::manager::Manager;
use crate::model::{ExtractionResult, Message, Role};
use crate::store::MemoryStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn test_config() -> MemoryConfig {
    MemoryConfig {
        working_memory_size: 10,
        episode_compress_threshold: 5,
        enable_cache: false,
        ..MemoryConfig::minimal()
    }
}

async fn manager_with(config: MemoryConfig) -> Manager {
    let store = MemoryStore::connect("sqlite::memory:").await.unwrap();
    let extractor: Arc<dyn Extractor> =
        Arc::new(RuleExtractor::new(config.episode_summary_max_length));
    Manager::new(store, config, extractor, None)
}

async fn rule_manager() -> Manager {
    manager_with(test_config()).await
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Drive a session through `turns` user/assistant exchanges.
async fn chat(manager: &Manager, session_id: &str, user_lines: &[&str]) {
    for line in user_lines {
        manager
            .add_message(session_id, Role::User, line, &token())
            .await
            .unwrap();
        manager
            .add_message(session_id, Role::Assistant, "好呀", &token())
            .await
            .unwrap();
    }
}

// ── Session lifecycle ──────────────────────────────────────

#[tokio::test]
async fn below_threshold_session_closes_without_episode() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(&manager, &sid, &["你好", "在吗", "讲个故事", "再见"]).await;

    let episode = manager.end_session(&sid, &token()).await.unwrap();
    assert!(episode.is_none());
    assert_eq!(manager.store().count_episodes("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn add_message_after_end_is_unknown_session() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    manager.end_session(&sid, &token()).await.unwrap();

    let err = manager
        .add_message(&sid, Role::User, "还在吗", &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSession(_)));
}

#[tokio::test]
async fn starting_new_session_ends_prior_for_user() {
    let manager = rule_manager().await;
    let first = manager.start_session("u1", &token()).await.unwrap();
    let second = manager.start_session("u1", &token()).await.unwrap();
    assert_ne!(first, second);

    // The first session was implicitly ended.
    let err = manager
        .add_message(&first, Role::User, "喂", &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSession(_)));
    // The new one is live.
    manager
        .add_message(&second, Role::User, "你好", &token())
        .await
        .unwrap();
}

#[tokio::test]
async fn messages_get_monotonic_seq() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(&manager, &sid, &["一", "二", "三"]).await;

    let ctx = manager.get_memory_context(&sid, None, &token()).await.unwrap();
    let seqs: Vec<i64> = ctx.working.iter().map(|m: &Message| m.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert_eq!(seqs.len(), 6);
    assert_eq!(seqs[0], 0);
}

// ── Extraction on close ────────────────────────────────────

#[tokio::test]
async fn rule_extraction_fills_profile() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(
        &manager,
        &sid,
        &["我叫小明，我5岁了", "我喜欢恐龙", "今天去了公园", "挖了沙子", "还看到了小狗"],
    )
    .await;

    let episode = manager.end_session(&sid, &token()).await.unwrap();
    let episode = episode.expect("threshold reached, episode expected");
    assert!(!episode.summary.is_empty());
    assert!(!episode.keywords.is_empty());

    let profile = manager.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(profile.name.as_deref(), Some("小明"));
    assert_eq!(profile.age, Some(5));
    assert!(profile.tags.contains(&"喜欢 恐龙".to_string()));

    let facts = manager.store().list_facts("u1", None).await.unwrap();
    assert!(facts
        .iter()
        .any(|f| f.subject == "小明" && f.predicate == "喜欢" && f.object == "恐龙"));
}

#[tokio::test]
async fn repeated_fact_coalesces_across_sessions() {
    let manager = rule_manager().await;
    for _ in 0..2 {
        let sid = manager.start_session("u1", &token()).await.unwrap();
        chat(
            &manager,
            &sid,
            &["我叫小明", "我喜欢恐龙", "恐龙最厉害", "我还喜欢恐龙", "真的很喜欢恐龙"],
        )
        .await;
        manager.end_session(&sid, &token()).await.unwrap();
    }

    let facts = manager.store().list_facts("u1", None).await.unwrap();
    let dino: Vec<_> = facts
        .iter()
        .filter(|f| f.subject == "小明" && f.predicate == "喜欢" && f.object == "恐龙")
        .collect();
    assert_eq!(dino.len(), 1, "coalesced to a single row");
    assert_eq!(dino[0].confidence, 0.8);
}

#[tokio::test]
async fn llm_failure_falls_back_to_rules_and_session_closes() {
    struct AlwaysFails;

    #[async_trait]
    impl Extractor for AlwaysFails {
        async fn extract(
            &self,
            _messages: &[Message],
            _user_id: &str,
            _cancel: &CancellationToken,
        ) -> crate::error::Result<ExtractionResult> {
            Err(Error::Schema("canned failure".into()))
        }
    }

    let config = test_config();
    let store = MemoryStore::connect("sqlite::memory:").await.unwrap();
    let extractor: Arc<dyn Extractor> = Arc::new(FallbackExtractor::new(
        Arc::new(AlwaysFails),
        Arc::new(RuleExtractor::new(config.episode_summary_max_length)),
    ));
    let manager = Manager::new(store, config, extractor, None);

    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(
        &manager,
        &sid,
        &["我叫小明", "我喜欢画画", "画了一只猫", "还画了太阳", "明天继续画"],
    )
    .await;

    let episode = manager.end_session(&sid, &token()).await.unwrap();
    assert!(episode.is_some(), "fallback extraction still yields an episode");
    let profile = manager.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(profile.name.as_deref(), Some("小明"));
}

#[tokio::test]
async fn cancelled_end_session_still_ends_the_session() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(&manager, &sid, &["一", "二", "三", "四", "五"]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    // Rule extraction ignores the token, so the close itself succeeds and
    // only the post-commit sweep is skipped; either way the session is gone.
    let _ = manager.end_session(&sid, &cancel).await;
    let err = manager
        .add_message(&sid, Role::User, "喂", &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSession(_)));
}

// ── Retrieval round trip ───────────────────────────────────

#[tokio::test]
async fn ended_session_retrievable_by_keyword_with_access_bump() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(
        &manager,
        &sid,
        &["我喜欢恐龙", "恐龙有很多种", "霸王龙最大", "翼龙会飞", "三角龙有角"],
    )
    .await;
    let episode = manager.end_session(&sid, &token()).await.unwrap().unwrap();

    let sid2 = manager.start_session("u1", &token()).await.unwrap();
    let ctx = manager
        .get_memory_context(&sid2, Some("恐龙"), &token())
        .await
        .unwrap();
    assert!(
        ctx.episodes.iter().any(|ep| ep.episode_id == episode.episode_id),
        "the compressed episode should come back for its own keywords"
    );
    assert!(ctx.render().contains("【相关记忆】"));

    let stored = manager.store().all_episodes("u1").await.unwrap();
    let bumped = stored.iter().find(|ep| ep.episode_id == episode.episode_id).unwrap();
    assert_eq!(bumped.access_count, 1);
    assert!(bumped.last_accessed_at >= bumped.created_at);
}

#[tokio::test]
async fn context_uses_recent_user_text_when_query_missing() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(
        &manager,
        &sid,
        &["我喜欢恐龙", "恐龙真棒", "想看恐龙书", "恐龙蛋是什么", "恐龙会回来吗"],
    )
    .await;
    manager.end_session(&sid, &token()).await.unwrap();

    let sid2 = manager.start_session("u1", &token()).await.unwrap();
    manager
        .add_message(&sid2, Role::User, "再讲讲恐龙", &token())
        .await
        .unwrap();
    let ctx = manager.get_memory_context(&sid2, None, &token()).await.unwrap();
    assert!(!ctx.episodes.is_empty());
}

// ── Caps and maintenance ───────────────────────────────────

#[tokio::test]
async fn stats_reports_counts_and_histogram() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(
        &manager,
        &sid,
        &["我叫小明", "我喜欢恐龙", "今天很开心", "去了公园", "玩了滑梯"],
    )
    .await;
    manager.end_session(&sid, &token()).await.unwrap();

    let stats = manager.stats("u1").await.unwrap();
    assert_eq!(stats.episode_count, 1);
    assert!(stats.fact_count >= 1);
    assert_eq!(stats.strength_histogram.iter().sum::<u32>(), 1);
}

#[tokio::test]
async fn cleanup_sweeps_all_users() {
    let manager = rule_manager().await;
    for user in ["u1", "u2"] {
        let sid = manager.start_session(user, &token()).await.unwrap();
        chat(
            &manager,
            &sid,
            &["我喜欢恐龙", "恐龙真棒", "看了恐龙书", "画了恐龙", "恐龙玩具"],
        )
        .await;
        manager.end_session(&sid, &token()).await.unwrap();
    }
    // Nothing is stale yet, so the sweep removes nothing but must visit
    // every user without error.
    let removed = manager.cleanup_all(&token()).await.unwrap();
    assert_eq!(removed, 0);
}

// ── Export / import ────────────────────────────────────────

#[tokio::test]
async fn export_import_export_is_byte_stable() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(
        &manager,
        &sid,
        &["我叫小明，我5岁了", "我喜欢恐龙", "我讨厌青菜", "我害怕打雷", "朋友叫小红"],
    )
    .await;
    manager.end_session(&sid, &token()).await.unwrap();

    let exported = manager.export_user("u1").await.unwrap();
    let first = serde_json::to_vec(&exported).unwrap();

    let fresh = manager_with(test_config()).await;
    fresh.import_user(&exported).await.unwrap();
    let second = serde_json::to_vec(&fresh.export_user("u1").await.unwrap()).unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn import_is_an_upsert() {
    let manager = rule_manager().await;
    let sid = manager.start_session("u1", &token()).await.unwrap();
    chat(
        &manager,
        &sid,
        &["我叫小明", "我喜欢恐龙", "看了恐龙书", "画了恐龙", "买了恐龙玩具"],
    )
    .await;
    manager.end_session(&sid, &token()).await.unwrap();

    let exported = manager.export_user("u1").await.unwrap();
    // Importing over the same data changes nothing.
    manager.import_user(&exported).await.unwrap();
    let again = manager.export_user("u1").await.unwrap();
    assert_eq!(
        serde_json::to_vec(&exported).unwrap(),
        serde_json::to_vec(&again).unwrap()
    );
}
