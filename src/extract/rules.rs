//! Rule-based extraction — deterministic fallback when no LLM is reachable.
//!
//! Pattern tables cover the identity phrasings and preference verbs young
//! users actually produce; keywording is a Han-bigram + ASCII-word
//! tokenizer with stopword lists, and emotion is a lexicon vote.

use crate::error::Result;
use crate::extract::Extractor;
use crate::model::{Emotion, ExtractionResult, Fact, Message, ProfileDelta, Role};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use unicode_segmentation::UnicodeSegmentation;

const KEYWORD_LIMIT: usize = 8;
const RULE_FACT_CONFIDENCE: f64 = 0.8;

/// Sentence terminators for the summary step.
const SENTENCE_ENDS: &[char] = &['。', '！', '？', '!', '?', '.', ';', '；', '\n'];

/// Trailing particles trimmed off captured objects ("恐龙了" → "恐龙").
const TRAILING_PARTICLES: &[char] = &['了', '的', '呢', '啊', '哦', '呀', '吧', '嘛'];

// ── Emotion lexicons ───────────────────────────────────

const HAPPY_KW: &[&str] = &[
    "开心", "高兴", "快乐", "太好了", "好玩", "好棒", "哈哈", "嘻嘻", "棒",
    "happy", "glad", "great", "fun", "yay", "awesome", "😊", "😄", "🎉",
];

const SAD_KW: &[&str] = &[
    "难过", "伤心", "不开心", "想哭", "哭", "呜呜", "委屈",
    "sad", "cry", "unhappy", "😢", "😭",
];

const SCARED_KW: &[&str] = &[
    "害怕", "好怕", "吓", "恐怖", "噩梦", "黑黑的",
    "scared", "afraid", "scary", "frightened",
];

const ANGRY_KW: &[&str] = &[
    "生气", "气死", "讨厌", "烦", "不公平",
    "angry", "mad", "hate", "😡",
];

const CURIOUS_KW: &[&str] = &[
    "为什么", "是什么", "怎么会", "好奇", "想知道",
    "why", "curious", "wonder", "how come",
];

// ── Stopwords for keywording ───────────────────────────

const STOPWORDS: &[&str] = &[
    // Chinese single characters and particles
    "的", "了", "我", "你", "他", "她", "它", "是", "在", "有", "和", "也",
    "都", "很", "不", "就", "要", "这", "那", "吗", "呢", "吧", "啊", "哦",
    "呀", "嘛", "个", "们", "会", "去", "说", "还", "想",
    // frequent bigrams that carry no topic
    "我们", "你们", "他们", "今天", "明天", "昨天", "什么", "怎么", "为什",
    "一个", "可以", "没有", "知道", "然后", "因为", "所以", "但是",
    // English
    "the", "a", "an", "is", "are", "am", "was", "were", "i", "you", "he",
    "she", "it", "we", "they", "my", "your", "and", "or", "but", "to", "of",
    "in", "on", "at", "for", "with", "that", "this", "do", "does", "not",
];

fn is_han(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// Tokenize mixed Chinese/ASCII text: Han runs become character bigrams
/// (single characters when a run has length 1), everything else goes
/// through Unicode word segmentation, lowercased.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut han_run: Vec<char> = Vec::new();
    let mut other = String::new();

    let mut flush_han = |run: &mut Vec<char>, out: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => out.push(run[0].to_string()),
            n => {
                for i in 0..n - 1 {
                    out.push(format!("{}{}", run[i], run[i + 1]));
                }
            }
        }
        run.clear();
    };
    let mut flush_other = |buf: &mut String, out: &mut Vec<String>| {
        if !buf.is_empty() {
            out.extend(
                buf.unicode_words()
                    .map(|w| w.to_lowercase())
                    .filter(|w| w.chars().any(|c| c.is_alphanumeric())),
            );
            buf.clear();
        }
    };

    for c in text.chars() {
        if is_han(c) {
            flush_other(&mut other, &mut tokens);
            han_run.push(c);
        } else {
            flush_han(&mut han_run, &mut tokens);
            other.push(c);
        }
    }
    flush_han(&mut han_run, &mut tokens);
    flush_other(&mut other, &mut tokens);

    tokens
}

struct PreferencePattern {
    regex: Regex,
    predicate: &'static str,
}

pub struct RuleExtractor {
    summary_max_len: usize,
    name_patterns: Vec<Regex>,
    age_patterns: Vec<Regex>,
    male_pattern: Regex,
    female_pattern: Regex,
    preference_patterns: Vec<PreferencePattern>,
}

impl RuleExtractor {
    pub fn new(summary_max_len: usize) -> Self {
        let capture = r"([^\s，。,.!！?？、:：]{1,12})";
        Self {
            summary_max_len,
            name_patterns: vec![
                Regex::new(&format!(r"我叫{capture}")).unwrap(),
                Regex::new(&format!(r"我的名字[是叫]{capture}")).unwrap(),
                Regex::new(r"(?i)my name is ([A-Za-z]+)").unwrap(),
                Regex::new(r"(?i)i am called ([A-Za-z]+)").unwrap(),
                Regex::new(r"(?i)call me ([A-Za-z]+)").unwrap(),
            ],
            age_patterns: vec![
                Regex::new(r"我(?:今年)?(\d{1,3})岁").unwrap(),
                Regex::new(r"(?i)i(?:'m| am) (\d{1,3}) years old").unwrap(),
            ],
            male_pattern: Regex::new(r"我是(?:个|一个)?男(?:生|孩|孩子)?|(?i)i(?:'m| am) a boy")
                .unwrap(),
            female_pattern: Regex::new(r"我是(?:个|一个)?女(?:生|孩|孩子)?|(?i)i(?:'m| am) a girl")
                .unwrap(),
            preference_patterns: vec![
                PreferencePattern {
                    regex: Regex::new(&format!(r"最?喜欢{capture}")).unwrap(),
                    predicate: "喜欢",
                },
                PreferencePattern {
                    regex: Regex::new(&format!(r"讨厌{capture}")).unwrap(),
                    predicate: "讨厌",
                },
                PreferencePattern {
                    regex: Regex::new(&format!(r"(?:很)?(?:害怕|怕){capture}")).unwrap(),
                    predicate: "害怕",
                },
                PreferencePattern {
                    regex: Regex::new(&format!(
                        r"我(?:的)?(?:最好的)?朋友(?:叫|是){capture}"
                    ))
                    .unwrap(),
                    predicate: "朋友叫",
                },
            ],
        }
    }

    fn trim_object(object: &str) -> &str {
        object.trim_end_matches(TRAILING_PARTICLES)
    }

    fn identity(&self, user_texts: &[&str]) -> ProfileDelta {
        let mut delta = ProfileDelta::default();
        // First match wins for each field.
        for text in user_texts {
            if delta.name.is_none() {
                for p in &self.name_patterns {
                    if let Some(cap) = p.captures(text) {
                        delta.name = Some(cap[1].to_string());
                        break;
                    }
                }
            }
            if delta.age.is_none() {
                for p in &self.age_patterns {
                    if let Some(cap) = p.captures(text) {
                        delta.age = cap[1].parse().ok();
                        break;
                    }
                }
            }
            if delta.gender.is_none() {
                if self.male_pattern.is_match(text) {
                    delta.gender = Some("男".to_string());
                } else if self.female_pattern.is_match(text) {
                    delta.gender = Some("女".to_string());
                }
            }
        }
        delta
    }

    fn preferences(
        &self,
        user_texts: &[&str],
        subject: &str,
        user_id: &str,
        now: i64,
    ) -> (Vec<Fact>, Vec<String>) {
        let mut facts: Vec<Fact> = Vec::new();
        let mut tags = Vec::new();
        for text in user_texts {
            for pattern in &self.preference_patterns {
                for cap in pattern.regex.captures_iter(text) {
                    let object = Self::trim_object(&cap[1]);
                    if object.is_empty() {
                        continue;
                    }
                    let duplicate = facts
                        .iter()
                        .any(|f| f.predicate == pattern.predicate && f.object == object);
                    if duplicate {
                        continue;
                    }
                    facts.push(Fact {
                        user_id: user_id.to_string(),
                        subject: subject.to_string(),
                        predicate: pattern.predicate.to_string(),
                        object: object.to_string(),
                        confidence: RULE_FACT_CONFIDENCE,
                        created_at: now,
                        last_seen_at: now,
                    });
                    tags.push(format!("{} {}", pattern.predicate, object));
                }
            }
        }
        (facts, tags)
    }

    fn summary(&self, user_texts: &[&str]) -> String {
        let joined = user_texts
            .iter()
            .filter_map(|text| {
                text.split(SENTENCE_ENDS)
                    .map(str::trim)
                    .find(|s| !s.is_empty())
            })
            .collect::<Vec<_>>()
            .join("。");
        joined.chars().take(self.summary_max_len).collect()
    }

    fn keywords(user_texts: &[&str]) -> Vec<String> {
        let mut freq: HashMap<String, (usize, usize)> = HashMap::new();
        let mut order = 0usize;
        for text in user_texts {
            for token in tokenize(text) {
                if STOPWORDS.contains(&token.as_str()) {
                    continue;
                }
                let entry = freq.entry(token).or_insert_with(|| {
                    order += 1;
                    (0, order)
                });
                entry.0 += 1;
            }
        }
        let mut ranked: Vec<(String, (usize, usize))> = freq.into_iter().collect();
        // Highest frequency first, first-seen order breaking ties.
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        ranked
            .into_iter()
            .take(KEYWORD_LIMIT)
            .map(|(token, _)| token)
            .collect()
    }

    fn emotion(user_texts: &[&str]) -> Emotion {
        let lowered: Vec<String> = user_texts.iter().map(|t| t.to_lowercase()).collect();
        let count = |words: &[&str]| -> usize {
            lowered
                .iter()
                .map(|t| words.iter().filter(|w| t.contains(*w)).count())
                .sum()
        };
        let scores = [
            (Emotion::Happy, count(HAPPY_KW)),
            (Emotion::Sad, count(SAD_KW)),
            (Emotion::Scared, count(SCARED_KW)),
            (Emotion::Angry, count(ANGRY_KW)),
            (Emotion::Curious, count(CURIOUS_KW)),
        ];
        let best = scores.iter().max_by_key(|(_, n)| *n).copied();
        match best {
            Some((emotion, n)) if n > 0 => emotion,
            _ => Emotion::Neutral,
        }
    }
}

#[async_trait]
impl Extractor for RuleExtractor {
    async fn extract(
        &self,
        messages: &[Message],
        user_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let user_texts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text.as_str())
            .collect();
        let now = crate::model::now_ts();

        let mut profile_delta = self.identity(&user_texts);
        let subject = profile_delta.name.clone().unwrap_or_else(|| "user".to_string());
        let (facts, tags) = self.preferences(&user_texts, &subject, user_id, now);
        profile_delta.add_tags = tags;

        let summary = self.summary(&user_texts);
        let mut keywords = Self::keywords(&user_texts);
        if keywords.is_empty() && !summary.is_empty() {
            // All tokens were stopwords; keep the invariant that a summary
            // always carries at least one keyword.
            keywords = tokenize(&summary).into_iter().take(1).collect();
        }
        let emotion = Self::emotion(&user_texts);

        let importance = (0.3
            + 0.1 * facts.len() as f64
            + if profile_delta.is_empty() { 0.0 } else { 0.1 }
            + if emotion != Emotion::Neutral { 0.1 } else { 0.0 })
        .clamp(0.0, 1.0);

        Ok(ExtractionResult {
            summary,
            keywords,
            emotion,
            importance,
            facts,
            profile_delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, text: &str, seq: i64) -> Message {
        Message {
            session_id: "s1".to_string(),
            seq,
            role,
            text: text.to_string(),
            timestamp: 0,
        }
    }

    async fn run(texts: &[&str]) -> ExtractionResult {
        let extractor = RuleExtractor::new(200);
        let mut messages = Vec::new();
        for (i, t) in texts.iter().enumerate() {
            messages.push(msg(Role::User, t, (i * 2) as i64));
            messages.push(msg(Role::Assistant, "嗯嗯", (i * 2 + 1) as i64));
        }
        extractor
            .extract(&messages, "u1", &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn name_and_age_extracted() {
        let result = run(&["我叫小明，我5岁了"]).await;
        assert_eq!(result.profile_delta.name.as_deref(), Some("小明"));
        assert_eq!(result.profile_delta.age, Some(5));
    }

    #[tokio::test]
    async fn first_name_match_wins() {
        let result = run(&["我叫小明", "我叫大壮"]).await;
        assert_eq!(result.profile_delta.name.as_deref(), Some("小明"));
    }

    #[tokio::test]
    async fn preference_becomes_fact_and_tag() {
        let result = run(&["我叫小明", "我最喜欢恐龙了"]).await;
        let fact = result
            .facts
            .iter()
            .find(|f| f.predicate == "喜欢")
            .expect("missing preference fact");
        assert_eq!(fact.subject, "小明");
        assert_eq!(fact.object, "恐龙");
        assert_eq!(fact.confidence, 0.8);
        assert!(result
            .profile_delta
            .add_tags
            .contains(&"喜欢 恐龙".to_string()));
    }

    #[tokio::test]
    async fn subject_defaults_to_user_without_name() {
        let result = run(&["我害怕打雷"]).await;
        let fact = result.facts.iter().find(|f| f.predicate == "害怕").unwrap();
        assert_eq!(fact.subject, "user");
        assert_eq!(fact.object, "打雷");
    }

    #[tokio::test]
    async fn friend_pattern_matches() {
        let result = run(&["我最好的朋友叫小红"]).await;
        let fact = result.facts.iter().find(|f| f.predicate == "朋友叫").unwrap();
        assert_eq!(fact.object, "小红");
    }

    #[tokio::test]
    async fn summary_joins_first_sentences_and_truncates() {
        let extractor = RuleExtractor::new(10);
        let messages = vec![
            msg(Role::User, "今天去了动物园。看到了老虎", 0),
            msg(Role::User, "晚上吃了面条！很好吃", 1),
        ];
        let result = extractor
            .extract(&messages, "u1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.summary.chars().count(), 10);
        assert!(result.summary.starts_with("今天去了动物园"));
    }

    #[tokio::test]
    async fn keywords_nonempty_for_chinese_text() {
        let result = run(&["恐龙世界真有趣"]).await;
        assert!(!result.keywords.is_empty());
        assert!(result.keywords.len() <= 8);
        assert!(result.keywords.iter().any(|k| k.contains('恐') || k.contains('龙')));
    }

    #[tokio::test]
    async fn emotion_vote_and_default() {
        assert_eq!(run(&["我好开心，太好了"]).await.emotion, Emotion::Happy);
        assert_eq!(run(&["我好害怕，有怪物"]).await.emotion, Emotion::Scared);
        assert_eq!(run(&["床前明月光"]).await.emotion, Emotion::Neutral);
    }

    #[tokio::test]
    async fn importance_follows_formula() {
        // No facts, no delta, neutral → 0.3
        let plain = run(&["床前明月光"]).await;
        assert!((plain.importance - 0.3).abs() < 1e-9);

        // 1 fact + delta (name + tag) + happy emotion → 0.3+0.1+0.1+0.1
        let rich = run(&["我叫小明，我喜欢恐龙，好开心"]).await;
        assert!((rich.importance - 0.6).abs() < 1e-9);
    }

    #[test]
    fn tokenizer_handles_mixed_scripts() {
        let tokens = tokenize("恐龙dinosaur世界");
        assert!(tokens.contains(&"恐龙".to_string()));
        assert!(tokens.contains(&"dinosaur".to_string()));
        assert!(tokens.contains(&"世界".to_string()));
    }
}
