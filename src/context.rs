//! Assembled memory context and its system-prompt rendering.

use crate::model::{Episode, Fact, Message, UserProfile};
use serde::{Deserialize, Serialize};

/// Transient per-query value handed to the host for prompt assembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    pub profile: Option<UserProfile>,
    pub facts: Vec<Fact>,
    pub episodes: Vec<Episode>,
    /// Live working-memory slice of the active session.
    pub working: Vec<Message>,
}

impl MemoryContext {
    /// Render the fixed three-block system prompt. Pure; blocks with no
    /// content are omitted and the result is trimmed.
    pub fn render(&self) -> String {
        let mut blocks: Vec<String> = Vec::new();

        if let Some(profile) = &self.profile {
            let mut lines = Vec::new();
            if let Some(name) = &profile.name {
                lines.push(format!("姓名: {}", name));
            }
            if let Some(age) = profile.age {
                lines.push(format!("年龄: {}岁", age));
            }
            if let Some(gender) = &profile.gender {
                lines.push(format!("性别: {}", gender));
            }
            if !profile.tags.is_empty() {
                lines.push(format!("标签: {}", profile.tags.join("、")));
            }
            if !lines.is_empty() {
                blocks.push(format!("【用户信息】\n{}", lines.join("\n")));
            }
        }

        if !self.facts.is_empty() {
            let lines = self
                .facts
                .iter()
                .map(|f| format!("- {} {} {}", f.subject, f.predicate, f.object))
                .collect::<Vec<_>>()
                .join("\n");
            blocks.push(format!("【已知信息】\n{}", lines));
        }

        if !self.episodes.is_empty() {
            let lines = self
                .episodes
                .iter()
                .map(|ep| format!("- {}", ep.summary))
                .collect::<Vec<_>>()
                .join("\n");
            blocks.push(format!("【相关记忆】\n{}", lines));
        }

        blocks.join("\n\n").trim().to_string()
    }
}
