//! ChatML prompt construction

use crate::types::message::{ChatMessage, ChatRole};

const TURN_START: &str = "<|im_start|>";
const TURN_END: &str = "<|im_end|>";

/// Renders a conversation as ChatML.
///
/// Each turn becomes `<|im_start|>{role}\n{content}\n<|im_end|>`, turns are
/// joined with a single newline, and a non-empty system prompt comes first.
pub struct PromptFormatter;

impl PromptFormatter {
    pub fn format(system_prompt: &str, history: &[ChatMessage]) -> String {
        let system = (!system_prompt.is_empty()).then_some((ChatRole::System, system_prompt));
        let turns = history.iter().map(|m| (m.role, m.content.as_str()));

        let mut out = String::new();
        for (role, content) in system.into_iter().chain(turns) {
            if !out.is_empty() {
                out.push('\n');
            }
            push_turn(&mut out, role, content);
        }
        out
    }

    /// [`format`](Self::format) followed by an open assistant turn for the
    /// model to complete.
    pub fn generation_prompt(system_prompt: &str, history: &[ChatMessage]) -> String {
        let mut prompt = Self::format(system_prompt, history);
        prompt.push('\n');
        prompt.push_str(TURN_START);
        prompt.push_str(ChatRole::Assistant.as_str());
        prompt.push('\n');
        prompt
    }
}

fn push_turn(out: &mut String, role: ChatRole, content: &str) {
    out.push_str(TURN_START);
    out.push_str(role.as_str());
    out.push('\n');
    out.push_str(content);
    out.push('\n');
    out.push_str(TURN_END);
}
