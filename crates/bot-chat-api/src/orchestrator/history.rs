//! History normalization: the chain consumes prior turns as chat-completion
//! messages, with consecutive turns of the same role grouped into one
//! message.

use crate::models::{ChatMessage, ChatTurn, TurnRole};

fn role_name(role: TurnRole) -> &'static str {
    match role {
        TurnRole::Human => "user",
        TurnRole::Ai => "assistant",
    }
}

/// Groups consecutive turns of the same role into single messages, in order.
pub fn group_turns(history: &[ChatTurn]) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::new();

    for turn in history {
        let role = role_name(turn.role);
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push('\n');
                last.content.push_str(&turn.text);
            }
            _ => messages.push(ChatMessage {
                role: role.to_string(),
                content: turn.text.clone(),
            }),
        }
    }

    messages
}

/// The response history: input turns plus the new human turn and the new ai
/// turn, in that order.
pub fn extend_history(history: &[ChatTurn], human: &str, ai: &str) -> Vec<ChatTurn> {
    let mut extended = history.to_vec();
    extended.push(ChatTurn::human(human));
    extended.push(ChatTurn::ai(ai));
    extended
}
