//! Prompt assembly
//!
//! Builds the message sequence for one persona reply: a system message
//! (persona prompt, tone hint, optional retrieved passages, group-chat
//! behavior rules), the windowed history rendered as `"sender: content"`
//! lines, then the triggering user message.

use parley_core::{Message, Persona};
use parley_llm::ChatMessage;
use parley_retrieval::ScoredChunk;

/// Group-chat behavior rules appended to every persona's system prompt.
const GROUP_CHAT_RULES: &str = "\
You are taking part in a free-form group chat, not a question-answer service.

Speak up when:
- someone @-mentions you
- the topic touches your expertise or interests
- you can add, correct, or challenge something concrete
- the conversation has stalled and you have a fresh angle

Stay brief or silent when:
- someone already said it well
- the topic is outside your lane
- you would only be speaking to be seen

Style:
- stay in character; react like a real participant
- short messages are fine, so is disagreement
- you may @-mention another participant to bring them in";

/// Render the retrieved passages block, or an empty string when there
/// is nothing to inline.
fn render_passages(passages: &[ScoredChunk]) -> String {
    if passages.is_empty() {
        return String::new();
    }
    let body = passages
        .iter()
        .map(|p| format!("[{}] {}", p.source, p.text))
        .collect::<Vec<_>>()
        .join("\n---\n");
    format!(
        "\n\nRelevant background from your own memory (use it naturally, \
         do not cite it verbatim):\n{}\n",
        body
    )
}

/// Build the full prompt for one reply.
///
/// `history` should already be bounded by the caller; only the last
/// `persona.memory_window` entries are rendered.
pub fn build_messages(
    persona: &Persona,
    passages: &[ScoredChunk],
    history: &[Message],
    user_sender: &str,
    user_message: &str,
) -> Vec<ChatMessage> {
    let tone_line = if persona.tone.is_empty() {
        String::new()
    } else {
        format!("\nTone: {}.", persona.tone)
    };

    let system = format!(
        "You are {}. {}{}{}\n\n{}",
        persona.display_name,
        persona.system_prompt,
        tone_line,
        render_passages(passages),
        GROUP_CHAT_RULES
    );

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));

    let window_start = history.len().saturating_sub(persona.memory_window);
    for entry in &history[window_start..] {
        messages.push(ChatMessage::user(format!(
            "{}: {}",
            entry.sender, entry.content
        )));
    }

    messages.push(ChatMessage::user(format!(
        "[{} just said]: {}\n\nIt is your turn to speak.",
        user_sender, user_message
    )));

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_core::SessionId;
    use parley_llm::Role;

    fn persona(memory_window: usize) -> Persona {
        Persona {
            id: 1,
            owner: "alice".to_string(),
            handle: "maid".to_string(),
            display_name: "Madame Maid".to_string(),
            system_prompt: "A meticulous housekeeper.".to_string(),
            tone: "formal".to_string(),
            proactivity: 0.5,
            memory_window,
            max_agents_per_turn: 2,
            api_profile_id: None,
            embedding_profile_id: None,
            is_default: false,
            background_text: None,
            rag_top_k: 3,
            created_at: Utc::now(),
        }
    }

    fn message(sender: &str, content: &str) -> Message {
        Message {
            id: 0,
            session_id: SessionId::generate("alice").unwrap(),
            sender: sender.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            position: 0,
        }
    }

    #[test]
    fn test_system_message_composition() {
        let messages = build_messages(&persona(8), &[], &[], "user", "hello");
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("Madame Maid"));
        assert!(messages[0].content.contains("meticulous housekeeper"));
        assert!(messages[0].content.contains("Tone: formal"));
        assert!(messages[0].content.contains("group chat"));
    }

    #[test]
    fn test_history_rendered_with_sender_prefix() {
        let history = vec![message("user", "hi all"), message("bob", "hello")];
        let messages = build_messages(&persona(8), &[], &history, "user", "and you, maid?");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "user: hi all");
        assert_eq!(messages[2].content, "bob: hello");
        assert!(messages[3].content.contains("[user just said]: and you, maid?"));
    }

    #[test]
    fn test_memory_window_truncates_history() {
        let history: Vec<Message> = (0..10)
            .map(|i| message("user", &format!("m{}", i)))
            .collect();
        let messages = build_messages(&persona(3), &[], &history, "user", "now");
        // system + 3 history + trigger
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1].content, "user: m7");
    }

    #[test]
    fn test_passages_inlined_in_system() {
        let passages = vec![ScoredChunk {
            text: "The secret code is 42.".to_string(),
            source: "background".to_string(),
            score: 0.9,
        }];
        let messages = build_messages(&persona(8), &passages, &[], "user", "code?");
        assert!(messages[0].content.contains("The secret code is 42."));
        assert!(messages[0].content.contains("[background]"));
    }

    #[test]
    fn test_no_passage_block_when_empty() {
        let messages = build_messages(&persona(8), &[], &[], "user", "hi");
        assert!(!messages[0].content.contains("background from your own memory"));
    }
}
