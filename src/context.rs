//! Assembles the turn list handed to the inference engine: system prompt,
//! trimmed history, retrieved context, and the thinking-mode directive.

use crate::db::{ChatSettings, Model, Role};
use crate::engine::ChatTurn;
use crate::generator::ChatEntry;

/// Instruction appended to the system prompt when retrieved snippets are
/// injected into the final user turn.
pub const RAG_INSTRUCTION: &str = "Use the information inside the <context> tags to answer the \
user's question when it is relevant. If the context does not contain the answer, say so instead \
of guessing.";

const THINK_SUFFIX: &str = " /think";
const NO_THINK_SUFFIX: &str = " /no_think";

/// Build the engine input for the latest entry in `history`.
///
/// The last entry is the user message being answered. Prior entries are
/// filtered of `event` notices and trimmed to the chat's context window;
/// the final turn gets the thinking directive and, when `context` is
/// non-empty, the retrieved snippets wrapped in `<context>` tags.
pub fn assemble_generation_input(
    history: &[ChatEntry],
    context: &[String],
    settings: &ChatSettings,
    model: &Model,
) -> Vec<ChatTurn> {
    let Some((last, prior)) = history.split_last() else {
        return Vec::new();
    };

    let mut turns = Vec::new();

    let system = system_prompt(settings, !context.is_empty());
    if !system.is_empty() {
        turns.push(ChatTurn::new(Role::System, system));
    }

    let window: Vec<&ChatEntry> = prior
        .iter()
        .filter(|e| e.role != Role::Event)
        .collect();
    let start = window.len().saturating_sub(settings.context_window as usize);
    for entry in &window[start..] {
        turns.push(ChatTurn::new(entry.role, entry.content.clone()));
    }

    let mut content = last.content.clone();
    if let Some(suffix) = thinking_suffix(settings, model) {
        content.push_str(suffix);
    }
    if !context.is_empty() {
        content = format!("<context>{}</context> {}", context.join(" "), content);
    }
    turns.push(ChatTurn::new(last.role, content));

    turns
}

fn system_prompt(settings: &ChatSettings, has_context: bool) -> String {
    let mut prompt = settings.system_prompt.trim().to_string();
    if has_context {
        if prompt.is_empty() {
            prompt = RAG_INSTRUCTION.to_string();
        } else {
            prompt = format!("{prompt}\n\n{RAG_INSTRUCTION}");
        }
    }
    prompt
}

/// The per-chat override wins; absent one, thinking-capable models are
/// told not to think so responses stay fast by default.
fn thinking_suffix(settings: &ChatSettings, model: &Model) -> Option<&'static str> {
    match settings.thinking_enabled {
        Some(true) => Some(THINK_SUFFIX),
        Some(false) => Some(NO_THINK_SUFFIX),
        None if model.thinking => Some(NO_THINK_SUFFIX),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ModelOrigin;

    fn entry(role: Role, content: &str) -> ChatEntry {
        ChatEntry {
            client_id: 0,
            id: None,
            role,
            content: content.to_string(),
            model: None,
            metrics: None,
            created_at: 0,
        }
    }

    fn settings(window: i64, thinking: Option<bool>) -> ChatSettings {
        ChatSettings {
            chat_id: 1,
            system_prompt: "S".into(),
            context_window: window,
            thinking_enabled: thinking,
        }
    }

    fn model(thinking: bool) -> Model {
        Model {
            id: 1,
            name: "m".into(),
            origin: ModelOrigin::BuiltIn,
            is_downloaded: true,
            weights_uri: String::new(),
            tokenizer_uri: String::new(),
            tokenizer_config_uri: String::new(),
            param_count: None,
            size_bytes: None,
            featured: false,
            thinking,
        }
    }

    #[test]
    fn window_trims_oldest_turns_and_keeps_system_prompt() {
        // Window of 3 over [A, replyA, B, replyB, C]: A and replyA fall out.
        let history = vec![
            entry(Role::User, "A"),
            entry(Role::Assistant, "replyA"),
            entry(Role::User, "B"),
            entry(Role::Assistant, "replyB"),
            entry(Role::User, "C"),
        ];
        let turns =
            assemble_generation_input(&history, &[], &settings(3, Some(false)), &model(false));

        assert_eq!(turns.len(), 5);
        assert_eq!(turns[0], ChatTurn::new(Role::System, "S"));
        assert_eq!(turns[1], ChatTurn::new(Role::Assistant, "replyA"));
        assert_eq!(turns[2], ChatTurn::new(Role::User, "B"));
        assert_eq!(turns[3], ChatTurn::new(Role::Assistant, "replyB"));
        assert_eq!(turns[4], ChatTurn::new(Role::User, "C /no_think"));
    }

    #[test]
    fn event_entries_never_reach_the_engine() {
        let history = vec![
            entry(Role::User, "hello"),
            entry(Role::Event, "Source \"x\" was removed"),
            entry(Role::Assistant, "hi"),
            entry(Role::User, "next"),
        ];
        let turns =
            assemble_generation_input(&history, &[], &settings(10, Some(false)), &model(false));
        assert!(turns.iter().all(|t| t.role != Role::Event));
        assert_eq!(turns.len(), 4);
    }

    #[test]
    fn retrieved_context_wraps_final_turn_and_extends_system_prompt() {
        let history = vec![entry(Role::User, "what is X?")];
        let context = vec!["X is a thing.".to_string(), "X was invented in 1999.".to_string()];
        let turns = assemble_generation_input(
            &history,
            &context,
            &settings(6, Some(false)),
            &model(false),
        );

        assert!(turns[0].content.starts_with("S\n\n"));
        assert!(turns[0].content.contains("<context>"));
        let last = turns.last().unwrap();
        assert_eq!(
            last.content,
            "<context>X is a thing. X was invented in 1999.</context> what is X? /no_think"
        );
    }

    #[test]
    fn thinking_directive_follows_override_then_model_capability() {
        let history = vec![entry(Role::User, "Q")];

        let on = assemble_generation_input(&history, &[], &settings(6, Some(true)), &model(false));
        assert!(on.last().unwrap().content.ends_with(" /think"));

        let off = assemble_generation_input(&history, &[], &settings(6, Some(false)), &model(true));
        assert!(off.last().unwrap().content.ends_with(" /no_think"));

        let default_thinking =
            assemble_generation_input(&history, &[], &settings(6, None), &model(true));
        assert!(default_thinking
            .last()
            .unwrap()
            .content
            .ends_with(" /no_think"));

        let default_plain =
            assemble_generation_input(&history, &[], &settings(6, None), &model(false));
        assert_eq!(default_plain.last().unwrap().content, "Q");
    }

    #[test]
    fn empty_system_prompt_is_omitted_unless_context_needs_one() {
        let history = vec![entry(Role::User, "Q")];
        let mut s = settings(6, None);
        s.system_prompt = String::new();

        let without = assemble_generation_input(&history, &[], &s, &model(false));
        assert_eq!(without[0].role, Role::User);

        let with = assemble_generation_input(&history, &["snippet".into()], &s, &model(false));
        assert_eq!(with[0].role, Role::System);
        assert_eq!(with[0].content, RAG_INSTRUCTION);
    }
}
