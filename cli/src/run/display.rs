//! Formatting a persisted [`Message`](loom::message::Message) for `tail` output.

use loom::message::{Message, Part, Role};

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// One-line summary of a message's text content, for `loom tail`.
///
/// Non-text parts (reasoning, file, dynamic-tool) are summarized by kind
/// rather than their full content, matching the CLI's job of eyeballing a
/// conversation rather than reconstructing it byte for byte.
pub fn format_message_line(m: &Message) -> String {
    let text: String = m
        .parts
        .iter()
        .map(|p| match p {
            Part::Text { text } => text.clone(),
            Part::Reasoning { .. } => "[reasoning]".to_string(),
            Part::File { media_type, .. } => format!("[file: {}]", media_type),
            Part::DynamicTool { tool_name, .. } => format!("[tool: {}]", tool_name),
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("{:<9} {}", format!("{}:", role_label(m.role)), text)
}
