//! LM prompts for field-group and entity extraction.
//!
//! Prompts are built from the compiled schema and the project's
//! extraction context; the wording pushes the model toward strict JSON
//! with explicit nulls instead of guesses.

use crate::chunker::DocumentChunk;
use crate::traits::lm::ChatMessage;
use crate::types::project::{EntityTypeDef, ExtractionContext};
use crate::types::schema::FieldGroup;

/// Shared strict-JSON instructions appended to every system prompt.
const JSON_RULES: &str = r#"Output rules:
- Respond with a single JSON object and nothing else: no markdown fences, no commentary.
- Use null for any field you cannot find clear evidence for.
- Only output true for a boolean field when the text clearly states it.
- Do not invent values; an absent fact is null, not a guess."#;

/// System prompt for one field group.
pub fn field_group_system_prompt(group: &FieldGroup, context: &ExtractionContext) -> String {
    let mut prompt = format!(
        "You are extracting {} from {}.\n\nFields to extract:\n",
        group.description, context.source_type
    );
    for field in &group.fields {
        let mut line = format!(
            "- \"{}\" ({}): {}",
            field.name,
            field.field_type.prompt_name(),
            field.description
        );
        if !field.enum_values.is_empty() {
            line.push_str(&format!(" Allowed values: {}.", field.enum_values.join(", ")));
        }
        prompt.push_str(&line);
        prompt.push('\n');
    }

    if group.is_entity_list {
        prompt.push_str(
            "\nReturn JSON of the form {\"records\": [...], \"confidence\": 0.0-1.0} where each record carries the fields above.\n",
        );
    } else {
        prompt.push_str(
            "\nReturn JSON of the form {\"data\": {...fields above...}, \"confidence\": 0.0-1.0}.\n",
        );
    }

    if let Some(hint) = &group.prompt_hint {
        prompt.push('\n');
        prompt.push_str(hint);
        prompt.push('\n');
    }

    prompt.push('\n');
    prompt.push_str(JSON_RULES);
    prompt
}

/// User prompt carrying the chunk text.
pub fn field_group_user_prompt(
    context: &ExtractionContext,
    source_context: &str,
    chunk: &DocumentChunk,
    content_limit: usize,
) -> String {
    let mut prompt = format!("{}: {}\n", context.source_label, source_context);
    if !chunk.header_path.is_empty() {
        prompt.push_str(&format!("Section: {}\n", chunk.header_path.join(" > ")));
    }
    if chunk.total_chunks > 1 {
        prompt.push_str(&format!(
            "Part {} of {}.\n",
            chunk.chunk_index + 1,
            chunk.total_chunks
        ));
    }
    prompt.push('\n');
    prompt.push_str(truncate(&chunk.content, content_limit));
    prompt
}

/// Messages for one `(group, chunk)` extraction request.
pub fn field_group_messages(
    group: &FieldGroup,
    context: &ExtractionContext,
    source_context: &str,
    chunk: &DocumentChunk,
    content_limit: usize,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(field_group_system_prompt(group, context)),
        ChatMessage::user(field_group_user_prompt(
            context,
            source_context,
            chunk,
            content_limit,
        )),
    ]
}

/// Messages asking for entity records over one extraction's data.
pub fn entity_messages(
    entity_types: &[EntityTypeDef],
    context: &ExtractionContext,
    source_group: &str,
    data: &serde_json::Map<String, serde_json::Value>,
) -> Vec<ChatMessage> {
    let mut system = format!(
        "You identify named entities in structured facts extracted from {}.\n\nEntity types:\n",
        context.source_type
    );
    for t in entity_types {
        let mut line = format!("- \"{}\": {}", t.name, t.description);
        if let Some(hint) = &t.value_hint {
            line.push_str(&format!(" ({})", hint));
        }
        system.push_str(&line);
        system.push('\n');
    }
    system.push_str(
        "\nReturn JSON of the form {\"entities\": [{\"entity_type\": ..., \"value\": ..., \"attributes\": {...}}]}. Only emit entities of the listed types.\n\n",
    );
    system.push_str(JSON_RULES);

    let user = format!(
        "{}: {}\n\nExtracted facts:\n{}",
        context.source_label,
        source_group,
        serde_json::to_string_pretty(data).unwrap_or_default()
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// Truncate on a char boundary.
fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
