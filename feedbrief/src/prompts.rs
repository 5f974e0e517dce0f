// Persona-shaped prompt assembly. Personas are only ever read here.
use common::Persona;
use serde_json::{json, Value};

use crate::entry::ProcessedItem;

pub const IMAGE_SYSTEM_PROMPT: &str = "You describe images attached to forum and news posts. \
Describe what the image shows in two or three factual sentences. If it contains text, \
charts or code, transcribe the essential parts. Do not speculate beyond what is visible.";

pub fn image_user_prompt(title: &str) -> String {
    format!("The image was posted with the title: \"{}\". Describe it.", title)
}

pub fn link_system_prompt(max_words: usize) -> String {
    format!(
        "You summarize web pages linked from posts. Write a plain-text summary of at most {} words \
covering the main claims, results and any concrete numbers. Do not add opinions, headings or markdown.",
        max_words
    )
}

pub fn link_user_prompt(url: &str, page_title: &str, page_text: &str) -> String {
    format!("URL: {}\nTitle: {}\n\n{}", url, page_title, page_text)
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none specified)\n".to_string();
    }
    items.iter().map(|i| format!("- {}\n", i)).collect()
}

fn persona_header(persona: &Persona) -> String {
    let mut out = String::new();
    if !persona.identity.is_empty() {
        out.push_str(&format!("You are writing for {}.\n\n", persona.identity));
    }
    out.push_str("Focus areas:\n");
    out.push_str(&bullet_list(&persona.focus_areas));
    out.push_str("\nAn item is RELEVANT when it matches any of:\n");
    out.push_str(&bullet_list(&persona.relevance_criteria));
    out.push_str("\nAn item is NOT relevant when it matches any of:\n");
    out.push_str(&bullet_list(&persona.exclusion_criteria));
    out
}

pub fn summary_system_prompt(persona: &Persona) -> String {
    format!(
        "{header}
For the item below, decide whether it is relevant and summarize it.
- Write the summary in {paragraphs} short paragraph(s), {style}, at a {depth} technical depth.
- If comments are present, summarize the discussion in one or two sentences as comment_summary; otherwise leave it empty.
- Give a one-sentence relevance_reason.

Respond with a single JSON object with the keys: summary, comment_summary, is_relevant, relevance_reason.",
        header = persona_header(persona),
        paragraphs = persona.summary_paragraphs.max(1),
        style = persona.writing_style,
        depth = persona.technical_depth,
    )
}

pub fn summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "comment_summary": { "type": "string" },
            "is_relevant": { "type": "boolean" },
            "relevance_reason": { "type": "string" }
        },
        "required": ["summary", "comment_summary", "is_relevant", "relevance_reason"],
        "additionalProperties": false
    })
}

pub fn digest_system_prompt(persona: &Persona) -> String {
    format!(
        "{header}
You receive the relevant items of today's feeds as a JSON array. Write a digest:
- summary: an overall narrative of {paragraphs} paragraph(s), {style}.
- key_developments: the most important developments, each with the id of the item it comes from (item_id must be one of the given ids).
- emerging_trends: short phrases naming patterns across items.
- technical_highlight: the single most technically interesting point, at a {depth} depth.

Respond with a single JSON object with the keys: summary, key_developments, emerging_trends, technical_highlight.",
        header = persona_header(persona),
        paragraphs = persona.summary_paragraphs.max(1),
        style = persona.writing_style,
        depth = persona.technical_depth,
    )
}

pub fn digest_user_prompt(items: &[&ProcessedItem]) -> String {
    let payload: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({
                "id": item.id,
                "title": item.title,
                "summary": item.summary,
                "comment_summary": item.comment_summary,
            })
        })
        .collect();
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "[]".to_string())
}

pub fn digest_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "key_developments": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "item_id": { "type": "string" }
                    },
                    "required": ["text", "item_id"],
                    "additionalProperties": false
                }
            },
            "emerging_trends": { "type": "array", "items": { "type": "string" } },
            "technical_highlight": { "type": "string" }
        },
        "required": ["summary", "key_developments", "emerging_trends", "technical_highlight"],
        "additionalProperties": false
    })
}
