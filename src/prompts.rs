//! Prompt text for the three content sub-steps and the panel illustrations.
//!
//! Every system prompt pins the exact JSON shape the matching
//! [`crate::model`] type deserialises from; [`crate::pipeline::content`]
//! rejects anything that does not fit. Keep the field lists here in sync
//! with the structs.

use crate::model::{GenerationOptions, Panel, ProcessedDocument, StoryStructure, TranslatedContent};
use crate::pipeline::visual::SharedContext;

/// Longest slice of source text sent to a single completion.
pub const MAX_SOURCE_CHARS: usize = 24_000;

pub const TRANSLATION_SYSTEM_PROMPT: &str = r#"You are a literary translator who adapts prose for comic books.
Translate the text into the requested language (or keep it if it is already in that language) and adapt idioms for the requested audience.

Respond with a single JSON object and nothing else:
{
  "original_language": "<ISO code>",
  "target_language": "<ISO code>",
  "translated_text": "<full adapted text>",
  "adaptations": ["<cultural or audience adaptation you made>"],
  "preserved_terms": ["<names or terms left untranslated>"],
  "translation_notes": ["<anything the story writer should know>"]
}"#;

pub const STORY_SYSTEM_PROMPT: &str = r#"You are a story editor who turns source material into a structure a comic can be drawn from.
Identify the characters, themes and narrative arcs. Every character needs a role of "protagonist", "antagonist" or "supporting" and a short visual appearance an illustrator can follow.

Respond with a single JSON object and nothing else:
{
  "title": "<title>",
  "genre": "<genre>",
  "summary": "<one paragraph>",
  "themes": ["<theme>"],
  "characters": [
    {"name": "<name>", "description": "<who they are>", "traits": ["<trait>"], "appearance": "<what they look like>", "role": "protagonist"}
  ],
  "arcs": ["<arc>"],
  "narrative_style": "<style>",
  "target_audience": "<audience>",
  "estimated_reading_time": "<e.g. 10 minutes>"
}"#;

pub const SCRIPT_SYSTEM_PROMPT: &str = r#"You are a comic scriptwriter. Break the story into panels.

Rules:
- Number panels 1, 2, 3, ... in reading order with no gaps.
- Number pages from 1 with no gaps; all panels of a page are consecutive.
- Use 2 to 6 panels per page and cover every requested page.
- Describe each panel visually: setting, characters present, action.
- Keep dialogue short enough to fit a speech balloon.

Respond with a single JSON object and nothing else:
{
  "title": "<title>",
  "total_pages": <int>,
  "total_panels": <int>,
  "panels": [
    {
      "panel_number": 1,
      "page_number": 1,
      "description": "<what the panel shows>",
      "dialogue": [{"character": "<name>", "text": "<line>"}],
      "captions": ["<narration>"],
      "sound_effects": ["<SFX>"],
      "camera_angle": "<wide shot, close-up, ...>",
      "mood": "<mood>",
      "key_elements": ["<must-draw element>"]
    }
  ],
  "color_palette": ["<colour>"],
  "style_guide": "<art direction shared by every panel>",
  "notes": ["<notes for the illustrator>"]
}"#;

pub fn translation_prompt(doc: &ProcessedDocument, options: &GenerationOptions) -> String {
    format!(
        "Source language: {}\nTarget language: {}\nTarget audience: {}\n\nText:\n\"\"\"\n{}\n\"\"\"",
        options.source_language.as_deref().unwrap_or(&doc.language),
        options.target_language,
        options.target_audience,
        truncate_chars(&doc.content, MAX_SOURCE_CHARS)
    )
}

pub fn story_prompt(translated: &TranslatedContent, options: &GenerationOptions) -> String {
    let mut prompt = format!(
        "Target audience: {}\nArt style: {}\nTarget length: {} page(s)\n",
        options.target_audience, options.art_style, options.target_pages
    );
    if let Some(title) = &options.title {
        prompt.push_str(&format!("Title: {title}\n"));
    }
    if !translated.translation_notes.is_empty() {
        prompt.push_str(&format!("Translator notes: {}\n", translated.translation_notes.join("; ")));
    }
    prompt.push_str(&format!(
        "\nText:\n\"\"\"\n{}\n\"\"\"",
        truncate_chars(&translated.translated_text, MAX_SOURCE_CHARS)
    ));
    prompt
}

pub fn script_prompt(story: &StoryStructure, options: &GenerationOptions) -> String {
    let cast = story
        .characters
        .iter()
        .map(|c| {
            let role = serde_json::to_string(&c.role).unwrap_or_default();
            format!("- {} ({}): {}", c.name, role.trim_matches('"'), c.appearance)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Write a {pages}-page comic script in {lang} for a {audience} audience, drawn in a {style} style.\n\n\
         Title: {title}\nGenre: {genre}\nSummary: {summary}\nThemes: {themes}\nArcs: {arcs}\n\nCharacters:\n{cast}",
        pages = options.target_pages,
        lang = options.target_language,
        audience = options.target_audience,
        style = options.art_style,
        title = options.title.as_deref().unwrap_or(&story.title),
        genre = story.genre,
        summary = story.summary,
        themes = story.themes.join(", "),
        arcs = story.arcs.join("; "),
    )
}

/// Build the image prompt for one panel from its own fields plus the
/// script-wide context shared by every panel.
pub fn illustration_prompt(panel: &Panel, ctx: &SharedContext) -> String {
    let mut parts = vec![panel.description.trim().to_string()];
    if !panel.key_elements.is_empty() {
        parts.push(format!("featuring {}", panel.key_elements.join(", ")));
    }
    if !panel.camera_angle.is_empty() {
        parts.push(panel.camera_angle.clone());
    }
    if !panel.mood.is_empty() {
        parts.push(format!("{} mood", panel.mood));
    }
    if !ctx.characters.is_empty() {
        parts.push(format!("characters: {}", ctx.characters.join(", ")));
    }
    if !ctx.color_palette.is_empty() {
        parts.push(format!("color palette: {}", ctx.color_palette.join(", ")));
    }
    if !ctx.style_guide.is_empty() {
        parts.push(ctx.style_guide.clone());
    }
    parts.push(format!("{} style", ctx.art_style));
    parts.push("comic book panel".to_string());
    parts.join(", ")
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DialogueLine;

    fn panel() -> Panel {
        Panel {
            panel_number: 1,
            page_number: 1,
            description: "A robot kneels beside a flower".into(),
            dialogue: vec![DialogueLine { character: "Unit-7".into(), text: "Hello.".into() }],
            captions: vec![],
            sound_effects: vec![],
            camera_angle: "close-up".into(),
            mood: "hopeful".into(),
            key_elements: vec!["red flower".into(), "sand dunes".into()],
        }
    }

    #[test]
    fn illustration_prompt_includes_shared_context() {
        let ctx = SharedContext {
            art_style: "cartoon".into(),
            color_palette: vec!["ochre".into(), "teal".into()],
            characters: vec!["Unit-7".into()],
            style_guide: "thick outlines".into(),
        };
        let p = illustration_prompt(&panel(), &ctx);
        assert!(p.starts_with("A robot kneels"));
        assert!(p.contains("red flower, sand dunes"));
        assert!(p.contains("close-up"));
        assert!(p.contains("hopeful mood"));
        assert!(p.contains("Unit-7"));
        assert!(p.contains("ochre, teal"));
        assert!(p.contains("cartoon style"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        assert_eq!(truncate_chars(s, 2), "hé");
        assert_eq!(truncate_chars(s, 100), s);
    }

    #[test]
    fn system_prompts_name_required_fields() {
        assert!(TRANSLATION_SYSTEM_PROMPT.contains("\"translated_text\""));
        assert!(STORY_SYSTEM_PROMPT.contains("\"characters\""));
        assert!(SCRIPT_SYSTEM_PROMPT.contains("\"page_number\""));
    }
}
