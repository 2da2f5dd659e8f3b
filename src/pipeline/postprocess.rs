//! Cleanup of model text before it is parsed as structured output.
//!
//! Chat models often disobey "respond with JSON only": they wrap the object
//! in a code fence, prepend a sentence, or leave zero-width characters in.
//! The rules here strip that packaging and nothing else. Whatever remains
//! must deserialise into the declared type exactly or the step fails.
//!
//! ## Rule Order
//!
//! 1. Normalise line endings (CRLF → LF)
//! 2. Strip invisible Unicode (BOM, zero-width spaces, soft hyphens)
//! 3. Strip an outer code fence (```` ```json ```` or bare ```` ``` ````)
//! 4. Cut to the outermost `{ … }` span

use crate::error::ComicError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n(.*?)\n?```\s*$").unwrap());

/// Parse model output for `step` into `T`, failing fast on any mismatch.
pub fn parse_structured<T: DeserializeOwned>(step: &str, raw: &str) -> Result<T, ComicError> {
    let json = extract_json(raw).ok_or_else(|| ComicError::MalformedOutput {
        step: step.to_string(),
        detail: format!("no JSON object found in {} chars of output", raw.len()),
    })?;
    serde_json::from_str(&json).map_err(|e| ComicError::MalformedOutput {
        step: step.to_string(),
        detail: e.to_string(),
    })
}

/// Locate the JSON object inside raw model output.
pub fn extract_json(raw: &str) -> Option<String> {
    let s = normalise_line_endings(raw);
    let s = remove_invisible_chars(&s);
    let s = strip_code_fences(&s);
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end < start {
        return None;
    }
    Some(s[start..=end].to_string())
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

fn strip_code_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Thing {
        name: String,
        count: u32,
    }

    #[test]
    fn plain_json_passes_through() {
        let t: Thing = parse_structured("t", r#"{"name":"a","count":2}"#).unwrap();
        assert_eq!(t, Thing { name: "a".into(), count: 2 });
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let raw = "```json\r\n{\"name\":\"a\",\"count\":1}\r\n```";
        let t: Thing = parse_structured("t", raw).unwrap();
        assert_eq!(t.count, 1);
    }

    #[test]
    fn chatter_around_object_is_dropped() {
        let raw = "Sure! Here is the result:\n{\"name\":\"a\",\"count\":3}\nHope this helps.";
        let t: Thing = parse_structured("t", raw).unwrap();
        assert_eq!(t.count, 3);
    }

    #[test]
    fn bom_and_zero_width_are_removed() {
        let raw = "\u{FEFF}{\"name\":\"a\u{200B}b\",\"count\":0}";
        let t: Thing = parse_structured("t", raw).unwrap();
        assert_eq!(t.name, "ab");
    }

    #[test]
    fn prose_is_malformed() {
        let err = parse_structured::<Thing>("story structuring", "Once upon a time").unwrap_err();
        assert!(matches!(err, ComicError::MalformedOutput { ref step, .. } if step == "story structuring"));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let err = parse_structured::<Thing>("t", r#"{"name":"a"}"#).unwrap_err();
        match err {
            ComicError::MalformedOutput { detail, .. } => assert!(detail.contains("count")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
