//! JSON salvage: repairing malformed LLM output without re-calling the model.
//!
//! Models wrap JSON in markdown fences, prefix it with prose, emit bare keys,
//! or leave trailing commas. The salvage chain applies, in order: fenced-block
//! extraction, outermost balanced-brace location, bare-key quoting, and
//! trailing-comma stripping, re-parsing after each repair.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Result of a successful salvage: the parsed value and how many repair
/// attempts it took (0 = parsed as-is).
#[derive(Debug)]
pub struct Salvaged {
    pub value: Value,
    pub attempts: u32,
}

/// Attempt to recover a JSON object from raw model output.
pub fn salvage_json(raw: &str) -> Result<Salvaged, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty response".to_string());
    }

    let mut attempts = 0u32;

    // As-is.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(Salvaged { value, attempts });
        }
    }

    // Fenced block, if present.
    let candidate = match extract_fenced(trimmed) {
        Some(inner) => {
            attempts += 1;
            inner
        }
        None => trimmed,
    };
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        if value.is_object() {
            return Ok(Salvaged { value, attempts });
        }
    }

    // Outermost balanced braces.
    let candidate = match outer_braces(candidate) {
        Some(inner) => {
            attempts += 1;
            inner
        }
        None => return Err("no JSON object found".to_string()),
    };
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        if value.is_object() {
            return Ok(Salvaged { value, attempts });
        }
    }

    // Quote bare keys, then strip trailing commas.
    attempts += 1;
    let repaired = strip_trailing_commas(&quote_bare_keys(candidate));
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) if value.is_object() => Ok(Salvaged { value, attempts }),
        Ok(_) => Err("salvaged value is not an object".to_string()),
        Err(e) => Err(format!("unparseable after repair: {}", e)),
    }
}

/// Extract the contents of a ```json fenced block (or a bare ``` block).
fn extract_fenced(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }
    if let Some(start) = text.find("```") {
        let after_tick = &text[start + 3..];
        // Skip past any language identifier on the same line.
        let content_start = after_tick.find('\n').map_or(0, |n| n + 1);
        if let Some(end) = after_tick[content_start..].find("```") {
            return Some(after_tick[content_start..content_start + end].trim());
        }
    }
    None
}

/// Locate the outermost balanced `{…}`, respecting string literals.
fn outer_braces(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

static BARE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("static pattern"));

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#",\s*([}\]])"#).expect("static pattern"));

fn quote_bare_keys(text: &str) -> String {
    BARE_KEY.replace_all(text, r#"$1"$2":"#).into_owned()
}

fn strip_trailing_commas(text: &str) -> String {
    TRAILING_COMMA.replace_all(text, "$1").into_owned()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_json_passes_with_zero_attempts() {
        let s = salvage_json(r#"{"confidence": 0.8}"#).unwrap();
        assert_eq!(s.attempts, 0);
        assert_eq!(s.value["confidence"], 0.8);
    }

    #[test]
    fn markdown_fenced_json() {
        let raw = "Here is the analysis:\n```json\n{\"risk\": \"low\"}\n```\nDone.";
        let s = salvage_json(raw).unwrap();
        assert_eq!(s.value["risk"], "low");
        assert!(s.attempts >= 1);
    }

    #[test]
    fn bare_fence_without_language_tag() {
        let raw = "```\n{\"a\": 1}\n```";
        let s = salvage_json(raw).unwrap();
        assert_eq!(s.value["a"], 1);
    }

    #[test]
    fn prefixed_prose_with_embedded_object() {
        let raw = "Sure! The result is {\"a\": {\"b\": 2}} as requested.";
        let s = salvage_json(raw).unwrap();
        assert_eq!(s.value["a"]["b"], 2);
    }

    #[test]
    fn unquoted_keys_are_repaired() {
        let raw = "{confidence: 0.7, risk_level: \"low\"}";
        let s = salvage_json(raw).unwrap();
        assert_eq!(s.value["confidence"], 0.7);
        assert_eq!(s.value["risk_level"], "low");
    }

    #[test]
    fn trailing_commas_are_stripped() {
        let raw = r#"{"items": ["a", "b",], "n": 2,}"#;
        let s = salvage_json(raw).unwrap();
        assert_eq!(s.value["n"], 2);
        assert_eq!(s.value["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn combined_fence_bare_keys_trailing_comma() {
        let raw = "```json\n{summary: \"ok\", factors: [\"x\",],}\n```";
        let s = salvage_json(raw).unwrap();
        assert_eq!(s.value["summary"], "ok");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let raw = "note: {\"text\": \"use {braces} carefully\", \"ok\": true}";
        let s = salvage_json(raw).unwrap();
        assert_eq!(s.value["ok"], true);
    }

    #[test]
    fn genuinely_broken_output_fails() {
        assert!(salvage_json("I could not produce the analysis, sorry.").is_err());
        assert!(salvage_json("").is_err());
        assert!(salvage_json("{\"unterminated\": ").is_err());
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(salvage_json("[1, 2, 3]").is_err());
    }
}
