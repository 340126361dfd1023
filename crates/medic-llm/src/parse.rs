//! JSON extraction from prose-wrapped model output.
//!
//! Models asked for JSON still wrap it in code fences or lead with
//! prose. The extractor peels ```json fences (finding the last closing
//! fence, since the payload may embed code examples) and otherwise
//! falls back to brace matching from the first `{`.

/// Extract the JSON payload from a model response.
#[must_use]
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let after = &text[start + "```json".len()..];
        if let Some(end) = after.rfind("\n```").or_else(|| after.rfind("```")) {
            return after[..end].trim();
        }
        return after.trim();
    }

    if let Some(start) = text.find("```\n{") {
        let after = &text[start + "```\n".len()..];
        if let Some(end) = after.rfind("\n```").or_else(|| after.rfind("```")) {
            return after[..end].trim();
        }
        return after.trim();
    }

    if let Some(first_brace) = text.find('{') {
        let candidate = &text[first_brace..];
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in candidate.char_indices() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &candidate[..=i];
                    }
                }
                _ => {}
            }
        }
        return candidate;
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json_passes_through() {
        assert_eq!(extract_json(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here is the diagnosis:\n```json\n{\"summary\": \"x\"}\n```\nDone.";
        assert_eq!(extract_json(text), "{\"summary\": \"x\"}");
    }

    #[test]
    fn test_fence_with_embedded_code_block() {
        let text = "```json\n{\"fix\": \"run ```cargo test``` locally\"}\n```";
        assert_eq!(
            extract_json(text),
            "{\"fix\": \"run ```cargo test``` locally\"}"
        );
    }

    #[test]
    fn test_prose_then_braces() {
        let text = "The answer is {\"a\": {\"b\": 2}} as requested";
        assert_eq!(extract_json(text), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let text = r#"{"cmd": "awk '{print $1}'"} trailing"#;
        assert_eq!(extract_json(text), r#"{"cmd": "awk '{print $1}'"}"#);
    }
}
