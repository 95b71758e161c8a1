use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());

/// OpenAI-compatible endpoints live under a version segment. A trailing `#`
/// opts out of the rewrite.
pub fn check_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed.ends_with('#') {
        return trimmed.trim_end_matches('#').trim_end_matches('/').to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SUFFIX_RE.is_match(without_slash) || without_slash.contains("/v1") {
        without_slash.to_string()
    } else {
        format!("{without_slash}/v1")
    }
}

/// Ollama's native API sits at the server root, so a copied OpenAI-style
/// `/v1` suffix is dropped.
pub fn ollama_base_url(input: &str) -> String {
    let without_slash = input.trim().trim_end_matches('/');
    VERSION_SUFFIX_RE
        .replace(without_slash, "")
        .trim_end_matches('/')
        .to_string()
}
