//! `{{name}}` placeholder substitution.

use crate::model::Environment;
use regex::Regex;
use std::sync::LazyLock;

// Non-greedy by construction: the key cannot contain `}`.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([^}]+)\}\}").expect("failed to compile placeholder regex")
});

/// Replace every `{{key}}` in `text` with the value of the first
/// enabled variable named `key` in `env`.
///
/// Keys are trimmed before lookup. Unknown keys are left verbatim and
/// substituted values are not resolved again.
pub fn resolve(text: &str, env: Option<&Environment>) -> String {
    let Some(env) = env else {
        return text.to_string();
    };
    if !text.contains("{{") {
        return text.to_string();
    }

    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures| {
            match env.lookup(caps[1].trim()) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Keys referenced by placeholders in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Keys that [`resolve`] would leave verbatim.
pub fn unresolved(text: &str, env: Option<&Environment>) -> Vec<String> {
    placeholders(text)
        .into_iter()
        .filter(|key| env.and_then(|e| e.lookup(key)).is_none())
        .collect()
}
