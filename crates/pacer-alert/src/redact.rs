use std::sync::LazyLock;

use pacer_core::Payload;
use regex::Regex;
use serde_json::Value;

pub const DEFAULT_PREVIEW_CHARS: usize = 160;

const MASK: &str = "***";

const SENSITIVE_KEYS: &[&str] = &[
    "password", "passwd", "secret", "token", "api_key", "apikey", "authorization", "cookie", "session_token", "email",
    "phone", "ssn",
];

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("email pattern"));

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\+?\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").expect("phone pattern"));

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| key.contains(k))
}

/// `text` with e-mail addresses and phone numbers masked.
pub fn mask_text(text: &str) -> String {
    let text = EMAIL_RE.replace_all(text, MASK);
    PHONE_RE.replace_all(&text, MASK).into_owned()
}

/// Copy of `payload` with sensitive fields and PII-looking strings masked.
pub fn redact(payload: &Payload) -> Payload {
    match payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) { Value::String(MASK.into()) } else { redact(v) };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) => Value::String(mask_text(s)),
        other => other.clone(),
    }
}

/// Redacted, single-line JSON preview truncated to `max_chars` characters.
pub fn payload_preview(payload: &Payload, max_chars: usize) -> String {
    let text = redact(payload).to_string();
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
