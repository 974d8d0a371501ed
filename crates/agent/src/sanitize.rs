// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Redaction of sensitive request data before records leave the tap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

pub const REDACTED: &str = "[REDACTED]";
pub const TRUNCATED_MARKER: &str = "...[truncated]";

const DEFAULT_MAX_BODY_SIZE: usize = 100 * 1024;

fn default_tokens() -> Vec<String> {
    ["password", "token", "secret", "key", "apikey", "api_key", "access_token"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_headers() -> Vec<String> {
    ["authorization", "cookie", "x-auth-token"].iter().map(|s| (*s).to_owned()).collect()
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SanitizeOptions {
    /// Query parameters redacted when their name contains a token.
    pub sanitize_params: Vec<String>,
    /// Headers redacted on an exact (case-insensitive) name match.
    pub sanitize_headers: Vec<String>,
    /// Body fields redacted when their name contains a token.
    pub sanitize_body_fields: Vec<String>,
    /// Bodies longer than this are truncated.
    pub max_body_size: usize,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            sanitize_params: default_tokens(),
            sanitize_headers: default_headers(),
            sanitize_body_fields: default_tokens(),
            max_body_size: default_max_body_size(),
        }
    }
}

fn name_matches_token(name: &str, tokens: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    tokens.iter().any(|t| lower.contains(&t.to_ascii_lowercase()))
}

/// Redact matching query parameter values. Unparseable URLs pass through
/// unchanged.
pub fn sanitize_url(raw: &str, tokens: &[String]) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.to_owned();
    };
    let Some(query) = parsed.query().map(str::to_owned) else {
        return raw.to_owned();
    };

    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| {
            let (name, _) = pair.split_once('=').unwrap_or((pair, ""));
            if name_matches_token(name, tokens) {
                format!("{name}={REDACTED}")
            } else {
                pair.to_owned()
            }
        })
        .collect();

    parsed.set_query(Some(&redacted.join("&")));
    parsed.to_string()
}

/// Redact header values whose name is in the configured set.
pub fn sanitize_headers(
    headers: &BTreeMap<String, String>,
    names: &[String],
) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(key, value)| {
            if names.iter().any(|n| n.eq_ignore_ascii_case(key)) {
                (key.clone(), REDACTED.to_owned())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

/// Redact matching fields in a request/response body.
///
/// Recognizes JSON text (recursive redaction), multipart form-data
/// entries, and form-encoded pairs; anything else passes through. The
/// result is truncated at `max_body_size`.
pub fn sanitize_body(body: &str, options: &SanitizeOptions) -> String {
    let tokens = &options.sanitize_body_fields;
    let scrubbed = if let Ok(value) = serde_json::from_str::<Value>(body) {
        serde_json::to_string(&scrub_value(value, tokens)).unwrap_or_else(|_| body.to_owned())
    } else if looks_like_multipart(body) {
        scrub_multipart(body, tokens)
    } else if looks_like_form(body) {
        scrub_form(body, tokens)
    } else {
        body.to_owned()
    };
    truncate(scrubbed, options.max_body_size)
}

fn scrub_value(value: Value, tokens: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if name_matches_token(&key, tokens) {
                        (key, Value::String(REDACTED.to_owned()))
                    } else {
                        (key, scrub_value(value, tokens))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| scrub_value(v, tokens)).collect())
        }
        other => other,
    }
}

fn looks_like_form(body: &str) -> bool {
    !body.contains('\n') && body.split('&').all(|pair| pair.contains('='))
}

fn scrub_form(body: &str, tokens: &[String]) -> String {
    body.split('&')
        .map(|pair| {
            let (name, _) = pair.split_once('=').unwrap_or((pair, ""));
            if name_matches_token(name, tokens) {
                format!("{name}={REDACTED}")
            } else {
                pair.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn looks_like_multipart(body: &str) -> bool {
    body.contains("Content-Disposition: form-data;")
}

/// Blank out the value lines of multipart entries whose field name
/// matches. Works line-wise; the boundary lines are left untouched.
fn scrub_multipart(body: &str, tokens: &[String]) -> String {
    let mut redacting = false;
    let mut out: Vec<String> = Vec::new();
    for line in body.lines() {
        if let Some(name) = multipart_field_name(line) {
            redacting = name_matches_token(&name, tokens);
            out.push(line.to_owned());
            continue;
        }
        if line.starts_with("--") || line.starts_with("Content-") {
            if line.starts_with("--") {
                redacting = false;
            }
            out.push(line.to_owned());
            continue;
        }
        if redacting && !line.is_empty() {
            out.push(REDACTED.to_owned());
        } else {
            out.push(line.to_owned());
        }
    }
    out.join("\n")
}

fn multipart_field_name(line: &str) -> Option<String> {
    let rest = line.strip_prefix("Content-Disposition: form-data;")?;
    let start = rest.find("name=\"")? + "name=\"".len();
    let end = rest[start..].find('"')? + start;
    Some(rest[start..end].to_owned())
}

fn truncate(body: String, max: usize) -> String {
    if body.len() <= max {
        return body;
    }
    let mut cut = max;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = body[..cut].to_owned();
    out.push_str(TRUNCATED_MARKER);
    out
}

#[cfg(test)]
#[path = "sanitize_tests.rs"]
mod tests;
