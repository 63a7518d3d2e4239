//! Text preparation for synthesis: markup stripping and control escaping.
//!
//! Pure functions, no I/O. Input arrives as raw bytes from the request layer
//! together with a [`MessageType`]; the result is plain text the engine can
//! consume without a markup parser.

use regex::Regex;
use std::sync::LazyLock;

use crate::types::MessageType;

static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static RE_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(lt|gt|amp|quot|apos|#[0-9]+|#x[0-9a-fA-F]+);").unwrap());
static RE_MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

/// Remove markup tags and decode the XML entities left behind.
pub fn strip_markup(text: &str) -> String {
    let without_tags = RE_TAG.replace_all(text, " ");
    RE_ENTITY
        .replace_all(&without_tags, |caps: &regex::Captures| decode_entity(&caps[1]))
        .into_owned()
}

fn decode_entity(name: &str) -> String {
    match name {
        "lt" => "<".into(),
        "gt" => ">".into(),
        "amp" => "&".into(),
        "quot" => "\"".into(),
        "apos" => "'".into(),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x") {
                u32::from_str_radix(hex, 16).ok()
            } else {
                name[1..].parse().ok()
            };
            code.and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        }
    }
}

/// Replace control characters with spaces so they never reach the engine.
///
/// Newlines and tabs are whitespace to the engine and are kept.
pub fn escape_control(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

fn collapse(text: &str) -> String {
    RE_MULTI_SPACE.replace_all(text, " ").trim().to_string()
}

/// Turn a raw speak payload into engine input.
pub fn prepare_input(data: &[u8], msg_type: MessageType) -> String {
    let text = String::from_utf8_lossy(data);
    let prepared = match msg_type {
        MessageType::Text => strip_markup(&text),
        MessageType::Char => match text.chars().next() {
            Some(' ') => "space".to_string(),
            Some(c) => c.to_string(),
            None => String::new(),
        },
        MessageType::Key | MessageType::SoundIcon => text.replace(['_', '-'], " "),
        MessageType::Spell => {
            let stripped = strip_markup(&text);
            stripped
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(String::from)
                .collect::<Vec<_>>()
                .join(" ")
        }
    };
    collapse(&escape_control(&prepared))
}
