use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, EFFECT_ARG_ALIASES, IMAGE_KEY_COMMANDS, IMAGE_PREFIX, NO_ARG_COMMANDS,
    RAW_ARG_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn effect_field(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_ascii_lowercase();
    EFFECT_ARG_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, field)| *field)
}

/// Splits `/adjust` tokens into effect updates and the tokens that made no sense.
fn parse_effect_args(tokens: &[String]) -> (BTreeMap<String, Value>, Vec<String>) {
    let mut updates = BTreeMap::new();
    let mut invalid = Vec::new();

    for token in tokens {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (token.as_str(), None),
        };
        let Some(field) = effect_field(name) else {
            invalid.push(token.clone());
            continue;
        };

        let parsed = match (field, value) {
            ("brightness" | "contrast", Some(raw)) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|number| number.is_finite())
                .map(Value::from),
            ("brightness" | "contrast", None) => None,
            (_, Some(raw)) => parse_switch(raw).map(Value::Bool),
            (_, None) => Some(Value::Bool(true)),
        };
        match parsed {
            Some(value) => {
                updates.insert(field.to_string(), value);
            }
            None => invalid.push(token.clone()),
        }
    }

    (updates, invalid)
}

/// Returns the prompt following the image marker, or `None` when the line is
/// not an image request. The prompt is trimmed and may be empty.
pub fn image_prompt(text: &str) -> Option<String> {
    let trimmed = text.trim_start();
    let head = trimmed.get(..IMAGE_PREFIX.len())?;
    if !head.eq_ignore_ascii_case(IMAGE_PREFIX) {
        return None;
    }
    Some(trimmed[IMAGE_PREFIX.len()..].trim().to_string())
}

/// A `/word` line names a command only when the word is one of ours, stands
/// alone before whitespace, and carries arguments only where the command takes
/// them. Anything else is ordinary chat.
fn parse_command(text: &str, raw_trimmed: &str) -> Option<Intent> {
    let slash_tail = raw_trimmed.strip_prefix('/')?;
    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    let rest = &slash_tail[command_len..];
    if command_len == 0 || rest.chars().next().is_some_and(|ch| !ch.is_whitespace()) {
        return None;
    }
    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = rest.trim();

    if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
        let mut intent = Intent::new(action, text);
        intent
            .command_args
            .insert("model".to_string(), Value::String(arg.to_string()));
        return Some(intent);
    }

    if let Some(action) = find_action(&command, IMAGE_KEY_COMMANDS) {
        let mut intent = Intent::new(action, text);
        let mut tokens = split_args(arg).into_iter();
        intent.command_args.insert(
            "key".to_string(),
            Value::String(tokens.next().unwrap_or_default()),
        );
        let rest: Vec<String> = tokens.collect();
        match action {
            "adjust" => {
                let (updates, invalid) = parse_effect_args(&rest);
                intent.settings_update = updates;
                intent.command_args.insert(
                    "invalid".to_string(),
                    Value::Array(invalid.into_iter().map(Value::String).collect()),
                );
            }
            "download" => {
                let path = if rest.is_empty() {
                    Value::Null
                } else {
                    Value::String(rest.join(" "))
                };
                intent.command_args.insert("path".to_string(), path);
            }
            _ => {}
        }
        return Some(intent);
    }

    find_action(&command, NO_ARG_COMMANDS)
        .filter(|_| arg.is_empty())
        .map(|action| Intent::new(action, text))
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(prompt) = image_prompt(raw_trimmed) {
        let mut intent = Intent::new("generate_image", text);
        intent.prompt = Some(prompt);
        return intent;
    }

    if let Some(intent) = parse_command(text, raw_trimmed) {
        return intent;
    }

    let mut intent = Intent::new("chat", text);
    intent.prompt = Some(text.to_string());
    intent
}
