//! Parser for the prediction-text action grammar.
//!
//! The model answers in the form:
//!
//! ```text
//! Thought: the settings icon is in the top right corner
//! Action: click(start_box='[0.91,0.05,0.95,0.09]')
//! ```
//!
//! Multiple actions are separated by blank lines after `Action:`. Unknown
//! action names are rejected outright; a silently ignored action would
//! desynchronize the loop from the model's plan.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::agent::state::{Action, Box2, ScrollDirection};
use crate::errors::{PilotError, PilotResult};

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^([a-z_][a-z0-9_]*)\s*\((.*)\)\s*$").unwrap())
}

/// Splits a raw prediction into its thought and parsed actions.
pub fn parse_prediction(raw: &str) -> PilotResult<(Option<String>, Vec<Action>)> {
    let marker = "Action:";
    let Some(idx) = raw.find(marker) else {
        return Err(PilotError::Prediction(format!(
            "no '{marker}' section in prediction: {}",
            snippet(raw)
        )));
    };

    let head = raw[..idx].trim();
    let thought = head
        .strip_prefix("Thought:")
        .or_else(|| head.strip_prefix("Reflection:"))
        .unwrap_or(head)
        .trim();
    let thought = (!thought.is_empty()).then(|| thought.to_string());

    let mut actions = Vec::new();
    for segment in raw[idx + marker.len()..].split("\n\n") {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        actions.push(parse_action(segment)?);
    }
    if actions.is_empty() {
        return Err(PilotError::Prediction(format!(
            "empty action section in prediction: {}",
            snippet(raw)
        )));
    }
    Ok((thought, actions))
}

/// Parses a single `name(arg='value', ...)` call into an `Action`.
pub fn parse_action(text: &str) -> PilotResult<Action> {
    let captures = call_regex().captures(text.trim()).ok_or_else(|| {
        PilotError::Prediction(format!("malformed action call: {}", snippet(text)))
    })?;
    let name = &captures[1];
    let args = parse_args(&captures[2]);

    match name {
        "click" | "left_single" => Ok(Action::Click { start_box: require_box(&args, "start_box", name)? }),
        "left_double" | "double_click" => {
            Ok(Action::DoubleClick { start_box: require_box(&args, "start_box", name)? })
        }
        "right_single" | "right_click" => {
            Ok(Action::RightClick { start_box: require_box(&args, "start_box", name)? })
        }
        "drag" => Ok(Action::Drag {
            start_box: require_box(&args, "start_box", name)?,
            end_box: require_box(&args, "end_box", name)?,
        }),
        "hotkey" => {
            let key = require_arg(&args, "key", name)?;
            if key.is_empty() {
                return Err(PilotError::Prediction("hotkey with empty key".into()));
            }
            Ok(Action::Hotkey { key })
        }
        "type" => Ok(Action::Type { content: require_arg(&args, "content", name)? }),
        "scroll" => {
            let direction: ScrollDirection = require_arg(&args, "direction", name)?
                .parse()
                .map_err(PilotError::Prediction)?;
            let start_box = match args.get("start_box") {
                Some(v) => Some(parse_box(v)?),
                None => None,
            };
            Ok(Action::Scroll { start_box, direction })
        }
        "wait" => Ok(Action::Wait),
        "finished" => Ok(Action::Finished {
            content: args.get("content").filter(|c| !c.is_empty()).cloned(),
        }),
        "call_user" => Ok(Action::CallUser),
        "error" => Ok(Action::Error {
            message: args
                .get("message")
                .or_else(|| args.get("content"))
                .cloned()
                .unwrap_or_else(|| "model reported an error".into()),
        }),
        other => Err(PilotError::Prediction(format!("unknown action: {other}"))),
    }
}

/// Scans `key='value'` pairs. A quote ends a value only when followed by a
/// comma or the end of input, so apostrophes inside typed text survive.
fn parse_args(args: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let chars: Vec<char> = args.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        // key
        while i < chars.len() && !chars[i].is_alphanumeric() && chars[i] != '_' {
            i += 1;
        }
        let key_start = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
            i += 1;
        }
        if key_start == i {
            break;
        }
        let key: String = chars[key_start..i].iter().collect();

        while i < chars.len() && (chars[i].is_whitespace() || chars[i] == '=') {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '\'' {
            break;
        }
        i += 1; // opening quote
        let mut value = String::new();
        while i < chars.len() {
            if chars[i] == '\'' {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j >= chars.len() || chars[j] == ',' {
                    i = j + 1;
                    break;
                }
            }
            value.push(chars[i]);
            i += 1;
        }
        out.insert(key, value);
    }
    out
}

fn require_arg(args: &HashMap<String, String>, key: &str, action: &str) -> PilotResult<String> {
    args.get(key)
        .cloned()
        .ok_or_else(|| PilotError::Prediction(format!("{action} missing '{key}' argument")))
}

fn require_box(args: &HashMap<String, String>, key: &str, action: &str) -> PilotResult<Box2> {
    parse_box(&require_arg(args, key, action)?)
}

/// Accepts `[x1, y1, x2, y2]`, `(x, y)` and bare `x1,y1,x2,y2` forms.
fn parse_box(value: &str) -> PilotResult<Box2> {
    let trimmed = value.trim_matches(|c: char| {
        c.is_whitespace() || matches!(c, '[' | ']' | '(' | ')')
    });
    let numbers: Result<Vec<f64>, _> = trimmed
        .split(',')
        .map(|n| n.trim().parse::<f64>())
        .collect();
    match numbers {
        Ok(nums) if nums.len() == 4 => Ok(Box2::new(nums[0], nums[1], nums[2], nums[3])),
        Ok(nums) if nums.len() == 2 => Ok(Box2::point(nums[0], nums[1])),
        _ => Err(PilotError::Prediction(format!("malformed box: {}", snippet(value)))),
    }
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > 120 {
        let head: String = trimmed.chars().take(120).collect();
        format!("{head}…")
    } else {
        trimmed.to_string()
    }
}
