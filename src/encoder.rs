//! Request encoding: turns a client payload into the line fed to the child.
//!
//! Script payloads come in two shapes:
//! - `{"code": "...", "args": [...]}` - define `run` in `code`, call it with `args`
//! - anything else - a throwaway script body executed as-is
//!
//! Both are wrapped in an immediately-invoked arrow function so the REPL sees
//! one self-contained statement per line.
//!
//! CHANGELOG:
//! - 03/02/2026 - Initial implementation

use serde_json::Value;

use crate::config::Dialect;

/// Decoded form of a script payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Script body executed for its side effects.
    RawCode(String),
    /// `code` defines `run`, which is invoked with `args` spread positionally.
    Invocation { code: String, args: Vec<Value> },
}

impl Request {
    /// Decode a payload, falling back to `RawCode` on anything that is not a
    /// non-empty JSON object.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);

        let map = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) if !map.is_empty() => map,
            _ => return Request::RawCode(text.into_owned()),
        };

        // A missing `code` still yields an invocation; the REPL reports the
        // undefined `run` itself.
        let code = match map.get("code") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        let args = match map.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(single) => vec![single.clone()],
        };

        Request::Invocation { code, args }
    }

    /// Render the REPL line for this request.
    pub fn to_line(&self) -> String {
        match self {
            Request::RawCode(body) => format!("(() => {{ {}; }})()", body),
            Request::Invocation { code, args } => {
                format!("(() => {{ {}; return run({}) }})()", code, render_args(args))
            }
        }
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Produce the exact line sent to the child for `payload`.
pub fn encode(dialect: Dialect, payload: &[u8]) -> String {
    match dialect {
        Dialect::Script => Request::parse(payload).to_line(),
        Dialect::Pattern => String::from_utf8_lossy(payload).into_owned(),
    }
}
