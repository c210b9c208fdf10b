//! Invocation values and their flat wire encoding.
//!
//! The wire form is `target|member|arg1|…|argN`. Only text crosses the
//! process boundary; richer payloads are a caller convention layered inside a
//! single string argument.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Field separator of the wire form.
pub const DELIMITER: char = '|';

/// A named call: resolve `target.member` on the other side and invoke it with
/// `arguments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub target: String,
    pub member: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl Invocation {
    pub fn new(target: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            member: member.into(),
            arguments: Vec::new(),
        }
    }

    /// Append one argument in its textual form.
    pub fn arg(mut self, value: impl ToString) -> Self {
        self.arguments.push(value.to_string());
        self
    }

    /// `target.member`, for logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.target, self.member)
    }
}

/// Encode an invocation into its wire form.
///
/// Rejects empty target/member names and any field that contains the
/// delimiter, since such a value could not be decoded back unchanged.
pub fn encode(invocation: &Invocation) -> Result<String, BridgeError> {
    if invocation.target.is_empty() {
        return Err(BridgeError::MalformedInvocation("empty target".into()));
    }
    if invocation.member.is_empty() {
        return Err(BridgeError::MalformedInvocation("empty member".into()));
    }

    let fields = std::iter::once(&invocation.target)
        .chain(std::iter::once(&invocation.member))
        .chain(invocation.arguments.iter());

    let mut wire = String::new();
    for (i, field) in fields.enumerate() {
        if field.contains(DELIMITER) {
            return Err(BridgeError::MalformedInvocation(format!(
                "field {i} contains the '{DELIMITER}' delimiter: {field:?}"
            )));
        }
        if i > 0 {
            wire.push(DELIMITER);
        }
        wire.push_str(field);
    }
    Ok(wire)
}

/// Decode a wire form produced by [`encode`].
pub fn decode(wire: &str) -> Result<Invocation, BridgeError> {
    let mut fields = wire.split(DELIMITER);

    let (Some(target), Some(member)) = (fields.next(), fields.next()) else {
        return Err(BridgeError::MalformedInvocation(format!(
            "expected at least target and member, got {wire:?}"
        )));
    };
    if target.is_empty() || member.is_empty() {
        return Err(BridgeError::MalformedInvocation(format!(
            "empty target or member in {wire:?}"
        )));
    }

    Ok(Invocation {
        target: target.to_string(),
        member: member.to_string(),
        arguments: fields.map(str::to_string).collect(),
    })
}

/// Convert a JSON primitive into its textual argument form.
///
/// Strings pass through, numbers and booleans use their display form. Null,
/// arrays and objects cannot cross the process boundary.
pub fn argument_from_json(value: &serde_json::Value) -> Result<String, BridgeError> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(BridgeError::MalformedInvocation(format!(
            "argument must be a string, number or boolean, got {other}"
        ))),
    }
}
