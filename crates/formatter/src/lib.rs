//! Re-indents JSON text. Object keys keep the order they were written in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::ser::{PrettyFormatter, Serializer};

/// Widest indent honoured; larger requests are clamped.
pub const MAX_INDENT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Invalid JSON input")]
    InvalidJson(#[source] serde_json::Error),
    #[error("failed to write formatted JSON: {0}")]
    Write(#[source] serde_json::Error),
}

/// Indent widths offered as presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "usize")]
pub enum Indent {
    #[default]
    Two,
    Four,
    Eight,
}

impl Indent {
    pub const ALL: [Indent; 3] = [Indent::Two, Indent::Four, Indent::Eight];

    pub fn width(self) -> usize {
        match self {
            Indent::Two => 2,
            Indent::Four => 4,
            Indent::Eight => 8,
        }
    }
}

impl fmt::Display for Indent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} spaces", self.width())
    }
}

impl TryFrom<usize> for Indent {
    type Error = String;

    fn try_from(width: usize) -> Result<Self, Self::Error> {
        Indent::ALL
            .into_iter()
            .find(|preset| preset.width() == width)
            .ok_or_else(|| format!("unsupported indent {width}; expected 2, 4 or 8"))
    }
}

impl FromStr for Indent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let width: usize = s
            .trim()
            .parse()
            .map_err(|_| format!("indent must be a number, got {s:?}"))?;
        Indent::try_from(width)
    }
}

/// Parses `input` as JSON and writes it back with `indent` spaces per level.
///
/// Blank input yields an empty string. An indent of 0 produces compact output.
pub fn format_json(input: &str, indent: usize) -> Result<String, FormatError> {
    if input.trim().is_empty() {
        return Ok(String::new());
    }
    let value: Value = serde_json::from_str(input).map_err(FormatError::InvalidJson)?;
    let indent = indent.min(MAX_INDENT);
    if indent == 0 {
        return serde_json::to_string(&value).map_err(FormatError::Write);
    }

    let pad = vec![b' '; indent];
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut ser = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(&pad));
    value.serialize(&mut ser).map_err(FormatError::Write)?;
    // serde_json only ever emits valid UTF-8.
    Ok(String::from_utf8_lossy(&out).into_owned())
}
