use std::fmt;

use serde::{Serialize, Deserialize};

/// Whether enabling an option makes the collector noticeably slower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeedClass {
    #[default]
    Fast,
    Slow,
}

/// A typed option value. The type of an option is the type of its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl OptionValue {
    /// Parse `raw` as a value of the same type as `self`.
    pub fn parse_like(&self, raw: &str) -> Result<OptionValue, String> {
        let trimmed = raw.trim();
        match self {
            OptionValue::Bool(_) => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" | "yes" => Ok(OptionValue::Bool(true)),
                "0" | "off" | "false" | "no" => Ok(OptionValue::Bool(false)),
                _ => Err(format!("expected a boolean, got '{}'", raw)),
            },
            OptionValue::Int(_) => trimmed
                .parse::<i64>()
                .map(OptionValue::Int)
                .map_err(|_| format!("expected an integer, got '{}'", raw)),
            OptionValue::Str(_) => Ok(OptionValue::Str(raw.to_string())),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            OptionValue::Bool(b) => *b,
            OptionValue::Int(i) => *i != 0,
            OptionValue::Str(s) => !s.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            OptionValue::Bool(b) => Some(i64::from(*b)),
            OptionValue::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "int",
            OptionValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", if *b { "on" } else { "off" }),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

/// One entry of a collector's option schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionSpec {
    pub key: String,
    pub description: String,
    pub speed: SpeedClass,
    pub default: OptionValue,
}

impl OptionSpec {
    pub fn new(key: &str, description: &str, default: impl Into<OptionValue>) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            speed: SpeedClass::Fast,
            default: default.into(),
        }
    }

    pub fn slow(mut self) -> Self {
        self.speed = SpeedClass::Slow;
        self
    }
}
