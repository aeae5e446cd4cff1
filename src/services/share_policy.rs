//! Extraction-code policy for new shares.

use rand::{Rng, seq::IndexedRandom};
use std::str::FromStr;
use thiserror::Error;

/// Length the provider accepts for extraction codes.
pub const CODE_LEN: usize = 4;

const CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodePolicyError {
    #[error("extraction code `{0}` must be 4 ascii letters or digits")]
    InvalidCode(String),
    #[error("extraction code list is empty")]
    EmptyList,
    #[error("unknown extraction code policy `{0}`")]
    Unknown(String),
}

/// How each share's extraction code is chosen.
///
/// Parsed from `none`, `random`, `fixed:abcd` or `list:abcd,efgh`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CodePolicy {
    /// Public share, no code.
    #[default]
    None,
    Fixed(String),
    /// Pick one of a configured set per share.
    OneOf(Vec<String>),
    /// Fresh lowercase alphanumeric code per share.
    Generated,
}

impl CodePolicy {
    pub fn next_code(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Fixed(code) => Some(code.clone()),
            Self::OneOf(codes) => codes.choose(&mut rand::rng()).cloned(),
            Self::Generated => Some(generate_code(CODE_LEN)),
        }
    }
}

impl FromStr for CodePolicy {
    type Err = CodePolicyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (kind, value) = raw.split_once(':').unwrap_or((raw, ""));
        match kind.to_ascii_lowercase().as_str() {
            "" | "none" | "empty" => Ok(Self::None),
            "random" | "generate" => Ok(Self::Generated),
            "fixed" => Ok(Self::Fixed(validate_code(value)?)),
            "list" => {
                let codes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|code| !code.is_empty())
                    .map(validate_code)
                    .collect::<Result<Vec<_>, _>>()?;
                if codes.is_empty() {
                    return Err(CodePolicyError::EmptyList);
                }
                Ok(Self::OneOf(codes))
            }
            _ => Err(CodePolicyError::Unknown(raw.to_string())),
        }
    }
}

fn validate_code(code: &str) -> Result<String, CodePolicyError> {
    let code = code.trim();
    if code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(code.to_string())
    } else {
        Err(CodePolicyError::InvalidCode(code.to_string()))
    }
}

fn generate_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
