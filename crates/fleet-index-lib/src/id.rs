//! Identifier codec - `CODESPACE:TYPE:VALUE` entity identifiers
//!
//! Identifiers are the keys of every entity cache and the `id` field of every spatial index
//! member. They are validated component by component:
//!
//! - codespace: exactly three characters `A-Z`
//! - type: one or more characters `A-Z` / `a-z`
//! - value: one or more characters `A-Z`, `a-z`, `0-9`, `øØæÆåÅ`, `_`, `\` or `-`
//!
//! The value charset excludes both the identifier separator and the spatial index member
//! separator, which is what keeps member strings unambiguous.
//!
//! [`IdPrefixMatcher`] tests the `CODESPACE:TYPE:` prefix of candidate strings by comparing
//! bytes at fixed offsets. It never parses the remainder, so it accepts malformed trailing
//! content as long as the prefix holds.

use crate::{FleetError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between identifier components
pub const SEPARATOR: char = ':';

const SEPARATOR_BYTE: u8 = b':';
const CODESPACE_LENGTH: usize = 3;
const MINIMUM_LENGTH: usize = 6;

/// Accented letters accepted in the value component
const EXTRA_VALUE_CHARS: [char; 6] = ['ø', 'Ø', 'æ', 'Æ', 'å', 'Å'];

/// A validated `CODESPACE:TYPE:VALUE` identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Identifier {
    codespace: String,
    entity_type: String,
    value: String,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Identifier {
    /// Parse and validate an identifier string.
    ///
    /// The type/value boundary is the last separator, found by scanning from the right.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() < MINIMUM_LENGTH {
            return Err(FleetError::InvalidIdentifier(format!(
                "Expected at least {} characters, found '{}'",
                MINIMUM_LENGTH, s
            )));
        }
        if bytes[CODESPACE_LENGTH] != SEPARATOR_BYTE {
            return Err(FleetError::InvalidIdentifier(format!(
                "Expected separator '{}' at position {}, found '{}'",
                SEPARATOR, CODESPACE_LENGTH, s
            )));
        }

        // ':' is ASCII, so byte offsets found here are always char boundaries
        let type_start = CODESPACE_LENGTH + 1;
        let last = bytes[type_start..]
            .iter()
            .rposition(|b| *b == SEPARATOR_BYTE)
            .map(|offset| type_start + offset)
            .ok_or_else(|| {
                FleetError::InvalidIdentifier(format!(
                    "Expected separator between type and value, found '{}'",
                    s
                ))
            })?;

        let codespace = &s[..CODESPACE_LENGTH];
        let entity_type = &s[type_start..last];
        let value = &s[last + 1..];
        check_components(codespace, entity_type, value)?;

        Ok(Self {
            codespace: codespace.to_string(),
            entity_type: entity_type.to_string(),
            value: value.to_string(),
        })
    }

    /// Build an identifier string from its components, validating each of them.
    pub fn build(codespace: &str, entity_type: &str, value: &str) -> Result<String> {
        check_components(codespace, entity_type, value)?;
        Ok(format!(
            "{codespace}{SEPARATOR}{entity_type}{SEPARATOR}{value}"
        ))
    }

    /// Check a candidate string without keeping the parsed components.
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    #[inline]
    pub fn codespace(&self) -> &str {
        &self.codespace
    }

    #[inline]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.codespace, self.entity_type, self.value
        )
    }
}

impl FromStr for Identifier {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn check_components(codespace: &str, entity_type: &str, value: &str) -> Result<()> {
    if !is_valid_codespace(codespace) {
        return Err(FleetError::InvalidIdentifier(format!(
            "Expected codespace (size 3 with characters A-Z), found {}",
            codespace
        )));
    }
    if !is_valid_type(entity_type) {
        return Err(FleetError::InvalidIdentifier(format!(
            "Expected type (nonempty with characters A-Z or a-z), found {}",
            entity_type
        )));
    }
    if !is_valid_value(value) {
        return Err(FleetError::InvalidIdentifier(format!(
            "Expected value (nonempty with characters A-Z, a-z, 0-9, øØæÆåÅ, _, \\ or -), found {}",
            value
        )));
    }
    Ok(())
}

#[inline]
fn is_valid_codespace(codespace: &str) -> bool {
    codespace.len() == CODESPACE_LENGTH && codespace.bytes().all(|b| b.is_ascii_uppercase())
}

#[inline]
fn is_valid_type(entity_type: &str) -> bool {
    !entity_type.is_empty() && entity_type.bytes().all(|b| b.is_ascii_alphabetic())
}

#[inline]
fn is_valid_value(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | '\\' | '-')
                || EXTRA_VALUE_CHARS.contains(&c)
        })
}

/// Prefix matcher over identifier strings.
///
/// Built once for a codespace and/or a type, then applied to many candidates without
/// allocating. Matching is intentionally shallow: only the separators and the prefix bytes
/// at fixed offsets are compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdPrefixMatcher {
    /// `CCC:` followed by at least one more byte
    Codespace(String),
    /// `???:TYPE:` at offset 0
    Type(String),
    /// `CCC:TYPE:` at offset 0
    CodespaceAndType { prefix: String },
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl IdPrefixMatcher {
    /// Create a matcher for the given codespace and/or type.
    ///
    /// Supplied components are validated with the same rules as [`Identifier::parse`].
    pub fn new(codespace: Option<&str>, entity_type: Option<&str>) -> Result<Self> {
        if let Some(codespace) = codespace.filter(|c| !is_valid_codespace(c)) {
            return Err(FleetError::InvalidIdentifier(format!(
                "Expected codespace (size 3 with characters A-Z), found {}",
                codespace
            )));
        }
        if let Some(entity_type) = entity_type.filter(|t| !is_valid_type(t)) {
            return Err(FleetError::InvalidIdentifier(format!(
                "Expected type (nonempty with characters A-Z or a-z), found {}",
                entity_type
            )));
        }

        match (codespace, entity_type) {
            (Some(codespace), Some(entity_type)) => Ok(Self::CodespaceAndType {
                prefix: format!("{codespace}{SEPARATOR}{entity_type}"),
            }),
            (Some(codespace), None) => Ok(Self::codespace(codespace)),
            (None, Some(entity_type)) => Ok(Self::entity_type(entity_type)),
            (None, None) => Err(FleetError::InvalidIdentifier(
                "Expected codespace and/or type".to_string(),
            )),
        }
    }

    /// Matcher for a codespace, without validating it
    pub fn codespace(codespace: &str) -> Self {
        Self::Codespace(codespace.to_string())
    }

    /// Matcher for a type, without validating it
    pub fn entity_type(entity_type: &str) -> Self {
        Self::Type(entity_type.to_string())
    }

    /// Test a candidate identifier string.
    pub fn matches(&self, candidate: &str) -> bool {
        let bytes = candidate.as_bytes();
        match self {
            Self::Codespace(codespace) => {
                bytes.len() > CODESPACE_LENGTH + 1
                    && bytes[CODESPACE_LENGTH] == SEPARATOR_BYTE
                    && &bytes[..CODESPACE_LENGTH] == codespace.as_bytes()
            }
            Self::Type(entity_type) => {
                let type_start = CODESPACE_LENGTH + 1;
                let type_end = type_start + entity_type.len();
                bytes.len() > type_end
                    && bytes[CODESPACE_LENGTH] == SEPARATOR_BYTE
                    && bytes[type_end] == SEPARATOR_BYTE
                    && &bytes[type_start..type_end] == entity_type.as_bytes()
            }
            Self::CodespaceAndType { prefix } => {
                // prefix is "CCC:TYPE", the separator after TYPE sits right behind it
                let end = prefix.len();
                bytes.len() > end
                    && bytes[end] == SEPARATOR_BYTE
                    && &bytes[..end] == prefix.as_bytes()
            }
        }
    }
}
