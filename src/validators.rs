//! Input validation for policy object names
//!
//! This module centralizes validation of names and typed references
//! (`type:name`) found in the policy model, so import errors name the
//! offending text instead of failing deep inside a stage.

use std::fmt;

/// Object types that may appear in group definitions and rule src/dst lists.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum RefType {
    #[strum(serialize = "network")]
    Network,
    #[strum(serialize = "host")]
    Host,
    #[strum(serialize = "interface")]
    Interface,
    #[strum(serialize = "any")]
    Any,
    #[strum(serialize = "group")]
    Group,
    #[strum(serialize = "area")]
    Area,
}

/// A parsed `type:name` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedName {
    pub kind: RefType,
    pub name: String,
}

impl fmt::Display for TypedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Returns `true` for characters allowed in object names.
///
/// Letters and digits of any script, plus `- _ . : @ / [ ]`.
#[inline]
pub fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@' | '/' | '[' | ']')
}

/// Validates a bare object name.
///
/// # Errors
///
/// Returns `Err` if the name is empty or contains a character outside
/// [`is_name_char`].
pub fn validate_object_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name must not be empty".to_string());
    }
    if let Some(c) = name.chars().find(|c| !is_name_char(*c)) {
        return Err(format!("Invalid character '{c}' in {name}"));
    }
    Ok(())
}

/// Parses and validates a typed reference.
///
/// # Examples
///
/// ```
/// use netpolc::validators::{parse_typed_name, RefType};
///
/// let typed = parse_typed_name("network:dmz").unwrap();
/// assert_eq!(typed.kind, RefType::Network);
/// assert_eq!(typed.name, "dmz");
///
/// assert!(parse_typed_name("dmz").is_err());
/// assert!(parse_typed_name("router:r1").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if the type is missing or unknown, or the name is invalid.
pub fn parse_typed_name(input: &str) -> Result<TypedName, String> {
    let input = input.trim();
    let Some((kind, name)) = input.split_once(':') else {
        return Err(format!("Missing type in {input}"));
    };
    let kind: RefType = kind
        .parse()
        .map_err(|_| format!("Can't use type in {input}"))?;
    if name.is_empty() {
        return Err(format!("Missing name in {input}"));
    }
    if let Some(c) = name.chars().find(|c| !is_name_char(*c)) {
        return Err(format!("Invalid character '{c}' in {input}"));
    }
    Ok(TypedName {
        kind,
        name: name.to_string(),
    })
}

/// Validates a router name that is also used as an output file name.
///
/// Constraints:
/// - Valid object name
/// - No path separators, rejects "." and "..": path traversal protection
/// - Max 64 chars
///
/// # Errors
///
/// Returns `Err` if the name violates any constraint.
pub fn validate_device_name(name: &str) -> Result<(), String> {
    validate_object_name(name)?;
    if name.len() > 64 {
        return Err("Device name too long (max 64 chars)".to_string());
    }
    if name.contains('/') || name.starts_with('.') {
        return Err(format!("Device name {name} can't be used as file name"));
    }
    Ok(())
}

/// Validates a NAT tag (word characters and dashes only).
///
/// # Errors
///
/// Returns `Err` if the tag is empty or contains other characters.
pub fn validate_nat_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("NAT tag must not be empty".to_string());
    }
    if !tag.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(format!("Invalid NAT tag {tag}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_types() {
        for (text, kind) in [
            ("network:n1", RefType::Network),
            ("host:h1", RefType::Host),
            ("interface:r1.e0", RefType::Interface),
            ("any:a1", RefType::Any),
            ("group:g1", RefType::Group),
            ("area:campus", RefType::Area),
        ] {
            assert_eq!(parse_typed_name(text).unwrap().kind, kind);
        }
    }

    #[test]
    fn test_parse_missing_type() {
        assert_eq!(parse_typed_name("n1").unwrap_err(), "Missing type in n1");
    }

    #[test]
    fn test_parse_unknown_type() {
        assert_eq!(
            parse_typed_name("router:r1").unwrap_err(),
            "Can't use type in router:r1"
        );
    }

    #[test]
    fn test_parse_invalid_char() {
        assert_eq!(
            parse_typed_name("network:n1;x").unwrap_err(),
            "Invalid character ';' in network:n1;x"
        );
    }

    #[test]
    fn test_parse_missing_name() {
        assert_eq!(
            parse_typed_name("network:").unwrap_err(),
            "Missing name in network:"
        );
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let typed = parse_typed_name("  group:g1 ").unwrap();
        assert_eq!(typed.to_string(), "group:g1");
    }

    #[test]
    fn test_unicode_names_allowed() {
        assert!(validate_object_name("müller").is_ok());
        assert!(validate_object_name("n[auto]").is_ok());
    }

    #[test]
    fn test_device_name_rejects_traversal() {
        assert!(validate_device_name("r1").is_ok());
        assert!(validate_device_name("..").is_err());
        assert!(validate_device_name(".hidden").is_err());
        assert!(validate_device_name("a/b").is_err());
        assert!(validate_device_name(&"r".repeat(65)).is_err());
    }

    #[test]
    fn test_nat_tag() {
        assert!(validate_nat_tag("inside-1").is_ok());
        assert!(validate_nat_tag("").is_err());
        assert!(validate_nat_tag("a:b").is_err());
    }
}
