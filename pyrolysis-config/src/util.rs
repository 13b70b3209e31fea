use std::str::FromStr;

use crate::error::ConfigError;

/// Trimmed value, or `None` when blank.
pub fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse a numeric environment value, naming the variable on failure.
pub fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|err| ConfigError::InvalidEnv {
        name,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_report_the_variable() {
        assert_eq!(parse_number::<u32>("PIPELINE_MAX_RETRIES", " 5 ").ok(), Some(5));
        let err = parse_number::<u32>("PIPELINE_MAX_RETRIES", "many")
            .unwrap_err()
            .to_string();
        assert!(err.contains("PIPELINE_MAX_RETRIES"));
    }

    #[test]
    fn blanks_are_none() {
        assert_eq!(non_empty("   "), None);
        assert_eq!(non_empty(" runs "), Some("runs".to_string()));
    }

    #[test]
    fn bools_accept_env_forms() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
