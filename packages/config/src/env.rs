//! Typed environment variable lookups.

use thiserror::Error;

/// Returns the value of `name`, or `None` if it is unset or not unicode.
#[must_use]
pub fn option_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Returns the value of `name`, or `default` if it is unset.
#[must_use]
pub fn default_env(name: &str, default: &str) -> String {
    option_env(name).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Error)]
pub enum EnvParseError {
    #[error("Invalid value for {name}: '{value}' ({source})")]
    ParseInt {
        name: String,
        value: String,
        source: std::num::ParseIntError,
    },
}

fn parse_env<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    name: &str,
) -> Result<Option<T>, EnvParseError> {
    option_env(name)
        .map(|value| {
            value.parse::<T>().map_err(|source| EnvParseError::ParseInt {
                name: name.to_string(),
                value,
                source,
            })
        })
        .transpose()
}

/// # Errors
///
/// * If the variable is set but is not a valid `usize`
pub fn option_env_usize(name: &str) -> Result<Option<usize>, EnvParseError> {
    parse_env(name)
}

/// # Errors
///
/// * If the variable is set but is not a valid `usize`
pub fn default_env_usize(name: &str, default: usize) -> Result<usize, EnvParseError> {
    Ok(option_env_usize(name)?.unwrap_or(default))
}

/// # Errors
///
/// * If the variable is set but is not a valid `u16`
pub fn default_env_u16(name: &str, default: u16) -> Result<u16, EnvParseError> {
    Ok(parse_env(name)?.unwrap_or(default))
}
