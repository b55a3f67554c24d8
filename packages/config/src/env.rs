// ABOUTME: Environment variable parsing utilities
// ABOUTME: Parses optional, validated settings from an injectable variable lookup

use std::str::FromStr;

use crate::ConfigError;

/// Parse an optional variable from `lookup`.
///
/// Returns `Ok(None)` when the variable is unset or blank, and an error when it
/// is set to something that does not parse.
pub fn parse_var<T, L>(lookup: &L, var_name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    L: Fn(&str) -> Option<String>,
{
    match lookup(var_name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Unparseable {
                var: var_name.to_string(),
                value: raw,
            }),
        _ => Ok(None),
    }
}

/// Parse a numeric variable, falling back to `default` when unset, and
/// rejecting values outside `min..=max`.
pub fn parse_var_in_range<T, L>(
    lookup: &L,
    var_name: &str,
    default: T,
    min: T,
    max: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    let value = parse_var(lookup, var_name)?.unwrap_or(default);
    if value < min || value > max {
        tracing::warn!(
            "Environment variable {} has out-of-range value {} (allowed {}..={})",
            var_name,
            value,
            min,
            max
        );
        return Err(ConfigError::OutOfRange {
            var: var_name.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(value)
}
