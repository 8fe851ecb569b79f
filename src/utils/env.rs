//! Environment variable utilities
//!
//! Typed readers for `CDMF_*` overrides.

/// Get environment variable as Option
///
/// # Example
/// ```rust
/// use cdmf::utils::env_opt;
///
/// let dir = env_opt("CDMF_MODULES_DIR").unwrap_or_else(|| "modules".to_string());
/// ```
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get environment variable as boolean
///
/// Returns `Some(true)` for "true", "1", "yes", "on" and `Some(false)` for
/// "false", "0", "no", "off" (case-insensitive). Anything else, or an unset
/// variable, is `None`.
pub fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get environment variable as integer
///
/// Returns `Some(value)` if set and parseable, `None` otherwise.
pub fn env_int<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_variables() {
        assert_eq!(env_opt("CDMF_TEST_SURELY_UNSET_VAR"), None);
        assert_eq!(env_bool("CDMF_TEST_SURELY_UNSET_VAR"), None);
        assert_eq!(env_int::<u32>("CDMF_TEST_SURELY_UNSET_VAR"), None);
    }
}
