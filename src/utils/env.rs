/// Get environment variable with TOLLGATE_ prefix, falling back to unprefixed version
///
/// Checks `TOLLGATE_{key}` first, then `{key}`, so deployments can keep
/// conventional names like `PORT` or `ENVIRONMENT`.
///
/// # Examples
///
/// ```rust,ignore
/// // Checks TOLLGATE_WEBHOOK_SECRET first, then WEBHOOK_SECRET
/// let secret = get_env_with_prefix("WEBHOOK_SECRET");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TOLLGATE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse a boolean-ish environment value (`true/false`, `1/0`, `yes/no`).
pub fn get_env_flag(key: &str) -> Option<bool> {
    get_env_with_prefix(key).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Parse a numeric environment value, ignoring values that do not parse.
pub fn get_env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("TOLLGATE_ENV_TEST_VAR", "prefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("ENV_TEST_VAR"),
            Some("prefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("TOLLGATE_ENV_TEST_VAR");
        }

        unsafe {
            std::env::set_var("ENV_FALLBACK_VAR", "unprefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("ENV_FALLBACK_VAR"),
            Some("unprefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("ENV_FALLBACK_VAR");
        }

        assert_eq!(get_env_with_prefix("ENV_NON_EXISTENT_VAR"), None);
    }

    #[test]
    fn test_get_env_flag_and_parsed() {
        unsafe {
            std::env::set_var("TOLLGATE_ENV_FLAG_TEST", "yes");
            std::env::set_var("TOLLGATE_ENV_NUM_TEST", " 42 ");
            std::env::set_var("TOLLGATE_ENV_BAD_NUM_TEST", "forty-two");
        }
        assert_eq!(get_env_flag("ENV_FLAG_TEST"), Some(true));
        assert_eq!(get_env_parsed::<u64>("ENV_NUM_TEST"), Some(42));
        assert_eq!(get_env_parsed::<u64>("ENV_BAD_NUM_TEST"), None);
        unsafe {
            std::env::remove_var("TOLLGATE_ENV_FLAG_TEST");
            std::env::remove_var("TOLLGATE_ENV_NUM_TEST");
            std::env::remove_var("TOLLGATE_ENV_BAD_NUM_TEST");
        }
    }
}
