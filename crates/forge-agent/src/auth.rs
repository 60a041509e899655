//! Authentication for the LLM message API
//!
//! The key is read from the environment variable named in `[llm] api_key_env`
//! (`ANTHROPIC_API_KEY` by default). Missing credentials are a configuration
//! error so a session fails before it starts.

use forge_core::{ForgeError, Result};
use std::env;

/// Read the API key from the named environment variable
pub fn api_key_from_env(var: &str) -> Result<String> {
    match env::var(var) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::debug!("Using API key from {}", var);
            Ok(key)
        }
        _ => Err(ForgeError::Auth(format!(
            "No API key found. Set {}=sk-ant-... to enable agent sessions",
            var
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to prevent concurrent env var modifications
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_var<F, R>(key: &str, value: Option<&str>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap();
        let original = env::var(key).ok();

        match value {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }

        let result = f();

        match original {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }

        result
    }

    #[test]
    fn test_key_present() {
        with_env_var("FORGE_TEST_KEY_PRESENT", Some("sk-ant-test"), || {
            assert_eq!(api_key_from_env("FORGE_TEST_KEY_PRESENT").unwrap(), "sk-ant-test");
        });
    }

    #[test]
    fn test_key_missing() {
        with_env_var("FORGE_TEST_KEY_MISSING", None, || {
            let result = api_key_from_env("FORGE_TEST_KEY_MISSING");
            assert!(matches!(result, Err(ForgeError::Auth(_))));
        });
    }

    #[test]
    fn test_key_blank() {
        with_env_var("FORGE_TEST_KEY_BLANK", Some("  "), || {
            assert!(api_key_from_env("FORGE_TEST_KEY_BLANK").is_err());
        });
    }
}
