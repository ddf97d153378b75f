//! Supported CLI key constants and validation (single source of truth).

pub const SUPPORTED_CLI_KEYS: [&str; 3] = ["claude", "codex", "gemini"];

pub fn is_supported_cli_key(cli_key: &str) -> bool {
    SUPPORTED_CLI_KEYS.contains(&cli_key)
}

pub fn validate_cli_key(cli_key: &str) -> Result<(), String> {
    if is_supported_cli_key(cli_key) {
        Ok(())
    } else {
        Err(format!("SEC_INVALID_INPUT: unknown cli_key={cli_key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_supported_keys() {
        for cli_key in SUPPORTED_CLI_KEYS {
            assert!(is_supported_cli_key(cli_key));
        }
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(!is_supported_cli_key("opencode"));
        assert!(!is_supported_cli_key(""));
        assert!(validate_cli_key("aider").is_err());
    }
}
