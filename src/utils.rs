//! Utility functions for directory management
//!
//! Follows the XDG Base Directory specification for the default
//! configuration location.
//!
//! - Config: `~/.config/netpolc/` - User wide compiler configuration

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "netpolc", "netpolc").map(|pd| pd.config_dir().to_path_buf())
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Find the nearest character boundary to avoid splitting multi-byte characters
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string_unchanged() {
        assert_eq!(truncate_string("network:a", 20), "network:a");
    }

    #[test]
    fn test_truncate_long_string() {
        let out = truncate_string("network:very_long_network_name", 12);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 12);
    }

    #[test]
    fn test_truncate_multibyte_boundary() {
        let out = truncate_string("network:müller-straße", 12);
        assert!(out.ends_with("..."));
    }
}
