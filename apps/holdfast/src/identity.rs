use std::fs;
use std::path::Path;

use rand::seq::SliceRandom;
use thiserror::Error;

/// Desktop Chrome fingerprints negotiated with the remote endpoints. One is
/// drawn per process when the identity source does not supply its own.
const USER_AGENTS: [&str; 10] = [
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.3",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.6613.18 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36",
];

const WINDOWS_MARKERS: [&str; 3] = ["Windows", "Win64", "Win32"];

/// Identity descriptor shared read-only across all sessions of a process.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub user_agent: String,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("identity file {path} contains no identity")]
    Empty { path: String },
    #[error("identity id cannot be empty")]
    EmptyId,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        user_agent: Option<String>,
    ) -> Result<Self, IdentityError> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(IdentityError::EmptyId);
        }
        Ok(Self {
            user_id,
            user_agent: user_agent.unwrap_or_else(|| random_user_agent().to_string()),
        })
    }

    /// Load the identity from a line-delimited file: the first non-empty
    /// line is the user id. An absent or empty file is a fatal startup
    /// error, before any session starts.
    pub fn load(path: &Path, user_agent: Option<String>) -> Result<Self, IdentityError> {
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|source| IdentityError::Io {
            path: display.clone(),
            source,
        })?;
        let user_id = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(IdentityError::Empty { path: display })?;
        Self::new(user_id, user_agent)
    }

    fn is_windows(&self) -> bool {
        WINDOWS_MARKERS
            .iter()
            .any(|marker| self.user_agent.contains(marker))
    }

    /// Value of the `OS` upgrade header, derived from the fingerprint.
    pub fn os_header(&self) -> &'static str {
        if self.is_windows() { "Windows" } else { "Mac" }
    }
}

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_header_follows_fingerprint_markers() {
        let windows = Identity::new(
            "u1",
            Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string()),
        )
        .unwrap();
        assert_eq!(windows.os_header(), "Windows");

        let mac = Identity::new(
            "u1",
            Some("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)".to_string()),
        )
        .unwrap();
        assert_eq!(mac.os_header(), "Mac");
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(matches!(
            Identity::new("  ", None),
            Err(IdentityError::EmptyId)
        ));
    }

    #[test]
    fn load_picks_first_non_empty_line() {
        let dir = std::env::temp_dir();
        let path = dir.join("holdfast-identity-test.txt");
        fs::write(&path, "\n\n  abc123  \nignored\n").unwrap();
        let identity = Identity::load(&path, None).unwrap();
        assert_eq!(identity.user_id, "abc123");
        assert!(!identity.user_agent.is_empty());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn load_rejects_blank_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("holdfast-identity-blank.txt");
        fs::write(&path, "\n   \n").unwrap();
        assert!(matches!(
            Identity::load(&path, None),
            Err(IdentityError::Empty { .. })
        ));
        fs::remove_file(&path).ok();
    }
}
