//! Session id generation.
//!
//! Ids follow `{offered id or UTC timestamp}_{random hex}` and double as
//! the working directory name, so generation also claims the directory;
//! creation failing with "already exists" is the collision signal.

use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const MAX_ATTEMPTS: usize = 10;

#[derive(Debug, Error)]
pub enum SessionIdError {
    /// Every attempt collided with an existing directory.
    #[error("failed to generate a fresh session id after {MAX_ATTEMPTS} attempts")]
    Exhausted,

    #[error("failed to create session working directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a fresh session id and create its working directory.
pub fn claim(tests_dir: &Path, offered: Option<&str>) -> Result<(String, PathBuf), SessionIdError> {
    for _ in 0..MAX_ATTEMPTS {
        let prefix = match offered {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Utc::now().format("%Y%m%d%H%M%S").to_string(),
        };
        let session_id = format!("{}_{}", prefix, Uuid::new_v4().simple());
        let work_dir = tests_dir.join(&session_id);
        match std::fs::create_dir(&work_dir) {
            Ok(()) => return Ok((session_id, work_dir)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(SessionIdError::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn claims_directory_with_offered_prefix() {
        let dir = tempdir().unwrap();
        let (id, work_dir) = claim(dir.path(), Some("LOAD-42")).unwrap();
        assert!(id.starts_with("LOAD-42_"));
        assert!(work_dir.is_dir());
        assert_eq!(work_dir, dir.path().join(&id));
    }

    #[test]
    fn empty_offer_falls_back_to_timestamp() {
        let dir = tempdir().unwrap();
        let (id, _) = claim(dir.path(), Some("")).unwrap();
        let (prefix, _) = id.split_once('_').unwrap();
        assert_eq!(prefix.len(), 14);
        assert!(prefix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn consecutive_claims_do_not_collide() {
        let dir = tempdir().unwrap();
        let (a, _) = claim(dir.path(), Some("same")).unwrap();
        let (b, _) = claim(dir.path(), Some("same")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_tests_dir_is_an_io_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(claim(&missing, None), Err(SessionIdError::Io(_))));
    }
}
