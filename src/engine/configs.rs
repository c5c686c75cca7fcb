//! Engine config assembly.
//!
//! A session's config set is the machine-level defaults (unless the server
//! runs with `--ignore-machine-defaults`) followed by the `*.yaml` files in
//! the session working directory, each directory sorted alphabetically.
//! Later documents win during the engine's shallow merge. Unreadable or
//! unparseable files are logged and skipped; a session must not die because
//! a stray file appeared next to its `load.yaml`.

use std::path::Path;
use tracing::{debug, warn};

/// Collect config documents from one directory, sorted by file name.
fn collect_dir(dir: &Path) -> Vec<serde_yaml::Value> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "failed to read config directory");
            return Vec::new();
        }
    };

    let mut names: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some("yaml")
        })
        .collect();
    names.sort();

    let mut configs = Vec::new();
    for path in names {
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(config = %path.display(), %err, "failed to read config file");
                continue;
            }
        };
        match serde_yaml::from_str(&contents) {
            Ok(value) => {
                debug!(config = %path.display(), "adding config file");
                configs.push(value);
            }
            Err(err) => {
                warn!(config = %path.display(), %err, "failed to parse config file");
            }
        }
    }
    configs
}

/// Assemble the full config set for a session.
pub fn collect(machine_defaults: Option<&Path>, work_dir: &Path) -> Vec<serde_yaml::Value> {
    let mut configs = Vec::new();
    if let Some(dir) = machine_defaults {
        configs.extend(collect_dir(dir));
    }
    configs.extend(collect_dir(work_dir));
    configs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn collects_sorted_yaml_only() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "order: second").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "order: first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a config").unwrap();

        let configs = collect(None, dir.path());
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0]["order"], "first");
        assert_eq!(configs[1]["order"], "second");
    }

    #[test]
    fn machine_defaults_come_first() {
        let machine = tempdir().unwrap();
        let work = tempdir().unwrap();
        std::fs::write(machine.path().join("base.yaml"), "source: machine").unwrap();
        std::fs::write(work.path().join("load.yaml"), "source: session").unwrap();

        let configs = collect(Some(machine.path()), work.path());
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0]["source"], "machine");
        assert_eq!(configs[1]["source"], "session");
    }

    #[test]
    fn broken_files_are_skipped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "a: [unclosed").unwrap();
        std::fs::write(dir.path().join("good.yaml"), "ok: true").unwrap();

        let configs = collect(None, dir.path());
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0]["ok"], true);
    }

    #[test]
    fn missing_directory_yields_empty_set() {
        let dir = tempdir().unwrap();
        let configs = collect(Some(&dir.path().join("nope")), &dir.path().join("also-nope"));
        assert!(configs.is_empty());
    }
}
