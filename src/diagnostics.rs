//! Log file location and rotation helpers used by [`crate::init_logging`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the daily rolling log.
pub const LOG_FILE_PREFIX: &str = "ledger";

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Environment variable that points logging at an explicit directory.
pub const LOG_DIR_ENV: &str = "SHOP_LEDGER_LOG_DIR";

fn data_home() -> PathBuf {
    let var = |name: &str| std::env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from);
    if cfg!(windows) {
        var("LOCALAPPDATA")
            .or_else(|| var("USERPROFILE").map(|p| p.join("AppData").join("Local")))
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        var("XDG_DATA_HOME")
            .or_else(|| var("HOME").map(|p| p.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Where [`crate::init_logging`] writes when no directory is passed:
/// `$SHOP_LEDGER_LOG_DIR` if set, else `shop-ledger/logs` under the user's
/// data directory.
pub fn get_log_dir() -> PathBuf {
    match std::env::var_os(LOG_DIR_ENV).filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => data_home().join("shop-ledger").join("logs"),
    }
}

fn is_log_file(name: &str) -> bool {
    name == LOG_FILE_PREFIX || name.starts_with(&format!("{LOG_FILE_PREFIX}."))
}

/// Delete all but the `keep` newest log files in `log_dir`.
///
/// Returns how many files were removed. Files that do not look like ledger
/// logs are left alone.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if is_log_file(name) {
                    let modified = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(UNIX_EPOCH);
                    log_files.push((path, modified));
                }
            }
        }
    }

    // Newest first; name breaks ties so dated files sort stably
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("shop-ledger-logs-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    #[serial]
    fn test_log_dir_env_override() {
        std::env::remove_var(LOG_DIR_ENV);
        let default = get_log_dir();
        assert!(default.ends_with(Path::new("shop-ledger").join("logs")));

        std::env::set_var(LOG_DIR_ENV, "/var/log/till-3");
        assert_eq!(get_log_dir(), PathBuf::from("/var/log/till-3"));

        std::env::set_var(LOG_DIR_ENV, "");
        assert_eq!(get_log_dir(), default);
        std::env::remove_var(LOG_DIR_ENV);
    }

    #[test]
    fn test_prune_keeps_newest_and_ignores_other_files() {
        let dir = scratch_dir();
        for day in 1..=5 {
            fs::write(dir.join(format!("ledger.2024-03-0{day}")), "x").unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep me").unwrap();

        let removed = prune_old_logs(&dir, 2);
        assert_eq!(removed, 3);

        let mut left: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), 3);
        assert!(left.contains(&"notes.txt".to_string()));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = std::env::temp_dir().join(format!("shop-ledger-missing-{}", Uuid::new_v4()));
        assert_eq!(prune_old_logs(&dir, MAX_LOG_FILES), 0);
    }
}
