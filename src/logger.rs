use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::config;

const LOG_FILE: &str = "nightingale.log";

/// Routes `tracing` output to `<config dir>/logs/nightingale.log`.
/// The previous run's log is kept as `nightingale.log.old`.
pub fn init() {
    let log_dir = config::get_config_dir().join("logs");
    let log_path = match rotate(&log_dir) {
        Ok(path) => path,
        Err(_) => return,
    };

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }

    let Ok(file) = options.open(log_path) else {
        return;
    };

    let filter = EnvFilter::try_from_env("NIGHTINGALE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("nightingale=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .try_init();
}

fn rotate(log_dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    if log_path.exists() {
        let old_path = log_dir.join(format!("{LOG_FILE}.old"));
        if old_path.exists() {
            let _ = fs::remove_file(&old_path);
        }
        let _ = fs::rename(&log_path, old_path);
    }
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_one_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let path = rotate(&logs).unwrap();
        fs::write(&path, "first run").unwrap();
        let path = rotate(&logs).unwrap();
        assert!(!path.exists());
        assert_eq!(
            fs::read_to_string(logs.join("nightingale.log.old")).unwrap(),
            "first run"
        );

        fs::write(&path, "second run").unwrap();
        rotate(&logs).unwrap();
        assert_eq!(
            fs::read_to_string(logs.join("nightingale.log.old")).unwrap(),
            "second run"
        );
    }
}
