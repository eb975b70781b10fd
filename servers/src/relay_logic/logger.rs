use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub fn setup_logging(log_dir: Option<&Path>, log_level: &str) -> Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout());

    if let Some(log_dir) = log_dir {
        dispatch = dispatch.chain(fern::log_file(prepare_log_file(log_dir)?)?);
    }

    dispatch.apply()?;
    Ok(())
}

fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Creates `log_dir` if needed, prunes old logs and returns the path of a
/// fresh timestamped log file.
fn prepare_log_file(log_dir: &Path) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep only the most recent previous run
    cleanup_old_logs(log_dir)?;

    let log_file_name = format!(
        "relay_controller_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    Ok(log_dir.join(log_file_name))
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cleanup_keeps_only_the_newest_log() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("relay_controller_old.log");
        let newer = dir.path().join("relay_controller_new.log");
        let unrelated = dir.path().join("notes.txt");

        fs::write(&older, "old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(&newer, "new").unwrap();
        fs::write(&unrelated, "keep me").unwrap();

        cleanup_old_logs(dir.path()).unwrap();

        assert!(!older.exists());
        assert!(newer.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn prepare_log_file_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");

        let path = prepare_log_file(&log_dir).unwrap();

        assert!(log_dir.is_dir());
        assert_eq!(path.parent(), Some(log_dir.as_path()));
        assert!(path.extension().is_some_and(|ext| ext == "log"));
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Info);
    }
}
