// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const BANNER_WIDTH: usize = 50;

/// Writes every log line to stdout and, when one could be opened, to the run's log file.
struct Tee {
    file: Option<fs::File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Some(file) = &mut self.file {
            // A failing log file should not take stdout logging down with it.
            if file.write_all(buf).is_err() {
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// Get the path of the log file for a run that starts now.
pub fn log_file_path(dir: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    Path::new(dir).join(format!("enva_{stamp}.log"))
}

fn open_log_file(dir: &str) -> io::Result<(fs::File, PathBuf)> {
    fs::create_dir_all(dir)?;
    let path = log_file_path(dir);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    Ok((file, path))
}

/// Initialize the global logger.
///
/// The filter is taken from `ENVA_LOG`, falling back to `info`, or `debug` when `verbose` is set.
/// Each line reads `<timestamp> - <subsystem> - <LEVEL> - <message>`, where the subsystem is the
/// `log` target of the record, and is written both to stdout and to a timestamped file under
/// `log_dir`.
pub fn init(log_dir: &str, verbose: bool) {
    let (file, path, open_err) = match open_log_file(log_dir) {
        Ok((file, path)) => (Some(file), Some(path), None),
        Err(e) => (None, None, Some(e)),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("ENVA_LOG", crate::default_log_filter(verbose)),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "{} - {:<25} - {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.target(),
            record.level(),
            record.args()
        )
    })
    .target(env_logger::Target::Pipe(Box::new(Tee { file })))
    .init();

    match (path, open_err) {
        (Some(path), _) => log::debug!(target: "enva", "Logging to {}", path.display()),
        (None, Some(e)) => {
            log::warn!(target: "enva", "Could not open log file in '{log_dir}', logging to stdout only: {e}")
        }
        (None, None) => {}
    }
}

/// Log a title between two rules, to mark the start of a major phase in the run log.
pub fn banner(target: &str, title: &str) {
    let rule = "=".repeat(BANNER_WIDTH);
    log::info!(target: target, "{rule}");
    log::info!(target: target, "{title}");
    log::info!(target: target, "{rule}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_named_after_the_run_start() {
        let path = log_file_path("logs");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("enva_"));
        assert!(name.ends_with(".log"));
        // enva_YYYYMMDD_HHMMSS.log
        assert_eq!(name.len(), "enva_".len() + 15 + ".log".len());
        assert!(path.starts_with("logs"));
    }
}
