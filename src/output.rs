//! Log files and console reporting.
//!
//! Every run gets its own log file named `<repo>-<command>-<unixMillis>.log`
//! with `[STDOUT]`/`[STDERR]` tagged, ANSI-stripped lines. This module also
//! provides the console reporter and the newest-log lookup backing the
//! `logs` command.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use strip_ansi_escapes::strip;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    /// The tag written in front of each log-file line.
    pub fn tag(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "[STDOUT]",
            StreamKind::Stderr => "[STDERR]",
        }
    }
}

/// Sanitizes text for log files, stripping ANSI escape codes.
///
/// Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Builds the per-run log file path: `<log_dir>/<repo>-<command>-<millis>.log`.
pub fn log_file_path(log_dir: &Path, repo: &str, command: &str) -> PathBuf {
    log_dir.join(format!("{}-{}-{}.log", repo, command, unix_millis()))
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Finds the newest log file for a repository by its embedded timestamp.
///
/// Matches `<repo>-…-<millis>.log`; the largest timestamp wins. Returns
/// `None` when the directory has no matching file.
pub fn newest_log(log_dir: &Path, repo: &str) -> Option<PathBuf> {
    let prefix = format!("{}-", repo);
    let mut best: Option<(u128, PathBuf)> = None;
    for entry in std::fs::read_dir(log_dir).ok()? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }
        let Some(stem) = name.strip_suffix(".log") else {
            continue;
        };
        let Some(millis) = stem
            .rsplit('-')
            .next()
            .and_then(|raw| raw.parse::<u128>().ok())
        else {
            continue;
        };
        if best.as_ref().map(|(ts, _)| millis > *ts).unwrap_or(true) {
            best = Some((millis, entry.path()));
        }
    }
    best.map(|(_, path)| path)
}

/// Prints the tail of a log file, optionally following appended output until
/// interrupted.
pub async fn tail_log(path: &Path, follow: bool) -> Result<()> {
    const TAIL_LINES: usize = 50;

    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read log file {}", path.display()))?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    for line in &lines[start..] {
        println!("{}", line);
    }
    if !follow {
        return Ok(());
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut offset = contents.len() as u64;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; 8192];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            // The writer may have rotated nothing; just re-check length.
            let len = tokio::fs::metadata(path).await?.len();
            if len < offset {
                offset = 0;
                file.seek(SeekFrom::Start(0)).await?;
            }
            continue;
        }
        offset += read as u64;
        print!("{}", String::from_utf8_lossy(&buffer[..read]));
    }
}

/// Console reporter with the configurable tool-message prefix.
#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    use_symbols: bool,
}

impl Reporter {
    pub fn new(use_symbols: bool) -> Self {
        Self { use_symbols }
    }

    /// Prints an informational tool message.
    pub fn tool(&self, text: impl AsRef<str>) {
        println!("{}", self.format_tool(text.as_ref()));
    }

    /// Prints a failure tool message to stderr.
    pub fn tool_err(&self, text: impl AsRef<str>) {
        eprintln!("{}", self.format_tool(text.as_ref()));
    }

    /// Echoes a process stdout line with its repository prefix.
    pub fn repo_line(&self, repo: &str, line: &str) {
        println!("[{}] {}", repo, line);
    }

    /// Echoes a process stderr line with its repository prefix.
    pub fn repo_err(&self, repo: &str, line: &str) {
        eprintln!("[{}] {}", repo, line);
    }

    fn format_tool(&self, text: &str) -> String {
        if self.use_symbols {
            format!("◆ devrack: {}", text)
        } else {
            format!("[devrack] {}", text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn stream_tags_match_log_format() {
        assert_eq!(StreamKind::Stdout.tag(), "[STDOUT]");
        assert_eq!(StreamKind::Stderr.tag(), "[STDERR]");
    }

    #[test]
    fn sanitize_strips_ansi_sequences() {
        assert_eq!(sanitize_text("\u{1b}[32mok\u{1b}[0m done"), "ok done");
    }

    #[test]
    fn log_file_name_embeds_repo_command_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(dir.path(), "svc-a", "build");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("svc-a-build-"));
        let stem = name.strip_suffix(".log").unwrap();
        let millis = stem.rsplit('-').next().unwrap();
        assert!(millis.parse::<u128>().is_ok());
    }

    #[test]
    fn newest_log_picks_largest_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svc-a-dev-100.log"), "old").unwrap();
        fs::write(dir.path().join("svc-a-build-300.log"), "new").unwrap();
        fs::write(dir.path().join("svc-b-dev-900.log"), "other repo").unwrap();
        let newest = newest_log(dir.path(), "svc-a").unwrap();
        assert_eq!(
            newest.file_name().unwrap().to_str().unwrap(),
            "svc-a-build-300.log"
        );
    }

    #[test]
    fn newest_log_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("svc-a-notes.txt"), "").unwrap();
        assert_eq!(newest_log(dir.path(), "svc-a"), None);
    }
}
