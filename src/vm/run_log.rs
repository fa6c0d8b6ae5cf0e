//! The per-target run log.
//!
//! One text file per target, `<working dir>/<working dir>.out.txt`. The file
//! is truncated when a build cycle starts and only appended to afterwards;
//! it is the only record classification looks at.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

/// Prefix of the heading line written before each remote command's output.
pub const HEADING_PREFIX: &str = "> ";

const BANNER_MARK: &str = " build cycle started ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    /// Log for the working directory `dir`; the file name repeats the
    /// directory's final component.
    pub fn for_working_dir(dir: &Path) -> Self {
        let stem = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        Self {
            path: dir.join(format!("{stem}.out.txt")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a fresh log: replaces previous content with a banner line.
    pub async fn truncate(&self, target: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
        let banner = format!("# {target}{BANNER_MARK}{}\n", Utc::now().to_rfc3339());
        tokio::fs::write(&self.path, banner)
            .await
            .with_context(|| format!("truncate run log {}", self.path.display()))
    }

    /// Append the heading for one command.
    pub async fn heading(&self, command: &str) -> Result<()> {
        self.append(&format!("\n{HEADING_PREFIX}{command}\n\n")).await
    }

    pub async fn append(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open run log {}", self.path.display()))?;
        file.write_all(text.as_bytes())
            .await
            .with_context(|| format!("append to run log {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Whole log content; an absent log reads as empty.
    pub async fn read(&self) -> Result<String> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("read run log {}", self.path.display())),
        }
    }

    /// Log content written by a cycle that started at or after `since`.
    ///
    /// A log whose banner is older, or missing, belongs to an earlier run
    /// and reads as empty.
    pub async fn read_since(&self, since: DateTime<Utc>) -> Result<String> {
        let text = self.read().await?;
        match banner_time(&text) {
            Some(started) if started >= since => Ok(text),
            _ => Ok(String::new()),
        }
    }
}

fn banner_time(text: &str) -> Option<DateTime<Utc>> {
    let first = text.lines().next()?.strip_prefix("# ")?;
    let (_, stamp) = first.split_once(BANNER_MARK)?;
    DateTime::parse_from_rfc3339(stamp.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_repeats_working_dir_name() {
        let log = RunLog::for_working_dir(Path::new("/work/NetBSD"));
        assert_eq!(log.path(), Path::new("/work/NetBSD/NetBSD.out.txt"));
    }

    #[tokio::test]
    async fn truncate_discards_previous_content() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::for_working_dir(&tmp.path().join("Debian"));

        log.truncate("Debian").await.unwrap();
        log.heading("first").await.unwrap();
        log.append("old output\n").await.unwrap();

        log.truncate("Debian").await.unwrap();
        log.heading("second").await.unwrap();

        let text = log.read().await.unwrap();
        assert!(text.starts_with("# Debian build cycle started"));
        assert!(!text.contains("old output"));
        assert!(text.contains("\n> second\n"));
    }

    #[tokio::test]
    async fn log_from_an_earlier_run_is_not_current() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::for_working_dir(&tmp.path().join("Debian"));
        std::fs::create_dir_all(tmp.path().join("Debian")).unwrap();
        std::fs::write(
            log.path(),
            "# Debian build cycle started 2001-02-03T04:05:06+00:00\n[100%] Built target Self\n",
        )
        .unwrap();

        let since = Utc::now();
        assert_eq!(log.read_since(since).await.unwrap(), "");

        log.truncate("Debian").await.unwrap();
        log.append("fresh\n").await.unwrap();
        assert!(log.read_since(since).await.unwrap().contains("fresh"));
    }

    #[tokio::test]
    async fn log_without_banner_is_not_current() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::for_working_dir(&tmp.path().join("NetBSD"));
        std::fs::create_dir_all(tmp.path().join("NetBSD")).unwrap();
        std::fs::write(log.path(), "ALL TESTS COMPLETE\n").unwrap();
        let since = DateTime::<Utc>::MIN_UTC;
        assert_eq!(log.read_since(since).await.unwrap(), "");
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::for_working_dir(&tmp.path().join("FreeBSD"));
        assert_eq!(log.read().await.unwrap(), "");
    }
}
