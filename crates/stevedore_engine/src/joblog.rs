//! Per-job log files.
//!
//! `<dataDir>/logs/jobs/<jobId>.log` collects engine output across all
//! episodes of a job; `<jobId>.cmd` records the rendered command line
//! with secret-bearing environment values masked. When the log grows
//! past the cap it is truncated from the head so the most recent output
//! survives.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::EngineError;

const TRUNCATION_MARKER: &str = "[... log truncated from head ...]\n";

/// Single writer for one job's log file.
pub struct JobLogWriter {
    file: File,
    path: PathBuf,
    max_bytes: u64,
    bytes: u64,
}

impl JobLogWriter {
    pub fn open(logs_dir: &Path, job_id: &str, max_bytes: u64) -> Result<Self, EngineError> {
        std::fs::create_dir_all(logs_dir).map_err(|e| EngineError::io(logs_dir, e))?;
        let path = logs_dir.join(format!("{job_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::io(&path, e))?;
        let bytes = file
            .metadata()
            .map_err(|e| EngineError::io(&path, e))?
            .len();
        Ok(Self {
            file,
            path,
            max_bytes,
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line (newline added) and enforce the cap.
    pub fn append_line(&mut self, line: &str) -> Result<(), EngineError> {
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .map_err(|e| EngineError::io(&self.path, e))?;
        self.bytes += line.len() as u64 + 1;
        if self.max_bytes > 0 && self.bytes > self.max_bytes {
            self.truncate_head()?;
        }
        Ok(())
    }

    /// Keep the newest half of the cap, drop the rest from the head.
    fn truncate_head(&mut self) -> Result<(), EngineError> {
        let keep = self.max_bytes / 2;
        let start = self.bytes.saturating_sub(keep);

        let mut reader = File::open(&self.path).map_err(|e| EngineError::io(&self.path, e))?;
        reader
            .seek(SeekFrom::Start(start))
            .map_err(|e| EngineError::io(&self.path, e))?;
        let mut tail = Vec::with_capacity(keep as usize);
        reader
            .read_to_end(&mut tail)
            .map_err(|e| EngineError::io(&self.path, e))?;

        // Cut at the next newline so the file starts on a line boundary.
        let offset = tail
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);

        let mut file = File::create(&self.path).map_err(|e| EngineError::io(&self.path, e))?;
        file.write_all(TRUNCATION_MARKER.as_bytes())
            .and_then(|_| file.write_all(&tail[offset..]))
            .map_err(|e| EngineError::io(&self.path, e))?;
        self.bytes = TRUNCATION_MARKER.len() as u64 + (tail.len() - offset) as u64;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::io(&self.path, e))?;
        Ok(())
    }
}

/// Write `<jobId>.cmd`: argv verbatim (never contains secrets) plus the
/// environment delta with secret values masked.
pub fn write_cmd_file(
    logs_dir: &Path,
    job_id: &str,
    binary: &Path,
    args: &[String],
    env: &[(String, String)],
    secret_values: &[&str],
) -> Result<PathBuf, EngineError> {
    std::fs::create_dir_all(logs_dir).map_err(|e| EngineError::io(logs_dir, e))?;
    let path = logs_dir.join(format!("{job_id}.cmd"));

    let mut rendered = String::new();
    for (key, value) in env {
        let shown = if secret_values.iter().any(|s| value.contains(s)) {
            "****"
        } else {
            value.as_str()
        };
        rendered.push_str(&format!("{key}={shown} \\\n  "));
    }
    rendered.push_str(&binary.display().to_string());
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered.push('\n');

    std::fs::write(&path, rendered).map_err(|e| EngineError::io(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_and_reopens() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = JobLogWriter::open(dir.path(), "job1", 0).unwrap();
            log.append_line("first").unwrap();
        }
        {
            let mut log = JobLogWriter::open(dir.path(), "job1", 0).unwrap();
            log.append_line("second").unwrap();
        }
        let content = std::fs::read_to_string(dir.path().join("job1.log")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn cap_keeps_the_tail() {
        let dir = TempDir::new().unwrap();
        let mut log = JobLogWriter::open(dir.path(), "job1", 1024).unwrap();
        for i in 0..200 {
            log.append_line(&format!("line number {i:04}")).unwrap();
        }
        let content = std::fs::read_to_string(dir.path().join("job1.log")).unwrap();
        assert!(content.len() as u64 <= 1100, "stays near the cap");
        assert!(content.starts_with(TRUNCATION_MARKER));
        assert!(content.contains("line number 0199"), "tail survives");
        assert!(!content.contains("line number 0000"), "head dropped");
    }

    #[test]
    fn cmd_file_masks_secret_env_values() {
        let dir = TempDir::new().unwrap();
        let env = vec![
            (
                "RCLONE_CONFIG_TARGET_SECRET_ACCESS_KEY".to_string(),
                "hunter2hunter2".to_string(),
            ),
            ("RCLONE_CONFIG_TARGET_PROVIDER".to_string(), "Minio".to_string()),
        ];
        let path = write_cmd_file(
            dir.path(),
            "job1",
            Path::new("/usr/bin/rclone"),
            &["sync".to_string(), "/data".to_string(), "target:bucket".to_string()],
            &env,
            &["hunter2hunter2"],
        )
        .unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(!content.contains("hunter2hunter2"));
        assert!(content.contains("****"));
        assert!(content.contains("Minio"), "non-secret env stays readable");
        assert!(content.contains("target:bucket"));
    }
}
