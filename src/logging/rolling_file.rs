use crate::config::FileLoggingConfig;
use crate::logging::cleanup::prune_rotated_logs;
use crate::logging::filename::{format_rotated_filename, parse_rotated_filename};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Append-only log file that is renamed aside once it reaches `max_size_mb`.
pub struct RollingFileWriter {
    cfg: FileLoggingConfig,
    dir: PathBuf,
    active: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl RollingFileWriter {
    pub fn open(cfg: FileLoggingConfig) -> io::Result<Self> {
        let dir = PathBuf::from(&cfg.dir);
        fs::create_dir_all(&dir)?;
        let active = dir.join(&cfg.file_name);
        let file = OpenOptions::new().create(true).append(true).open(&active)?;
        let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
        prune_rotated_logs(&dir, &cfg.file_name, &cfg.rotation)?;
        Ok(Self {
            cfg,
            dir,
            active,
            file: Some(file),
            bytes_written,
        })
    }

    fn size_limit(&self) -> Option<u64> {
        match self.cfg.rotation.max_size_mb {
            0 => None,
            mb => Some(mb.saturating_mul(BYTES_PER_MB)),
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let stem = self
            .active
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("edge-export")
            .to_string();
        let now = OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let seq = next_seq_for_timestamp(&self.dir, &stem, now);
        fs::rename(
            &self.active,
            self.dir.join(format_rotated_filename(&stem, now, seq)),
        )?;

        self.file = Some(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.active)?,
        );
        self.bytes_written = 0;
        prune_rotated_logs(&self.dir, &self.cfg.file_name, &self.cfg.rotation)
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("log file not open"))
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limit) = self.size_limit() {
            if self.bytes_written.saturating_add(buf.len() as u64) >= limit {
                self.rotate()?;
            }
        }
        let written = self.file()?.write(buf)?;
        self.bytes_written = self.bytes_written.saturating_add(written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

fn next_seq_for_timestamp(dir: &Path, stem: &str, ts: OffsetDateTime) -> u16 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 1;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            parse_rotated_filename(&entry.file_name().to_string_lossy(), stem)
        })
        .filter(|parsed| parsed.timestamp_utc == ts)
        .map(|parsed| parsed.seq)
        .max()
        .unwrap_or(0)
        .saturating_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogRotationConfig;
    use tempfile::TempDir;

    fn config(dir: &Path, max_size_mb: u64) -> FileLoggingConfig {
        FileLoggingConfig {
            dir: dir.join("logs").to_string_lossy().into_owned(),
            file_name: "export.log".to_string(),
            rotation: LogRotationConfig {
                keep_days: 7,
                max_num: 5,
                max_size_mb,
            },
        }
    }

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().flatten().count()
    }

    #[test]
    fn creates_directory_and_appends() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), 1);
        let mut writer = RollingFileWriter::open(cfg.clone()).unwrap();
        writer.write_all(b"first line\n").unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut writer = RollingFileWriter::open(cfg.clone()).unwrap();
        assert_eq!(writer.bytes_written, 11);
        writer.write_all(b"second line\n").unwrap();
        writer.flush().unwrap();

        let content = fs::read_to_string(Path::new(&cfg.dir).join(&cfg.file_name)).unwrap();
        assert_eq!(content, "first line\nsecond line\n");
    }

    #[test]
    fn rotates_when_the_size_limit_is_reached() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), 1);
        let chunk = vec![b'x'; 600 * 1024];
        let mut writer = RollingFileWriter::open(cfg.clone()).unwrap();
        writer.write_all(&chunk).unwrap();
        writer.write_all(&chunk).unwrap();
        writer.flush().unwrap();

        let dir = Path::new(&cfg.dir);
        assert_eq!(entries(dir), 2);
        let active = fs::metadata(dir.join(&cfg.file_name)).unwrap();
        assert_eq!(active.len(), chunk.len() as u64);
    }

    #[test]
    fn zero_size_disables_rotation() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), 0);
        let mut writer = RollingFileWriter::open(cfg.clone()).unwrap();
        for _ in 0..100 {
            writer.write_all(b"reading published\n").unwrap();
        }
        writer.flush().unwrap();
        assert_eq!(entries(Path::new(&cfg.dir)), 1);
    }

    #[test]
    fn sequence_follows_existing_rotations() {
        let tmp = TempDir::new().unwrap();
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(next_seq_for_timestamp(tmp.path(), "app", ts), 1);
        assert_eq!(next_seq_for_timestamp(Path::new("/nonexistent/logs"), "app", ts), 1);

        for (stem, seq) in [("app", 1), ("app", 2), ("other", 9)] {
            fs::write(tmp.path().join(format_rotated_filename(stem, ts, seq)), b"").unwrap();
        }
        assert_eq!(next_seq_for_timestamp(tmp.path(), "app", ts), 3);
    }
}
