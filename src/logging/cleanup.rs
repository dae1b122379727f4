use crate::config::LogRotationConfig;
use crate::logging::filename::{parse_rotated_filename, RotatedLogName};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

/// Removes rotated files older than `keep_days`, then the oldest ones beyond `max_num`.
pub fn prune_rotated_logs(
    dir: &Path,
    current_file_name: &str,
    rotation: &LogRotationConfig,
) -> io::Result<()> {
    let stem = Path::new(current_file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("edge-export");

    let mut rotated: Vec<(PathBuf, RotatedLogName)> = fs::read_dir(dir)?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name();
            let parsed = parse_rotated_filename(name.to_str()?, stem)?;
            Some((entry.path(), parsed))
        })
        .collect();
    rotated.sort_by(|(_, a), (_, b)| {
        a.timestamp_utc
            .cmp(&b.timestamp_utc)
            .then_with(|| a.seq.cmp(&b.seq))
    });

    let cutoff = OffsetDateTime::now_utc() - Duration::days(rotation.keep_days as i64);
    let (expired, kept): (Vec<_>, Vec<_>) = rotated
        .into_iter()
        .partition(|(_, name)| name.timestamp_utc < cutoff);
    let excess = kept.len().saturating_sub(rotation.max_num as usize);

    for (path, _) in expired.iter().chain(kept.iter().take(excess)) {
        if let Err(err) = fs::remove_file(path) {
            tracing::debug!(path = %path.display(), error = %err, "failed to remove rotated log");
        }
    }
    Ok(())
}
