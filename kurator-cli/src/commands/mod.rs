pub mod daemon;
pub mod history;
pub mod invalidate;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use kurator_replica::FileReplicaStore;

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub fn open_replica(home: &std::path::Path) -> Result<FileReplicaStore> {
    FileReplicaStore::open_at(home).context("failed to open replica under ~/.kurator/replica")
}

/// `42s`, `5m`, `3h`, `2d`.
pub fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0) as u64;
    format_seconds(seconds)
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_pick_the_largest_unit() {
        assert_eq!(format_seconds(0), "0s");
        assert_eq!(format_seconds(59), "59s");
        assert_eq!(format_seconds(61), "1m");
        assert_eq!(format_seconds(3 * 3600 + 5), "3h");
        assert_eq!(format_seconds(2 * 86_400), "2d");
    }

    #[test]
    fn future_timestamps_clamp_to_zero() {
        let ahead = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(format_age(ahead), "0s");
    }
}
