//! `year=YYYY/month=MM/day=DD` directory layout under the partition root.

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};

use chatlake_core::types::DateRange;

/// Columnar file extension used throughout the lake.
pub const COLUMNAR_EXT: &str = "col";
/// Scratch area for in-flight batches, cleaned on compactor startup.
pub const TMP_DIR: &str = ".tmp";
/// Contact-sync records live in a sibling dataset under the same layout.
pub const CONTACTS_DIR: &str = "contacts";

/// Partition directory for a calendar date: `<root>/year=2026/month=01/day=23`.
pub fn partition_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(format!("year={:04}", date.year()))
        .join(format!("month={:02}", date.month()))
        .join(format!("day={:02}", date.day()))
}

pub fn contacts_root(root: &Path) -> PathBuf {
    root.join(CONTACTS_DIR)
}

/// Parse a `key=value` path component, returning the value for `key`.
fn key_value(component: &str, key: &str) -> Option<u32> {
    component
        .strip_prefix(key)?
        .strip_prefix('=')?
        .parse()
        .ok()
}

/// Recover the date encoded by a partition directory path, if it is one.
pub fn parse_partition_dir(dir: &Path) -> Option<NaiveDate> {
    let mut components = dir.iter().rev().filter_map(|c| c.to_str());
    let day = key_value(components.next()?, "day")?;
    let month = key_value(components.next()?, "month")?;
    let year = key_value(components.next()?, "year")? as i32;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Enumerate existing partition directories overlapping `range`, in date
/// order. Directories that do not follow the layout are ignored.
pub fn list_partitions(root: &Path, range: DateRange) -> Vec<(NaiveDate, PathBuf)> {
    // The range is bounded, so walking candidate dates beats scanning the
    // whole tree when the lake holds years of history.
    range
        .days()
        .filter_map(|day| {
            let dir = partition_dir(root, day);
            dir.is_dir().then_some((day, dir))
        })
        .collect()
}

/// Every partition directory under `root`, in date order. Used when no date
/// bound is available (id lookups).
pub fn all_partitions(root: &Path) -> Vec<(NaiveDate, PathBuf)> {
    fn children_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(prefix))
            })
            .collect();
        dirs.sort();
        dirs
    }

    let mut found = Vec::new();
    for year_dir in children_with_prefix(root, "year=") {
        for month_dir in children_with_prefix(&year_dir, "month=") {
            for day_dir in children_with_prefix(&month_dir, "day=") {
                if let Some(date) = parse_partition_dir(&day_dir) {
                    found.push((date, day_dir));
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn layout_is_zero_padded() {
        let dir = partition_dir(Path::new("/lake"), date(2026, 1, 3));
        assert_eq!(dir, Path::new("/lake/year=2026/month=01/day=03"));
    }

    #[test]
    fn parse_round_trips() {
        let dir = partition_dir(Path::new("/lake"), date(2026, 12, 31));
        assert_eq!(parse_partition_dir(&dir), Some(date(2026, 12, 31)));
    }

    #[test]
    fn parse_rejects_foreign_paths() {
        assert_eq!(parse_partition_dir(Path::new("/lake/contacts")), None);
        assert_eq!(parse_partition_dir(Path::new("/lake/year=x/month=01/day=02")), None);
    }

    #[test]
    fn list_partitions_prunes_to_range() {
        let tmp = tempfile::tempdir().unwrap();
        for d in [date(2026, 1, 20), date(2026, 1, 22), date(2026, 1, 25)] {
            std::fs::create_dir_all(partition_dir(tmp.path(), d)).unwrap();
        }
        let range = DateRange::new(date(2026, 1, 21), date(2026, 1, 23));
        let found = list_partitions(tmp.path(), range);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, date(2026, 1, 22));
    }
}
