use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveTime};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DAILY_BASENAME: &str = "statics_by_day";

/// How long after the archive time a write is still accepted, in seconds.
const WINDOW_SECS: i64 = 5;

#[derive(Serialize)]
struct Snapshot<'a> {
    timestamp: String,
    statics_by_day: &'a Value,
}

/// Writes the daily statistics snapshot to `<dir>/<basename>_<YYYYMMDD>.json`.
#[derive(Debug, Clone)]
pub struct Archiver {
    dir: PathBuf,
    basename: String,
    at: NaiveTime,
}

impl Archiver {
    pub fn new(dir: impl Into<PathBuf>, basename: &str, at: NaiveTime) -> Self {
        Self {
            dir: dir.into(),
            basename: basename.to_string(),
            at,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the data directory. Failure is logged only; the next write will report it again.
    pub fn ensure_dir(&self) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "could not create data directory");
        }
    }

    /// True inside the daily window, unless today's snapshot was already written.
    pub fn is_due(&self, now: DateTime<Local>, last_archived: Option<NaiveDate>) -> bool {
        let today = now.date_naive();
        if last_archived == Some(today) {
            return false;
        }
        let since = now.time().signed_duration_since(self.at);
        since >= ChronoDuration::zero() && since < ChronoDuration::seconds(WINDOW_SECS)
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.json", self.basename, date.format("%Y%m%d")))
    }

    pub fn write(&self, now: DateTime<Local>, value: &Value) -> Result<PathBuf> {
        let path = self.path_for(now.date_naive());
        let snapshot = Snapshot {
            timestamp: now.to_rfc3339(),
            statics_by_day: value,
        };
        fs::write(&path, serde_json::to_vec_pretty(&snapshot)?)?;
        info!(path = %path.display(), "saved {} snapshot", self.basename);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, h, m, s).single().unwrap()
    }

    fn archiver(dir: &Path) -> Archiver {
        Archiver::new(dir, DAILY_BASENAME, NaiveTime::from_hms_opt(23, 56, 0).unwrap())
    }

    #[test]
    fn due_only_inside_window() {
        let a = archiver(Path::new("/unused"));
        assert!(!a.is_due(at(23, 55, 59), None));
        assert!(a.is_due(at(23, 56, 0), None));
        assert!(a.is_due(at(23, 56, 4), None));
        assert!(!a.is_due(at(23, 56, 5), None));
        assert!(!a.is_due(at(12, 0, 0), None));
    }

    #[test]
    fn not_due_twice_on_same_day() {
        let a = archiver(Path::new("/unused"));
        let now = at(23, 56, 1);
        assert!(!a.is_due(now, Some(now.date_naive())));
        assert!(a.is_due(now, now.date_naive().pred_opt()));
    }

    #[test]
    fn writes_dated_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let a = archiver(dir.path());
        let path = a.write(at(23, 56, 2), &json!({"epv": 10})).unwrap();
        assert_eq!(path, dir.path().join("statics_by_day_20240601.json"));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains('\n'));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["statics_by_day"], json!({"epv": 10}));
        assert!(value["timestamp"].as_str().unwrap().starts_with("2024-06-01T23:56:02"));
    }

    #[test]
    fn write_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let a = archiver(&dir.path().join("missing"));
        assert!(a.write(at(23, 56, 0), &json!({})).is_err());
    }
}
