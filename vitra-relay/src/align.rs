//! Recording alignment planner.
//!
//! Participants record audio locally and upload `<user>_<anything>.wav`.
//! Each user's recording start is known as a wall-clock string
//! `"h,m,s,ms"`. To mix the recordings they have to be padded so they all
//! line up with the latest starter: every file gets
//! `latest_start - own_start` of leading silence.
//!
//! Only the plan is computed here; rendering the padded mix is up to the
//! caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AlignError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid clock time {0:?}, expected \"h,m,s,ms\"")]
    InvalidClock(String),
}

/// Time of day as recorded by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ClockTime {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub millis: u32,
}

impl ClockTime {
    pub fn since_midnight(&self) -> Duration {
        Duration::from_millis(
            u64::from(self.hours) * 3_600_000
                + u64::from(self.minutes) * 60_000
                + u64::from(self.seconds) * 1_000
                + u64::from(self.millis),
        )
    }
}

impl FromStr for ClockTime {
    type Err = AlignError;

    /// An empty string is midnight. Missing trailing fields are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        let fields = s
            .split(',')
            .map(|f| f.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| AlignError::InvalidClock(s.to_string()))?;
        if fields.len() > 4 {
            return Err(AlignError::InvalidClock(s.to_string()));
        }
        let field = |i: usize| fields.get(i).copied().unwrap_or(0);
        Ok(Self {
            hours: field(0),
            minutes: field(1),
            seconds: field(2),
            millis: field(3),
        })
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.hours, self.minutes, self.seconds, self.millis)
    }
}

/// One recording in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignEntry {
    pub path: PathBuf,
    pub user: String,
    pub start: ClockTime,
    pub leading_silence: Duration,
}

impl AlignEntry {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignPlan {
    /// Sorted by file name.
    pub entries: Vec<AlignEntry>,
    /// The latest-starting recording; its padding is zero.
    pub reference: PathBuf,
}

/// User name encoded in a recording's file name: everything before the
/// first `_` (the whole stem if there is none).
pub fn user_of(file_name: &str) -> &str {
    let stem = file_name.strip_suffix(".wav").unwrap_or(file_name);
    stem.split('_').next().unwrap_or(stem)
}

/// Scan `dir` for `.wav` recordings and plan their padding.
///
/// `start_of` maps a user name to that user's recorded start, or `None`
/// when nothing was recorded; such files are left out of the plan.
/// Returns `Ok(None)` when no recording has a start.
pub fn plan_directory<F>(dir: &Path, start_of: F) -> Result<Option<AlignPlan>, AlignError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut recordings = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.ends_with(".wav") {
            continue;
        }
        let user = user_of(name);
        match start_of(user) {
            Some(clock) => recordings.push((entry.path(), user.to_string(), clock.parse()?)),
            None => log::debug!("No recording start for {user}, skipping {name}"),
        }
    }
    Ok(plan(recordings))
}

/// Plan padding for `(path, user, start)` triples.
pub fn plan(recordings: Vec<(PathBuf, String, ClockTime)>) -> Option<AlignPlan> {
    let mut entries: Vec<AlignEntry> = recordings
        .into_iter()
        .map(|(path, user, start)| AlignEntry {
            path,
            user,
            start,
            leading_silence: Duration::ZERO,
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    // First by name among equally late starters.
    let latest = entries
        .iter()
        .rev()
        .max_by_key(|e| e.start.since_midnight())?;
    let reference = latest.path.clone();
    let latest_start = latest.start.since_midnight();

    for entry in &mut entries {
        entry.leading_silence = latest_start.saturating_sub(entry.start.since_midnight());
    }
    Some(AlignPlan { entries, reference })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_clock_parse() {
        let clock: ClockTime = "10,5,30,250".parse().unwrap();
        assert_eq!(
            clock,
            ClockTime {
                hours: 10,
                minutes: 5,
                seconds: 30,
                millis: 250
            }
        );
        assert_eq!(clock.to_string(), "10,5,30,250");
        assert_eq!(clock.since_midnight(), Duration::from_millis(36_330_250));
        assert_eq!("".parse::<ClockTime>().unwrap(), ClockTime::default());
        assert_eq!("1,2".parse::<ClockTime>().unwrap().minutes, 2);
    }

    #[test]
    fn test_clock_parse_rejects_garbage() {
        assert!("a,b,c,d".parse::<ClockTime>().is_err());
        assert!("1,2,3,4,5".parse::<ClockTime>().is_err());
        assert!("-1,0,0,0".parse::<ClockTime>().is_err());
    }

    #[test]
    fn test_user_of() {
        assert_eq!(user_of("alice_take1.wav"), "alice");
        assert_eq!(user_of("bob.wav"), "bob");
        assert_eq!(user_of("carol_a_b.wav"), "carol");
    }

    #[test]
    fn test_plan_pads_to_latest() {
        let plan = plan(vec![
            ("b.wav".into(), "b".into(), "10,0,2,500".parse().unwrap()),
            ("a.wav".into(), "a".into(), "10,0,0,0".parse().unwrap()),
        ])
        .unwrap();

        assert_eq!(plan.reference, PathBuf::from("b.wav"));
        let silences: Vec<(&str, Duration)> = plan
            .entries
            .iter()
            .map(|e| (e.file_name(), e.leading_silence))
            .collect();
        assert_eq!(
            silences,
            vec![
                ("a.wav", Duration::from_millis(2_500)),
                ("b.wav", Duration::ZERO)
            ]
        );
    }

    #[test]
    fn test_plan_empty() {
        assert!(plan(Vec::new()).is_none());
    }

    #[test]
    fn test_plan_directory() {
        let dir = TempDir::new().unwrap();
        for name in ["alice_1.wav", "bob_1.wav", "carol_1.wav", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"RIFF").unwrap();
        }
        let starts: HashMap<&str, &str> =
            HashMap::from([("alice", "9,0,0,0"), ("bob", "9,0,1,0")]);

        let plan = plan_directory(dir.path(), |user| starts.get(user).map(|s| s.to_string()))
            .unwrap()
            .unwrap();

        let names: Vec<&str> = plan.entries.iter().map(|e| e.file_name()).collect();
        assert_eq!(names, vec!["alice_1.wav", "bob_1.wav"]);
        assert_eq!(plan.entries[0].leading_silence, Duration::from_secs(1));
        assert_eq!(plan.reference, dir.path().join("bob_1.wav"));
    }

    #[test]
    fn test_plan_directory_bad_clock() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("alice_1.wav"), b"RIFF").unwrap();

        let result = plan_directory(dir.path(), |_| Some("noon".to_string()));
        assert!(matches!(result, Err(AlignError::InvalidClock(_))));
    }
}
