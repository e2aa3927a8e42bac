// src/subject.rs
// 被试记录文件：只追加写入；"键 = 值" 行在下次会话重新读取，"#" 行仅供查看
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info};
use serde::Serialize;

use crate::drivers::RecordError;

pub const MIN_NAME_LEN: usize = 5;
const EXTENSION: &str = "subject";

/// Values reloaded from a subject record. Later assignments win.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SubjectProfile {
    pub subject_name: Option<String>,
    pub group: Option<String>,
    pub session_number: Option<u32>,
    pub zero_point: Option<f64>,
    pub spread_scale: Option<f64>,
    pub calibration_minutes: Option<f64>,
    pub block_minutes: Option<f64>,
    pub block_count: Option<usize>,
}

impl SubjectProfile {
    pub fn session_number(&self) -> u32 {
        self.session_number.unwrap_or(1)
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}

fn parse_value<T: std::str::FromStr>(line: usize, key: &str, value: &str) -> Result<T, RecordError> {
    value.parse().map_err(|_| RecordError::InvalidValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Strict reader for the assignment lines. Content is never evaluated.
pub fn parse_profile(text: &str) -> Result<SubjectProfile, RecordError> {
    let mut profile = SubjectProfile::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = trimmed
            .split_once('=')
            .ok_or(RecordError::Malformed { line })?;
        let key = key.trim();
        let value = unquote(value.trim());
        match key {
            "subject_name" => profile.subject_name = Some(value.to_string()),
            "group" => profile.group = Some(value.to_string()),
            "session_number" => profile.session_number = Some(parse_value(line, key, value)?),
            "zero_point" => profile.zero_point = Some(parse_value(line, key, value)?),
            "spread_scale" => profile.spread_scale = Some(parse_value(line, key, value)?),
            "calibration_minutes" => profile.calibration_minutes = Some(parse_value(line, key, value)?),
            "block_minutes" => profile.block_minutes = Some(parse_value(line, key, value)?),
            "block_count" => profile.block_count = Some(parse_value(line, key, value)?),
            other => {
                return Err(RecordError::UnknownKey {
                    line,
                    key: other.to_string(),
                })
            }
        }
    }
    Ok(profile)
}

pub fn assignment(key: &str, value: impl Display) -> String {
    format!("{key} = {value}\n")
}

pub fn quoted(key: &str, value: &str) -> String {
    format!("{key} = \"{value}\"\n")
}

pub fn note(key: &str, value: impl Display) -> String {
    format!("# {key} = {value}\n")
}

pub fn heading(text: &str) -> String {
    format!("\n##### {text} -- {} #####\n", Local::now().format("%d.%m.%Y %H:%M:%S"))
}

#[derive(Clone, Debug)]
pub struct SubjectRecord {
    path: PathBuf,
}

impl SubjectRecord {
    pub fn path_for(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.{EXTENSION}"))
    }

    /// New subject: rejects short names and names that already have a record.
    pub fn create(dir: &Path, name: &str, group: &str) -> Result<Self, RecordError> {
        let name = name.trim();
        if name.chars().count() < MIN_NAME_LEN {
            return Err(RecordError::NameTooShort {
                name: name.to_string(),
                min: MIN_NAME_LEN,
            });
        }
        let path = Self::path_for(dir, name);
        if path.exists() {
            return Err(RecordError::AlreadyExists(path));
        }
        fs::create_dir_all(dir)?;
        OpenOptions::new().create_new(true).append(true).open(&path)?;
        let record = Self { path };
        record.append(
            "initial settings",
            &format!("{}{}", quoted("subject_name", name), quoted("group", group)),
        )?;
        info!("created subject record {}", record.path.display());
        Ok(record)
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, SubjectProfile), RecordError> {
        let path = path.into();
        let text = fs::read_to_string(&path)?;
        let profile = parse_profile(&text)?;
        info!(
            "loaded subject record {} (session {})",
            path.display(),
            profile.session_number()
        );
        Ok((Self { path }, profile))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `text`; the record must already exist.
    pub fn append(&self, section: &str, text: &str) -> Result<(), RecordError> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(text.as_bytes())?;
        debug!("{section} written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    #[test]
    fn parses_assignments_and_skips_comments() {
        let text = "subject_name = \"JanKowalski\"\n\
                    group = 'AFRAFRAFRAFRAFRAFR'\n\
                    # zero_point = 99\n\
                    \n\
                    zero_point = 0.125\n\
                    spread_scale = 0.04\n\
                    session_number = 2\n\
                    session_number = 3\n";
        let profile = parse_profile(text).unwrap();
        assert_eq!(profile.subject_name.as_deref(), Some("JanKowalski"));
        assert_eq!(profile.group.as_deref(), Some("AFRAFRAFRAFRAFRAFR"));
        assert_eq!(profile.zero_point, Some(0.125));
        assert_eq!(profile.spread_scale, Some(0.04));
        assert_eq!(profile.session_number(), 3);
        assert_eq!(profile.block_count, None);
    }
    #[test]
    fn unknown_key_is_rejected_with_line() {
        let err = parse_profile("group = \"A\"\nimport os\n").unwrap_err();
        assert!(matches!(err, RecordError::Malformed { line: 2 }));
        let err = parse_profile("\n__import__ = 1\n").unwrap_err();
        assert!(matches!(err, RecordError::UnknownKey { line: 2, ref key } if key == "__import__"));
    }
    #[test]
    fn invalid_number_is_rejected() {
        let err = parse_profile("block_count = five").unwrap_err();
        assert!(matches!(err, RecordError::InvalidValue { line: 1, .. }));
    }
    #[test]
    fn create_validates_name_and_uniqueness() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            SubjectRecord::create(dir.path(), "Jan", "AFR"),
            Err(RecordError::NameTooShort { .. })
        ));
        let record = SubjectRecord::create(dir.path(), "JanKowalski", "ARFARF").unwrap();
        assert!(matches!(
            SubjectRecord::create(dir.path(), "JanKowalski", "ARFARF"),
            Err(RecordError::AlreadyExists(_))
        ));
        record
            .append("calibration", &(note("mean", 0.5) + &assignment("zero_point", 0.5)))
            .unwrap();
        let (_, profile) = SubjectRecord::open(record.path()).unwrap();
        assert_eq!(profile.subject_name.as_deref(), Some("JanKowalski"));
        assert_eq!(profile.group.as_deref(), Some("ARFARF"));
        assert_eq!(profile.zero_point, Some(0.5));
        assert_eq!(profile.session_number(), 1);
    }
    #[test]
    fn heading_is_a_comment_block() {
        let h = heading("session 1 start");
        assert!(h.lines().filter(|l| !l.is_empty()).all(|l| l.starts_with('#')));
        assert!(parse_profile(&h).unwrap() == SubjectProfile::default());
    }
}
