use super::archive::ArchiveSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One stored upload. Field names on the wire match documents written by
/// earlier releases, so old metadata files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "uuid")]
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub relative_path: String,
    pub date: String,
    #[serde(rename = "file_path")]
    pub storage_path: PathBuf,
    #[serde(with = "timestamp")]
    pub upload_time: DateTime<Utc>,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub viewed: bool,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub viewed_time: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Flip to viewed. Only the first call records a time.
    pub fn mark_viewed(&mut self, at: DateTime<Utc>) {
        if !self.viewed {
            self.viewed = true;
            self.viewed_time = Some(at);
        }
    }
}

/// Inputs for a single upload.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub data: Vec<u8>,
    pub original_filename: String,
    pub custom_filename: Option<String>,
    pub relative_path: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    #[serde(rename = "file_info")]
    pub record: FileRecord,
    pub original_filename: String,
    pub saved_filename: String,
    /// `relative_path/date/filename`, or `date/filename` at the root.
    pub full_path: String,
    #[serde(rename = "archive_info", skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    UploadTime,
    Filename,
    FileSize,
    Date,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Filter, sort and pagination for a listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileQuery {
    pub relative_path: Option<String>,
    pub date: Option<String>,
    pub page: usize,
    pub page_size: usize,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
}

impl Default for FileQuery {
    fn default() -> Self {
        Self {
            relative_path: None,
            date: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort_by: SortKey::default(),
            sort_order: SortOrder::default(),
        }
    }
}

/// A record as seen by a listing, with state recomputed at query time.
#[derive(Debug, Clone, Serialize)]
pub struct ListedFile {
    #[serde(flatten)]
    pub record: FileRecord,
    pub exists: bool,
    pub current_size: u64,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    pub files: Vec<ListedFile>,
    pub total_count: usize,
    pub pagination: Pagination,
}

/// Existing-file counts keyed by relative path, then date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryStats {
    pub directories: BTreeMap<String, BTreeMap<String, usize>>,
    pub total_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub before: usize,
    pub kept: usize,
    pub removed: Vec<String>,
    pub dry_run: bool,
}

/// Timestamps are written as RFC 3339. Offset-less ISO strings from older
/// documents are read as local time.
mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(de::Error::custom)
    }

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| format!("timestamp {raw:?} does not exist in local time"))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| super::parse(&raw).map_err(de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> FileRecord {
        FileRecord {
            id: "3f1c".into(),
            filename: "report.html".into(),
            relative_path: String::new(),
            date: "2024-05-01".into(),
            storage_path: PathBuf::from("/srv/uploads/2024-05-01/report.html"),
            upload_time: Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
            file_size: 42,
            viewed: false,
            viewed_time: None,
        }
    }

    #[test]
    fn reads_documents_written_by_older_releases() {
        let json = r#"[{
            "uuid": "a1",
            "filename": "a.txt",
            "relative_path": "team",
            "date": "2024-01-02",
            "file_path": "/app/uploads/team/2024-01-02/a.txt",
            "upload_time": "2024-01-02T10:11:12.123456",
            "file_size": 7
        }]"#;
        let records: Vec<FileRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "a1");
        assert!(!records[0].viewed);
        assert!(records[0].viewed_time.is_none());
    }

    #[test]
    fn writes_legacy_key_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["uuid"], "3f1c");
        assert_eq!(value["file_path"], "/srv/uploads/2024-05-01/report.html");
        assert!(value.get("viewed_time").is_none());
    }

    #[test]
    fn mark_viewed_only_records_first_time() {
        let mut record = sample();
        let first = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap();
        record.mark_viewed(first);
        record.mark_viewed(second);
        assert!(record.viewed);
        assert_eq!(record.viewed_time, Some(first));
    }

    #[test]
    fn query_defaults() {
        let q: FileQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.page, 1);
        assert_eq!(q.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(q.sort_by, SortKey::UploadTime);
        assert_eq!(q.sort_order, SortOrder::Desc);
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert!(timestamp::parse("yesterday").is_err());
        assert!(timestamp::parse("2024-01-02T10:11:12+02:00").is_ok());
    }
}
