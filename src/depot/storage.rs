use super::archive::{self, ArchiveSummary, ExtractedFile};
use super::error::{DepotError, DepotResult};
use super::index::MetadataStore;
use super::paths::PathResolver;
use super::preview::{self, PreviewKind};
use super::schema::{
    CleanupReport, DirectoryStats, FileQuery, FileRecord, ListedFile, Pagination, QueryPage,
    SortKey, SortOrder, UploadOutcome, UploadRequest, MAX_PAGE_SIZE,
};
use chrono::{DateTime, Local, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_METADATA_FILE: &str = "file_metadata.json";

pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "doc", "docx", "xls", "xlsx", "jpg", "jpeg", "png", "gif", "html", "htm", "zip",
    "rar", "7z", "tar", "gz", "tgz", "bz2", "xz",
];

/// Knobs for a [`FileDepot`], resolved from config at startup.
#[derive(Debug, Clone)]
pub struct DepotOptions {
    /// Metadata document name inside the storage root.
    pub metadata_file: String,
    /// Lower-case extensions accepted on upload.
    pub allowed_extensions: BTreeSet<String>,
    /// How long after upload an unviewed file counts as new.
    pub new_file_window: TimeDelta,
}

impl Default for DepotOptions {
    fn default() -> Self {
        Self {
            metadata_file: DEFAULT_METADATA_FILE.to_string(),
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            new_file_window: TimeDelta::hours(24),
        }
    }
}

/// A stored file ready to be streamed back to a client.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub filename: String,
    pub mime_type: &'static str,
    pub size: u64,
}

/// Result of a preview request.
#[derive(Debug, Clone)]
pub enum Preview {
    /// Ready-to-serve HTML (stored HTML, or text wrapped in a page).
    Html(String),
    /// Archive listing; the caller renders it with its own download link.
    Archive {
        filename: String,
        summary: ArchiveSummary,
    },
    /// Not previewable; serve the bytes instead.
    Download(StoredFile),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutcome {
    /// Extraction directory relative to the storage root.
    pub extract_dir: String,
    pub files: Vec<ExtractedFile>,
    pub total_files: usize,
}

/// Uploads, listings and removals over one storage root.
///
/// Files land in `root/<relative_path>/<date>/<filename>` and every stored
/// file has exactly one [`FileRecord`] in the metadata document.
pub struct FileDepot {
    paths: PathResolver,
    index: MetadataStore,
    options: DepotOptions,
}

impl FileDepot {
    pub fn open(root: &Path, options: DepotOptions) -> DepotResult<Self> {
        let paths = PathResolver::new(root)?;
        let document = paths.resolve([options.metadata_file.as_str()])?;
        if document == paths.root() {
            return Err(DepotError::InvalidInput(
                "metadata file name must not be empty".into(),
            ));
        }
        let index = MetadataStore::new(document);
        info!(root = %paths.root().display(), "file depot opened");
        Ok(Self {
            paths,
            index,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn index(&self) -> &MetadataStore {
        &self.index
    }

    /// Store `request.data` under `root/<relative_path>/<date>/` and record it.
    pub fn upload(&self, request: UploadRequest) -> DepotResult<UploadOutcome> {
        let UploadRequest {
            data,
            original_filename,
            custom_filename,
            relative_path,
            date,
        } = request;

        let chosen = custom_filename
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| original_filename.clone());
        if chosen.trim().is_empty() {
            return Err(DepotError::InvalidInput("no file selected".into()));
        }
        self.check_extension(&chosen)?;

        let filename = sanitize_filename(&chosen);
        if filename.is_empty() {
            return Err(DepotError::InvalidInput(format!(
                "filename {chosen:?} has no usable characters"
            )));
        }
        self.check_extension(&filename)?;

        let date = match date.filter(|d| !d.trim().is_empty()) {
            Some(d) => validate_date(d.trim())?,
            None => Local::now().format("%Y-%m-%d").to_string(),
        };
        let relative_path = relative_path.unwrap_or_default().trim().to_string();

        let target_dir = self
            .paths
            .resolve([relative_path.as_str(), date.as_str()])?;
        let storage_path = self
            .paths
            .resolve([relative_path.as_str(), date.as_str(), filename.as_str()])?;
        fs::create_dir_all(&target_dir).map_err(|e| {
            DepotError::io(format!("failed to create {}", target_dir.display()), e)
        })?;
        fs::write(&storage_path, &data).map_err(|e| {
            DepotError::io(format!("failed to write {}", storage_path.display()), e)
        })?;

        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            filename: filename.clone(),
            relative_path: relative_path.clone(),
            date: date.clone(),
            storage_path,
            upload_time: Utc::now(),
            file_size: data.len() as u64,
            viewed: false,
            viewed_time: None,
        };
        if let Err(e) = self.index.append(record.clone()) {
            self.discard_unrecorded(&record.storage_path);
            return Err(e);
        }

        let archive_info =
            archive::is_archive_name(&filename).then(|| archive::inspect(&record.storage_path));

        let full_path = if relative_path.is_empty() {
            format!("{date}/{filename}")
        } else {
            format!("{relative_path}/{date}/{filename}")
        };
        info!(
            id = %record.id,
            path = %full_path,
            size = record.file_size,
            "file uploaded"
        );

        Ok(UploadOutcome {
            record,
            original_filename,
            saved_filename: filename,
            full_path,
            archive: archive_info,
        })
    }

    /// Filter, sort and page the collection. Each listed record is stat-ed so
    /// vanished files show up as `exists: false` instead of disappearing.
    pub fn query(&self, query: &FileQuery) -> QueryPage {
        let now = Utc::now();
        let relative_path = query.relative_path.as_deref().filter(|s| !s.is_empty());
        let date = query.date.as_deref().filter(|s| !s.is_empty());

        let mut listed: Vec<ListedFile> = self
            .index
            .load()
            .into_iter()
            .filter(|r| relative_path.is_none_or(|p| r.relative_path == p))
            .filter(|r| date.is_none_or(|d| r.date == d))
            .map(|record| self.listed(record, now))
            .collect();
        sort_listed(&mut listed, query.sort_by, query.sort_order);

        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
        let total_count = listed.len();
        let pagination = paginate(total_count, page, page_size);
        let files = listed
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        QueryPage {
            files,
            total_count,
            pagination,
        }
    }

    fn listed(&self, record: FileRecord, now: DateTime<Utc>) -> ListedFile {
        let (exists, current_size) = match fs::metadata(&record.storage_path) {
            Ok(meta) => (true, meta.len()),
            Err(_) => (false, 0),
        };
        let is_new = is_new(&record, now, self.options.new_file_window);
        ListedFile {
            record,
            exists,
            current_size,
            is_new,
        }
    }

    /// Remove the record with `id` and its backing file. Returns how many
    /// records were removed.
    ///
    /// A file that cannot be unlinked is logged and left behind; the record
    /// still goes. The file is only unlinked once no remaining record points
    /// at it.
    pub fn delete(&self, id: &str) -> DepotResult<usize> {
        let record = self
            .index
            .load()
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| DepotError::NotFound(format!("no file with id {id}")))?;

        let (remaining, removed) = self.index.remove_where(|r| r.id == id)?;
        if removed == 0 {
            return Err(DepotError::NotFound(format!("no file with id {id}")));
        }
        info!(id, removed, remaining = remaining.len(), "file record deleted");

        if remaining
            .iter()
            .any(|r| r.storage_path == record.storage_path)
        {
            debug!(
                id,
                path = %record.storage_path.display(),
                "file still referenced, not unlinking"
            );
        } else {
            self.remove_backing_file(&record);
        }
        Ok(removed)
    }

    /// Drop bytes written by an upload whose record never landed, unless an
    /// older record already owns the same path.
    fn discard_unrecorded(&self, path: &Path) {
        if self.index.load().iter().any(|r| r.storage_path == path) {
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => warn!(path = %path.display(), "removed upload left without a record"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove unrecorded upload")
            }
        }
    }

    fn remove_backing_file(&self, record: &FileRecord) {
        let path = &record.storage_path;
        if !self.paths.contains(path) {
            warn!(
                id = %record.id,
                path = %path.display(),
                "stored path is outside the storage root, leaving it"
            );
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "file removed from disk"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                warn!(path = %path.display(), "file already missing, removing metadata only")
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
        }
    }

    /// Flag the record as viewed. Repeat calls keep the first viewed time.
    pub fn mark_viewed(&self, id: &str) -> DepotResult<()> {
        let now = Utc::now();
        let matched = self
            .index
            .update_where(|r| r.id == id, |r| r.mark_viewed(now))?;
        if !matched {
            return Err(DepotError::NotFound(format!("no file with id {id}")));
        }
        debug!(id, "file marked viewed");
        Ok(())
    }

    /// Count files that still exist, by relative path then date.
    pub fn directory_stats(&self) -> DirectoryStats {
        let mut stats = DirectoryStats::default();
        for record in self.index.load() {
            if !record.storage_path.exists() {
                continue;
            }
            *stats
                .directories
                .entry(record.relative_path)
                .or_default()
                .entry(record.date)
                .or_default() += 1;
            stats.total_files += 1;
        }
        stats
    }

    /// Drop records whose backing file is gone.
    pub fn cleanup(&self, dry_run: bool) -> DepotResult<CleanupReport> {
        let before = self.index.load();
        let missing: Vec<String> = before
            .iter()
            .filter(|r| !r.storage_path.exists())
            .map(|r| r.id.clone())
            .collect();

        if dry_run {
            return Ok(CleanupReport {
                before: before.len(),
                kept: before.len() - missing.len(),
                removed: missing,
                dry_run,
            });
        }

        let (remaining, removed_count) = self.index.remove_where(|r| !r.storage_path.exists())?;
        let kept: HashSet<&str> = remaining.iter().map(|r| r.id.as_str()).collect();
        let removed: Vec<String> = before
            .iter()
            .filter(|r| !kept.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();
        info!(removed = removed_count, kept = remaining.len(), "metadata cleaned up");
        Ok(CleanupReport {
            before: remaining.len() + removed_count,
            kept: remaining.len(),
            removed,
            dry_run,
        })
    }

    /// Summarize a stored archive given its path relative to the root.
    pub fn inspect_archive(&self, logical_path: &str) -> DepotResult<ArchiveSummary> {
        let path = self.archive_path(logical_path)?;
        Ok(archive::inspect(&path))
    }

    /// Unpack a stored archive into the sibling `<stem>_extracted` directory.
    pub fn extract_archive(&self, logical_path: &str) -> DepotResult<ExtractionOutcome> {
        let path = self.archive_path(logical_path)?;
        let filename = file_name_of(&path);
        let parent = path.parent().unwrap_or_else(|| self.root());
        let destination = parent.join(format!("{}_extracted", archive_stem(&filename)));
        if !self.paths.contains(&destination) {
            return Err(DepotError::AccessDenied(format!(
                "{} is outside the storage root",
                destination.display()
            )));
        }

        let tree = archive::extract(&path, Some(&destination))?;
        let extract_dir = self
            .paths
            .relative_to_root(&tree.root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        Ok(ExtractionOutcome {
            extract_dir,
            total_files: tree.total_files,
            files: tree.files,
        })
    }

    fn archive_path(&self, logical_path: &str) -> DepotResult<PathBuf> {
        let path = self.paths.resolve_existing([logical_path])?;
        if !archive::is_archive_name(&file_name_of(&path)) {
            return Err(DepotError::InvalidInput(format!(
                "{logical_path} is not an archive"
            )));
        }
        Ok(path)
    }

    /// Locate a stored file for download.
    pub fn open_stored(&self, logical_path: &str) -> DepotResult<StoredFile> {
        let path = self.paths.resolve_existing([logical_path])?;
        let meta = fs::metadata(&path)
            .map_err(|e| DepotError::io(format!("failed to stat {}", path.display()), e))?;
        if !meta.is_file() {
            return Err(DepotError::NotFound(format!("{logical_path} is not a file")));
        }
        let filename = file_name_of(&path);
        Ok(StoredFile {
            mime_type: preview::guess_mime_type(&filename),
            filename,
            size: meta.len(),
            path,
        })
    }

    /// Render a stored file for in-browser viewing.
    ///
    /// With `fallback_to_download`, files that cannot be previewed come back
    /// as [`Preview::Download`]; otherwise they are `InvalidInput`.
    pub fn preview(&self, logical_path: &str, fallback_to_download: bool) -> DepotResult<Preview> {
        let stored = self.open_stored(logical_path)?;
        match PreviewKind::for_filename(&stored.filename) {
            PreviewKind::Html => {
                let data = self.read_stored(&stored)?;
                Ok(Preview::Html(String::from_utf8_lossy(&data).into_owned()))
            }
            PreviewKind::Text => {
                let data = self.read_stored(&stored)?;
                Ok(Preview::Html(preview::render_text_page(&stored.filename, &data)))
            }
            PreviewKind::Archive if !fallback_to_download => Ok(Preview::Archive {
                summary: archive::inspect(&stored.path),
                filename: stored.filename,
            }),
            _ if fallback_to_download => Ok(Preview::Download(stored)),
            _ => Err(DepotError::InvalidInput(format!(
                "{} is not supported for preview",
                stored.filename
            ))),
        }
    }

    fn read_stored(&self, stored: &StoredFile) -> DepotResult<Vec<u8>> {
        fs::read(&stored.path)
            .map_err(|e| DepotError::io(format!("failed to read {}", stored.path.display()), e))
    }

    fn check_extension(&self, filename: &str) -> DepotResult<()> {
        let allowed = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .is_some_and(|ext| self.options.allowed_extensions.contains(&ext));
        if allowed {
            Ok(())
        } else {
            Err(DepotError::InvalidInput(format!(
                "file type not allowed: {filename}"
            )))
        }
    }
}

/// Reduce an uploaded name to a single safe path component: separators and
/// whitespace become `_`, anything but alphanumerics, `.`, `-` and `_` is
/// dropped, and leading/trailing dots and underscores are trimmed.
pub fn sanitize_filename(raw: &str) -> String {
    let joined = raw
        .split(|c: char| c == '/' || c == '\\' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

fn validate_date(raw: &str) -> DepotResult<String> {
    let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| DepotError::InvalidInput(format!("date must be YYYY-MM-DD, got {raw:?}")))?;
    let canonical = parsed.format("%Y-%m-%d").to_string();
    if canonical != raw {
        return Err(DepotError::InvalidInput(format!(
            "date must be YYYY-MM-DD, got {raw:?}"
        )));
    }
    Ok(canonical)
}

fn is_new(record: &FileRecord, now: DateTime<Utc>, window: TimeDelta) -> bool {
    !record.viewed && record.upload_time > now - window
}

fn sort_listed(files: &mut [ListedFile], key: SortKey, order: SortOrder) {
    let compare = |a: &ListedFile, b: &ListedFile| -> Ordering {
        let (a, b) = (&a.record, &b.record);
        match key {
            SortKey::UploadTime => a.upload_time.cmp(&b.upload_time),
            SortKey::Filename => a.filename.to_lowercase().cmp(&b.filename.to_lowercase()),
            SortKey::FileSize => a.file_size.cmp(&b.file_size),
            SortKey::Date => a.date.cmp(&b.date),
        }
    };
    match order {
        SortOrder::Asc => files.sort_by(compare),
        SortOrder::Desc => files.sort_by(|a, b| compare(b, a)),
    }
}

pub(crate) fn paginate(total: usize, page: usize, page_size: usize) -> Pagination {
    let total_pages = total.div_ceil(page_size);
    Pagination {
        page,
        page_size,
        total_pages,
        has_next: page < total_pages,
        has_prev: page > 1,
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn archive_stem(filename: &str) -> &str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") {
        return &filename[..filename.len() - ".tar.gz".len()];
    }
    filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename)
}
