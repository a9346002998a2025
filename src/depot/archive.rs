//! Archive inspection and extraction.
//!
//! Three codecs are understood: zip folders, single-volume rar archives and
//! gzip-compressed tarballs.
//! Inspection is best-effort and never fails; extraction reports typed errors.

use super::error::{DepotError, DepotResult};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// How many entry names a summary lists before setting `has_more`.
pub const SUMMARY_NAME_LIMIT: usize = 10;

/// Extensions treated as archives for upload responses and previews. Only
/// some of them have a codec; the rest inspect as `unknown`.
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "tgz", "bz2", "xz"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
    TarGz,
}

impl ArchiveKind {
    /// Codec for `path`, judged by extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".rar") {
            Some(Self::Rar)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Rar => "rar",
            Self::TarGz => "tar.gz",
        }
    }
}

/// Whether `filename` carries one of the archive extensions.
pub fn is_archive_name(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => ARCHIVE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// What was learned about an archive without unpacking it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    /// Codec label, `unknown`, or `error`.
    #[serde(rename = "type")]
    pub kind: String,
    pub file_count: usize,
    pub total_size: u64,
    pub file_list: Vec<String>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArchiveSummary {
    pub fn unknown() -> Self {
        Self::empty("unknown", None)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::empty("error", Some(message.into()))
    }

    fn empty(kind: &str, error: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            file_count: 0,
            total_size: 0,
            file_list: Vec::new(),
            has_more: false,
            error,
        }
    }

    fn from_entries(kind: ArchiveKind, entries: Vec<ArchiveEntry>) -> Self {
        let file_count = entries.len();
        let total_size = entries
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.size));
        let file_list = entries
            .into_iter()
            .take(SUMMARY_NAME_LIMIT)
            .map(|e| e.name)
            .collect();
        Self {
            kind: kind.label().to_string(),
            file_count,
            total_size,
            file_list,
            has_more: file_count > SUMMARY_NAME_LIMIT,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

struct ArchiveEntry {
    name: String,
    size: u64,
}

/// Summarize the archive at `path`. Codec failures come back as an
/// `error`-typed summary rather than an `Err`.
pub fn inspect(path: &Path) -> ArchiveSummary {
    let Some(kind) = ArchiveKind::from_path(path) else {
        return ArchiveSummary::unknown();
    };
    match list_entries(kind, path) {
        Ok(entries) => ArchiveSummary::from_entries(kind, entries),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "archive inspection failed");
            ArchiveSummary::failed(e.to_string())
        }
    }
}

fn list_entries(kind: ArchiveKind, path: &Path) -> DepotResult<Vec<ArchiveEntry>> {
    match kind {
        ArchiveKind::Zip => {
            let mut archive = zip::ZipArchive::new(open_archive(path)?)?;
            let mut entries = Vec::with_capacity(archive.len());
            for i in 0..archive.len() {
                let entry = archive.by_index_raw(i)?;
                entries.push(ArchiveEntry {
                    name: entry.name().to_string(),
                    size: entry.size(),
                });
            }
            Ok(entries)
        }
        ArchiveKind::Rar => {
            let mut entries = Vec::new();
            for header in unrar::Archive::new(path).open_for_listing()? {
                let header = header?;
                entries.push(ArchiveEntry {
                    name: header.filename.to_string_lossy().into_owned(),
                    size: header.unpacked_size,
                });
            }
            Ok(entries)
        }
        ArchiveKind::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(open_archive(path)?));
            let mut entries = Vec::new();
            for entry in archive.entries().map_err(codec)? {
                let entry = entry.map_err(codec)?;
                let name = entry.path().map_err(codec)?.to_string_lossy().into_owned();
                let size = entry.header().size().map_err(codec)?;
                entries.push(ArchiveEntry { name, size });
            }
            Ok(entries)
        }
    }
}

fn open_archive(path: &Path) -> DepotResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| DepotError::io(format!("failed to open {}", path.display()), e))
}

fn codec(err: std::io::Error) -> DepotError {
    DepotError::Codec(err.to_string())
}

/// One regular file found after extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedFile {
    pub name: String,
    /// Relative to the extraction directory, `/`-separated.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedTree {
    pub root: PathBuf,
    pub files: Vec<ExtractedFile>,
    pub total_files: usize,
}

/// Unpack the archive at `path` into `destination`, or into a fresh kept
/// temporary directory when none is given.
///
/// An existing destination is removed first. That removal and the unpack
/// that follows are not atomic: a reader of the old tree can see it vanish.
pub fn extract(path: &Path, destination: Option<&Path>) -> DepotResult<ExtractedTree> {
    let kind = ArchiveKind::from_path(path).ok_or_else(|| {
        DepotError::Codec(format!("unsupported archive type: {}", path.display()))
    })?;

    let root = match destination {
        Some(dest) => {
            if dest.exists() {
                fs::remove_dir_all(dest).map_err(|e| {
                    DepotError::io(format!("failed to clear {}", dest.display()), e)
                })?;
            }
            fs::create_dir_all(dest).map_err(|e| {
                DepotError::io(format!("failed to create {}", dest.display()), e)
            })?;
            dest.to_path_buf()
        }
        None => tempfile::Builder::new()
            .prefix("filedock-extract-")
            .tempdir()
            .map_err(|e| DepotError::io("failed to create temporary directory", e))?
            .keep(),
    };

    unpack(kind, path, &root)?;

    let files = walk_extracted(&root)?;
    info!(
        archive = %path.display(),
        destination = %root.display(),
        files = files.len(),
        "archive extracted"
    );
    Ok(ExtractedTree {
        total_files: files.len(),
        root,
        files,
    })
}

fn unpack(kind: ArchiveKind, path: &Path, dest: &Path) -> DepotResult<()> {
    match kind {
        ArchiveKind::Zip => {
            let mut archive = zip::ZipArchive::new(open_archive(path)?)?;
            archive.extract(dest)?;
        }
        ArchiveKind::Rar => {
            let mut archive = unrar::Archive::new(path).open_for_processing()?;
            while let Some(header) = archive.read_header()? {
                archive = if header.entry().is_file() {
                    header.extract_with_base(dest)?
                } else {
                    header.skip()?
                };
            }
        }
        ArchiveKind::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(open_archive(path)?));
            archive.unpack(dest).map_err(codec)?;
        }
    }
    Ok(())
}

fn walk_extracted(root: &Path) -> DepotResult<Vec<ExtractedFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            DepotError::io(format!("failed to walk {}", root.display()), e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| {
                DepotError::io(format!("failed to stat {}", entry.path().display()), e.into())
            })?
            .len();
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        files.push(ExtractedFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: to_slash(relative),
            size,
        });
    }
    Ok(files)
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    pub fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{write_tar_gz, write_zip};
    use super::*;
    use tempfile::TempDir;

    fn numbered(n: usize) -> Vec<(String, Vec<u8>)> {
        (0..n)
            .map(|i| (format!("file_{i:02}.txt"), vec![b'x'; i + 1]))
            .collect()
    }

    fn as_refs(entries: &[(String, Vec<u8>)]) -> Vec<(&str, &[u8])> {
        entries
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect()
    }

    #[test]
    fn zip_with_fifteen_entries_lists_ten() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.zip");
        let entries = numbered(15);
        write_zip(&path, &as_refs(&entries));

        let summary = inspect(&path);
        assert_eq!(summary.kind, "zip");
        assert_eq!(summary.file_count, 15);
        assert_eq!(summary.file_list.len(), 10);
        assert_eq!(summary.file_list[0], "file_00.txt");
        assert!(summary.has_more);
        assert_eq!(summary.total_size, (1..=15).sum::<u64>());
    }

    #[test]
    fn tarball_with_three_entries_lists_all() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs.tar.gz");
        let entries = numbered(3);
        write_tar_gz(&path, &as_refs(&entries));

        let summary = inspect(&path);
        assert_eq!(summary.kind, "tar.gz");
        assert_eq!(summary.file_count, 3);
        assert_eq!(summary.file_list, vec!["file_00.txt", "file_01.txt", "file_02.txt"]);
        assert!(!summary.has_more);
        assert_eq!(summary.total_size, 6);
    }

    fn rar_fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn rar_with_fifteen_entries_lists_ten() {
        let summary = inspect(&rar_fixture("fifteen.rar"));
        assert_eq!(summary.kind, "rar");
        assert_eq!(summary.file_count, 15);
        assert_eq!(summary.file_list.len(), 10);
        assert_eq!(summary.file_list[9], "file_09.txt");
        assert!(summary.has_more);
        assert_eq!(summary.total_size, (1..=15).sum::<u64>());
    }

    #[test]
    fn rar_with_three_entries_lists_all() {
        let summary = inspect(&rar_fixture("three.rar"));
        assert_eq!(summary.kind, "rar");
        assert_eq!(summary.file_count, 3);
        assert_eq!(summary.file_list, vec!["file_00.txt", "file_01.txt", "file_02.txt"]);
        assert!(!summary.has_more);
        assert_eq!(summary.total_size, 6);
    }

    #[test]
    fn rar_extracts_every_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("three_extracted");

        let tree = extract(&rar_fixture("three.rar"), Some(&dest)).unwrap();
        assert_eq!(tree.total_files, 3);
        assert_eq!(tree.files[2].path, "file_02.txt");
        assert_eq!(tree.files[2].size, 3);
        assert_eq!(std::fs::read(dest.join("file_01.txt")).unwrap(), b"xx");
    }

    #[test]
    fn unsupported_extension_is_unknown_not_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("thing.7z");
        std::fs::write(&path, b"7z").unwrap();

        let summary = inspect(&path);
        assert_eq!(summary, ArchiveSummary::unknown());
    }

    #[test]
    fn oversized_entry_sizes_saturate() {
        let entries = vec![
            ArchiveEntry {
                name: "a".into(),
                size: u64::MAX,
            },
            ArchiveEntry {
                name: "b".into(),
                size: 7,
            },
        ];
        let summary = ArchiveSummary::from_entries(ArchiveKind::Zip, entries);
        assert_eq!(summary.total_size, u64::MAX);
        assert_eq!(summary.file_count, 2);
    }

    #[test]
    fn corrupt_container_yields_error_summary() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.zip");
        std::fs::write(&path, b"definitely not a zip").unwrap();

        let summary = inspect(&path);
        assert_eq!(summary.kind, "error");
        assert!(summary.is_error());
        assert_eq!(summary.file_count, 0);
        assert!(summary.file_list.is_empty());
    }

    #[test]
    fn extract_replaces_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("site.zip");
        write_zip(&path, &[("index.html", b"<h1>hi</h1>"), ("css/app.css", b"body{}")]);

        let dest = tmp.path().join("site_extracted");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), b"old").unwrap();

        let tree = extract(&path, Some(&dest)).unwrap();
        assert_eq!(tree.total_files, 2);
        let paths: Vec<_> = tree.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["css/app.css", "index.html"]);
        assert!(!dest.join("stale.txt").exists());
        assert_eq!(tree.files[1].size, 11);
    }

    #[test]
    fn extract_without_destination_uses_temp_dir() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.tgz");
        write_tar_gz(&path, &[("nested/readme.txt", b"hello")]);

        let tree = extract(&path, None).unwrap();
        assert_eq!(tree.files.len(), 1);
        assert_eq!(tree.files[0].path, "nested/readme.txt");
        assert_eq!(tree.files[0].name, "readme.txt");
        std::fs::remove_dir_all(&tree.root).unwrap();
    }

    #[test]
    fn extract_unsupported_codec_is_hard_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("thing.7z");
        std::fs::write(&path, b"7z").unwrap();

        let err = extract(&path, Some(&tmp.path().join("out"))).unwrap_err();
        assert!(matches!(err, DepotError::Codec(_)));
    }

    #[test]
    fn extract_corrupt_containers_is_codec_error() {
        let tmp = TempDir::new().unwrap();
        for name in ["broken.zip", "broken.tgz", "broken.rar"] {
            let path = tmp.path().join(name);
            std::fs::write(&path, b"definitely not an archive").unwrap();

            let err = extract(&path, Some(&tmp.path().join("out"))).unwrap_err();
            assert!(matches!(err, DepotError::Codec(_)), "{name}: {err:?}");
        }
    }

    #[test]
    fn archive_names() {
        assert!(is_archive_name("a.ZIP"));
        assert!(is_archive_name("a.tar.gz"));
        assert!(is_archive_name("a.rar"));
        assert!(!is_archive_name("a.txt"));
        assert!(!is_archive_name("zip"));
    }
}
