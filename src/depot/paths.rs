use super::error::{DepotError, DepotResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Joins caller-supplied segments onto the storage root and refuses any
/// result that is not the root itself or one of its descendants.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create the root if needed and pin it to its canonical absolute form.
    pub fn new(root: &Path) -> DepotResult<Self> {
        fs::create_dir_all(root).map_err(|e| {
            DepotError::io(format!("failed to create storage root {}", root.display()), e)
        })?;
        let root = root.canonicalize().map_err(|e| {
            DepotError::io(format!("cannot canonicalize {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically join and normalize `segments` under the root.
    ///
    /// `.` is dropped and `..` pops a component. Absolute segments and
    /// traversal past the root both yield `AccessDenied`. No filesystem access.
    pub fn resolve<I, S>(&self, segments: I) -> DepotResult<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        let mut joined = self.root.clone();
        for segment in segments {
            joined.push(segment.as_ref());
        }
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.root) {
            debug!(path = %joined.display(), "rejected path outside storage root");
            return Err(DepotError::AccessDenied(format!(
                "{} is outside the storage root",
                joined.display()
            )));
        }
        Ok(normalized)
    }

    /// Resolve a path that must already exist, following symlinks.
    pub fn resolve_existing<I, S>(&self, segments: I) -> DepotResult<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        let lexical = self.resolve(segments)?;
        if !lexical.exists() {
            return Err(DepotError::NotFound(format!(
                "{} does not exist",
                self.display_relative(&lexical)
            )));
        }
        let canonical = lexical.canonicalize().map_err(|e| {
            DepotError::io(format!("cannot canonicalize {}", lexical.display()), e)
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(DepotError::AccessDenied(format!(
                "{} links outside the storage root",
                self.display_relative(&lexical)
            )));
        }
        Ok(canonical)
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.is_absolute() && normalize(path).starts_with(&self.root)
    }

    /// Path of `path` relative to the root, if it is contained.
    pub fn relative_to_root(&self, path: &Path) -> Option<PathBuf> {
        normalize(path)
            .strip_prefix(&self.root)
            .ok()
            .map(Path::to_path_buf)
    }

    fn display_relative(&self, path: &Path) -> String {
        self.relative_to_root(path)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| path.display().to_string())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
