//! Document loaders.
//!
//! A [`Loader`] turns some external collection into [`Document`]s for
//! [`IndexManager::sync`](crate::index::IndexManager::sync). Loaders for
//! mail, calendar, and cloud drives plug in behind the same trait; the
//! filesystem loader ships with the crate.
//!
//! # Filesystem Loader
//!
//! Walks `root` recursively, keeping files that match `include_globs` and
//! none of `exclude_globs` (plus built-in excludes for `.git`, `target`,
//! and `node_modules`). Paths are matched relative to the root.
//!
//! Each file becomes a `local_file` document with id
//! `local_file:<relative path>`, a `file://` URL, and metadata `name`,
//! `extension`, `size_bytes`, and `modified_time`. Files that are not
//! valid UTF-8 are skipped with a warning.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use memex_core::models::{Document, MetaValue, SourceKind};

use crate::config::FilesystemLoaderConfig;

pub trait Loader: Send + Sync {
    /// The source kind of every document this loader yields.
    fn source(&self) -> SourceKind;

    /// Load the current document set, sorted by id.
    fn load(&self) -> Result<Vec<Document>>;
}

pub struct FilesystemLoader {
    config: FilesystemLoaderConfig,
}

impl FilesystemLoader {
    pub fn new(config: FilesystemLoaderConfig) -> Self {
        Self { config }
    }
}

impl Loader for FilesystemLoader {
    fn source(&self) -> SourceKind {
        SourceKind::LocalFile
    }

    fn load(&self) -> Result<Vec<Document>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!("Filesystem loader root does not exist: {}", root.display());
        }

        let include_set = build_globset(&self.config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(self.config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        let mut docs = Vec::new();

        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }

            match file_to_document(path, &rel_str) {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => warn!(path = %path.display(), "skipping file that is not valid UTF-8"),
                Err(e) => return Err(e),
            }
        }

        docs.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(root = %root.display(), count = docs.len(), "loaded files");
        Ok(docs)
    }
}

fn file_to_document(path: &Path, relative_path: &str) -> Result<Option<Document>> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let Ok(content) = String::from_utf8(bytes) else {
        return Ok(None);
    };

    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    let doc = Document::new(
        format!("local_file:{}", relative_path),
        SourceKind::LocalFile,
        relative_path,
        content,
    )
    .with_url(format!("file://{}", absolute.display()))
    .with_updated_at(modified)
    .with_metadata("name", name)
    .with_metadata("extension", extension)
    .with_metadata("size_bytes", MetaValue::Int(metadata.len() as i64))
    .with_metadata("modified_time", modified.to_rfc3339());

    Ok(Some(doc))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn loader(root: &Path, exclude: Vec<String>) -> FilesystemLoader {
        FilesystemLoader::new(FilesystemLoaderConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".into(), "**/*.txt".into()],
            exclude_globs: exclude,
            follow_symlinks: false,
        })
    }

    #[test]
    fn test_loads_matching_files_sorted() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("notes/drafts")).unwrap();
        fs::write(tmp.path().join("b.md"), "# B").unwrap();
        fs::write(tmp.path().join("notes/a.txt"), "alpha").unwrap();
        fs::write(tmp.path().join("notes/drafts/c.md"), "draft").unwrap();
        fs::write(tmp.path().join("image.png"), [0u8, 159, 146, 150]).unwrap();

        let docs = loader(tmp.path(), vec!["**/drafts/**".into()]).load().unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["local_file:b.md", "local_file:notes/a.txt"]);

        let a = &docs[1];
        assert_eq!(a.source, SourceKind::LocalFile);
        assert_eq!(a.source_id, "notes/a.txt");
        assert_eq!(a.content, "alpha");
        assert!(a.url.as_deref().unwrap().starts_with("file://"));
        assert_eq!(a.metadata["name"], MetaValue::Text("a.txt".into()));
        assert_eq!(a.metadata["extension"], MetaValue::Text("txt".into()));
        assert_eq!(a.metadata["size_bytes"], MetaValue::Int(5));
    }

    #[test]
    fn test_skips_invalid_utf8() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("bad.txt"), [0xffu8, 0xfe, 0xfd]).unwrap();
        fs::write(tmp.path().join("good.txt"), "ok").unwrap();
        let docs = loader(tmp.path(), Vec::new()).load().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "local_file:good.txt");
    }

    #[test]
    fn test_missing_root_is_error() {
        let tmp = TempDir::new().unwrap();
        let result = loader(&tmp.path().join("missing"), Vec::new()).load();
        assert!(result.is_err());
    }

    #[test]
    fn test_content_hash_stable_across_loads() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "same").unwrap();
        let first = loader(tmp.path(), Vec::new()).load().unwrap();
        let second = loader(tmp.path(), Vec::new()).load().unwrap();
        assert_eq!(first[0].content_hash, second[0].content_hash);
    }
}
