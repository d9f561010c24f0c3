//! Codebase scanning.

use crate::generation::unit::{HEADER_EXTENSIONS, IMPLEMENTATION_EXTENSIONS};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

const SKIP_DIRS: &[&str] = &["build", "external", "node_modules", ".git"];

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.contains(&ext.as_str()))
}

fn is_source_or_header(path: &Path) -> bool {
    has_extension(path, IMPLEMENTATION_EXTENSIONS) || has_extension(path, HEADER_EXTENSIONS)
}

/// Whether a file at `relative` lies in one of `folders`.
///
/// Only the first path component is compared; "." matches files directly
/// in the root. An empty folder list matches everything.
fn in_scanned_folder(relative: &Path, folders: &[String]) -> bool {
    if folders.is_empty() {
        return true;
    }
    let mut components = relative.components();
    let first = components.next();
    let folder = match (first, components.next()) {
        (Some(_), None) => ".".to_string(),
        (Some(Component::Normal(name)), Some(_)) => name.to_string_lossy().to_string(),
        _ => return false,
    };
    folders.iter().any(|f| f == &folder)
}

/// Read every C/C++ source and header under `dir` in the scanned folders.
///
/// Keys are paths relative to `dir`.
pub fn read_codebase(dir: &Path, folders: &[String]) -> Result<BTreeMap<PathBuf, String>> {
    let mut files = BTreeMap::new();

    if !dir.is_dir() {
        anyhow::bail!("Codebase directory does not exist: {}", dir.display());
    }

    tracing::debug!("Reading codebase {} (folders: {:?})", dir.display(), folders);

    for entry in walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || (!name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref()))
        })
    {
        let entry = entry?;
        let path = entry.path();

        if !path.is_file() || !is_source_or_header(path) {
            continue;
        }

        let relative = path.strip_prefix(dir).unwrap_or(path).to_path_buf();
        if !in_scanned_folder(&relative, folders) {
            continue;
        }

        // Non-UTF-8 bytes (legacy encodings in comments) are replaced, and an
        // unreadable file only costs its own unit
        let content = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!("Skipping unreadable source file {}: {}", path.display(), e);
                continue;
            }
        };
        tracing::debug!("Found file: {} ({} bytes)", relative.display(), content.len());
        files.insert(relative, content);
    }

    tracing::info!("Found {} files in codebase", files.len());
    Ok(files)
}

/// Test files (`*test.cpp`, `*test.cc`) anywhere under `dir`, sorted.
pub fn list_test_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }

    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if entry.file_type().is_file() && (name.ends_with("test.cpp") || name.ends_with("test.cc")) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

/// Implementation files under `dir` that are not themselves tests, sorted.
pub fn list_source_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }

    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if entry.file_type().is_file()
            && has_extension(entry.path(), IMPLEMENTATION_EXTENSIONS)
            && !name.contains("test")
        {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}
