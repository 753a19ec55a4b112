//! ZIP archive output for converted files

use std::collections::HashSet;
use std::io::{Cursor, Seek, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;

/// Which ready files go into an archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Selection {
    /// Every ready file
    #[default]
    All,
    /// Only ready files the user selected
    SelectedOnly,
}

/// One file in the archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub contents: Arc<str>,
}

impl ArchiveEntry {
    /// Entry for a converted file, placed under its folder's directory
    pub fn for_file(folder_name: &str, path_in_folder: &str, svg: Arc<str>) -> Self {
        Self {
            path: format!("{}/{}", folder_name, svg_file_name(path_in_folder)),
            contents: svg,
        }
    }
}

/// Rewrite the extension of a folder-relative path to `.svg`
pub fn svg_file_name(path: &str) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };

    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };

    match dir {
        Some(dir) => format!("{}/{}.svg", dir, stem),
        None => format!("{}.svg", stem),
    }
}

/// Give repeated paths a numeric suffix (`logo.svg`, `logo-1.svg`, ...).
///
/// The first entry keeps its path. `logo.png` and `logo.jpg` in one folder
/// both map to `logo.svg`, and ZIP rejects duplicate names.
pub fn dedupe_paths(entries: &mut [ArchiveEntry]) {
    let mut taken = HashSet::with_capacity(entries.len());

    for entry in entries.iter_mut() {
        if taken.insert(entry.path.clone()) {
            continue;
        }

        let stem = entry
            .path
            .strip_suffix(".svg")
            .unwrap_or(&entry.path)
            .to_string();
        let unique = (1..)
            .map(|n| format!("{}-{}.svg", stem, n))
            .find(|candidate| !taken.contains(candidate))
            .unwrap_or_else(|| format!("{}-dup.svg", stem));

        taken.insert(unique.clone());
        entry.path = unique;
    }
}

/// Write `entries` in order as a deflated ZIP archive
pub fn write_zip<W: Write + Seek>(writer: W, entries: &[ArchiveEntry]) -> Result<W> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in entries {
        zip.start_file(entry.path.as_str(), options)?;
        zip.write_all(entry.contents.as_bytes())?;
    }

    Ok(zip.finish()?)
}

/// Build the archive in memory
pub fn zip_bytes(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    Ok(write_zip(Cursor::new(Vec::new()), entries)?.into_inner())
}

/// Write the archive to `path`, returning the number of entries written
pub async fn save_zip(path: &Path, entries: &[ArchiveEntry]) -> Result<usize> {
    let bytes = zip_bytes(entries)?;
    tokio::fs::write(path, bytes).await?;

    info!("Wrote {} SVG files to {}", entries.len(), path.display());
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_svg_file_name() {
        assert_eq!(svg_file_name("logo.png"), "logo.svg");
        assert_eq!(svg_file_name("nested/photo.final.jpeg"), "nested/photo.final.svg");
        assert_eq!(svg_file_name("README"), "README.svg");
        assert_eq!(svg_file_name(".hidden"), ".hidden.svg");
    }

    #[test]
    fn test_entry_path() {
        let entry = ArchiveEntry::for_file("icons", "small/a.jpg", Arc::from("<svg/>"));
        assert_eq!(entry.path, "icons/small/a.svg");
    }

    #[test]
    fn test_zip_preserves_order_and_contents() {
        let entries = vec![
            ArchiveEntry::for_file("b", "2.png", Arc::from("<svg id=\"2\"/>")),
            ArchiveEntry::for_file("a", "1.png", Arc::from("<svg id=\"1\"/>")),
        ];

        let bytes = zip_bytes(&entries).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let names: Vec<_> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"b/2.svg".to_string()));
        assert_eq!(archive.by_index(0).unwrap().name(), "b/2.svg");

        let mut contents = String::new();
        archive
            .by_name("a/1.svg")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "<svg id=\"1\"/>");
    }

    #[test]
    fn test_shared_stems_get_distinct_paths() {
        let mut entries = vec![
            ArchiveEntry::for_file("d", "logo.png", Arc::from("<svg id=\"png\"/>")),
            ArchiveEntry::for_file("d", "logo.jpg", Arc::from("<svg id=\"jpg\"/>")),
            ArchiveEntry::for_file("d", "logo-1.jpeg", Arc::from("<svg/>")),
            ArchiveEntry::for_file("d", "other.png", Arc::from("<svg/>")),
        ];
        dedupe_paths(&mut entries);

        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["d/logo.svg", "d/logo-1.svg", "d/logo-1-1.svg", "d/other.svg"]);

        let bytes = zip_bytes(&entries).unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 4);
    }

    #[tokio::test]
    async fn test_save_zip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.zip");
        let entries = vec![ArchiveEntry::for_file("f", "x.png", Arc::from("<svg/>"))];

        assert_eq!(save_zip(&path, &entries).await.unwrap(), 1);
        assert!(path.exists());
    }
}
