//! Upload intake: content sniffing, folder limits and folder naming

use std::path::{Component, Path};
use std::sync::Arc;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LimitsConfig;
use crate::error::{Result, SvgBatchError};
use crate::processing::decode::{detect_format, SourceFormat};

/// A raw file handed over by the front end
#[derive(Debug, Clone)]
pub struct IncomingFile {
    /// File name as shown to the user
    pub name: String,
    /// Path relative to the uploaded directory, top-level directory included
    pub relative_path: Option<String>,
    pub data: Vec<u8>,
}

impl IncomingFile {
    pub fn new<S: Into<String>>(name: S, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            relative_path: None,
            data,
        }
    }

    /// Attach a directory-relative path (`photos/2024/a.png`)
    pub fn with_relative_path<S: Into<String>>(mut self, path: S) -> Self {
        self.relative_path = Some(path.into());
        self
    }
}

/// One folder's worth of incoming files
#[derive(Debug, Clone, Default)]
pub struct FolderUpload {
    /// Explicit display name; derived from the files when absent
    pub name: Option<String>,
    pub files: Vec<IncomingFile>,
}

impl FolderUpload {
    pub fn new(files: Vec<IncomingFile>) -> Self {
        Self { name: None, files }
    }

    pub fn named<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A file that passed intake
#[derive(Debug, Clone)]
pub struct AcceptedFile {
    pub name: String,
    /// Path inside the folder, without the folder's own directory
    pub path_in_folder: String,
    pub format: SourceFormat,
    pub data: Arc<[u8]>,
}

/// A file that was turned away, with the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFile {
    pub name: String,
    pub reason: String,
}

/// Outcome of screening one folder upload
#[derive(Debug, Clone)]
pub struct IntakeReport {
    pub folder_name: String,
    pub accepted: Vec<AcceptedFile>,
    pub rejected: Vec<RejectedFile>,
    /// Valid files dropped because the folder was over its limit
    pub truncated: usize,
}

/// Screens uploads against [`LimitsConfig`]
#[derive(Debug, Clone, Default)]
pub struct UploadValidator {
    limits: LimitsConfig,
}

impl UploadValidator {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Check that another folder of `incoming` files fits next to what is held
    pub fn check_capacity(
        &self,
        existing_folders: usize,
        existing_files: usize,
        incoming: usize,
    ) -> Result<()> {
        if existing_folders >= self.limits.max_folders {
            return Err(SvgBatchError::limit(format!(
                "At most {} folders can be queued at once",
                self.limits.max_folders
            )));
        }

        if existing_files + incoming > self.limits.max_total_files {
            return Err(SvgBatchError::limit(format!(
                "Adding {} files would exceed the total limit of {} ({} already queued)",
                incoming, self.limits.max_total_files, existing_files
            )));
        }

        Ok(())
    }

    /// Sniff every file, drop non PNG/JPEG content and cap the folder size.
    ///
    /// `folder_index` is the zero-based slot the folder will occupy and only
    /// feeds the fallback name.
    pub fn screen(&self, upload: FolderUpload, folder_index: usize) -> IntakeReport {
        let folder_name = upload
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| derive_folder_name(&upload.files, folder_index));

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut truncated = 0;

        for file in upload.files {
            let format = match detect_format(&file.data) {
                Ok(format) => format,
                Err(e) => {
                    warn!("Skipping {}: only PNG and JPEG files are accepted", file.name);
                    rejected.push(RejectedFile {
                        name: file.name,
                        reason: e.user_message(),
                    });
                    continue;
                }
            };

            if accepted.len() >= self.limits.max_files_per_folder {
                truncated += 1;
                continue;
            }

            let path_in_folder = file
                .relative_path
                .as_deref()
                .and_then(strip_top_level)
                .unwrap_or_else(|| file.name.clone());

            accepted.push(AcceptedFile {
                name: file.name,
                path_in_folder,
                format,
                data: Arc::from(file.data),
            });
        }

        if truncated > 0 {
            warn!(
                "Folder '{}' holds more than {} images; {} were left out",
                folder_name, self.limits.max_files_per_folder, truncated
            );
        }

        debug!(
            "Screened folder '{}': {} accepted, {} rejected",
            folder_name,
            accepted.len(),
            rejected.len()
        );

        IntakeReport {
            folder_name,
            accepted,
            rejected,
            truncated,
        }
    }
}

/// Display name for a folder: the first component of the first file's
/// relative path, or `Folder N` when there is none
pub fn derive_folder_name(files: &[IncomingFile], folder_index: usize) -> String {
    files
        .first()
        .and_then(|file| file.relative_path.as_deref())
        .and_then(|path| path.split('/').next())
        .filter(|first| !first.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Folder {}", folder_index + 1))
}

fn strip_top_level(relative_path: &str) -> Option<String> {
    let (_, rest) = relative_path.split_once('/')?;
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Read a directory tree into a [`FolderUpload`].
///
/// Relative paths are recorded with the directory's own name as the first
/// component, and files are ordered by path so uploads are reproducible.
pub async fn read_folder(dir: &Path) -> Result<FolderUpload> {
    if !dir.is_dir() {
        return Err(SvgBatchError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Not a directory: {}", dir.display()),
        )));
    }

    let root_name = dir
        .canonicalize()?
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string);

    let mut paths: Vec<_> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let data = tokio::fs::read(&path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut file = IncomingFile::new(name, data);
        if let Some(inner) = relative_components(dir, &path) {
            let relative = match &root_name {
                Some(root) => format!("{}/{}", root, inner),
                None => inner,
            };
            file = file.with_relative_path(relative);
        }
        files.push(file);
    }

    Ok(FolderUpload {
        name: root_name,
        files,
    })
}

fn relative_components(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}
