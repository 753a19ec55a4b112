//! Versioned batch state store
//!
//! All folder and file state lives behind one lock and is only changed
//! through the commands on [`StateStore`]. Readers take [`StateSnapshot`]s;
//! every mutation bumps a version that observers can wait on.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ConversionMode, LimitsConfig};
use crate::error::{Result, SvgBatchError};
use crate::parallel::progress::{eta_seconds, throughput};
use crate::processing::{
    dedupe_paths, ArchiveEntry, ConvertedSvg, FolderUpload, IntakeReport, RejectedFile, Selection,
    SourceFormat, UploadValidator,
};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(FileId);
id_type!(FolderId);

/// Conversion status of a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Queued,
    Processing,
    Ready,
    Error,
}

/// Status of a folder as a whole
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStatus {
    #[default]
    Idle,
    Converting,
    Paused,
    Completed,
}

/// SVG markup produced for a file
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    svg: Arc<str>,
}

impl ConversionOutput {
    pub fn new(svg: String) -> Self {
        Self { svg: Arc::from(svg) }
    }

    pub fn svg(&self) -> &str {
        &self.svg
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.svg.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.svg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.svg.is_empty()
    }

    pub(crate) fn shared(&self) -> Arc<str> {
        Arc::clone(&self.svg)
    }
}

/// A file inside a folder
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub id: FileId,
    pub name: String,
    /// Path inside the folder, used for archive layout
    pub path_in_folder: String,
    pub format: SourceFormat,
    /// Original bytes; released once the file converts
    pub source: Option<Arc<[u8]>>,
    pub status: FileStatus,
    pub mode: ConversionMode,
    pub result: Option<ConversionOutput>,
    pub error: Option<String>,
    pub conversion_time: Option<Duration>,
    pub selected: bool,
}

impl UploadedFile {
    pub fn new<N: Into<String>, P: Into<String>>(
        name: N,
        path_in_folder: P,
        format: SourceFormat,
        source: Arc<[u8]>,
        mode: ConversionMode,
    ) -> Self {
        Self {
            id: FileId::new(),
            name: name.into(),
            path_in_folder: path_in_folder.into(),
            format,
            source: Some(source),
            status: FileStatus::Queued,
            mode,
            result: None,
            error: None,
            conversion_time: None,
            selected: false,
        }
    }
}

/// Per-folder counters and live rates
#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderStats {
    pub total_files: usize,
    pub converted: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    /// Images per second after the last wave
    pub speed: f64,
    /// Only meaningful while converting
    pub eta_seconds: Option<u64>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl FolderStats {
    /// Time since the folder's current run began
    pub fn elapsed(&self) -> Duration {
        self.started.map(|start| start.elapsed()).unwrap_or_default()
    }
}

/// A folder of files converted together
#[derive(Debug, Clone)]
pub struct FolderData {
    pub id: FolderId,
    pub name: String,
    /// Upload order
    pub files: Vec<UploadedFile>,
    pub status: FolderStatus,
    pub stats: FolderStats,
}

impl FolderData {
    fn from_report(report: IntakeReport, mode: ConversionMode) -> Self {
        let files: Vec<_> = report
            .accepted
            .into_iter()
            .map(|file| UploadedFile::new(file.name, file.path_in_folder, file.format, file.data, mode))
            .collect();

        Self {
            id: FolderId::new(),
            name: report.folder_name,
            stats: FolderStats {
                total_files: files.len(),
                ..FolderStats::default()
            },
            files,
            status: FolderStatus::Idle,
        }
    }

    pub fn file(&self, id: FileId) -> Option<&UploadedFile> {
        self.files.iter().find(|file| file.id == id)
    }

    fn file_mut(&mut self, id: FileId) -> Option<&mut UploadedFile> {
        self.files.iter_mut().find(|file| file.id == id)
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|file| file.status == status).count()
    }

    pub fn has_queued(&self) -> bool {
        self.files.iter().any(|file| file.status == FileStatus::Queued)
    }
}

/// Run-wide statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub total_folders: usize,
    pub total_files: usize,
    pub converted: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub average_speed: f64,
    pub elapsed: Duration,
}

/// Result of [`StateStore::add_folder`]
#[derive(Debug, Clone)]
pub struct AddFolderReport {
    pub folder: FolderId,
    pub name: String,
    pub accepted: usize,
    pub rejected: Vec<RejectedFile>,
    pub truncated: usize,
}

/// What the scheduler needs to convert one file
#[derive(Debug, Clone)]
pub struct FileJob {
    pub file: FileId,
    pub name: String,
    pub mode: ConversionMode,
}

/// Outcome recorded by [`StateStore::apply_outcome`]
#[derive(Debug, Clone)]
pub struct AppliedOutcome {
    pub name: String,
    pub error: Option<String>,
}

/// Point-in-time copy of the whole state
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub version: u64,
    pub folders: Vec<FolderData>,
    pub global: GlobalStats,
}

impl StateSnapshot {
    pub fn folder(&self, id: FolderId) -> Option<&FolderData> {
        self.folders.iter().find(|folder| folder.id == id)
    }

    pub fn total_files(&self) -> usize {
        self.folders.iter().map(|folder| folder.files.len()).sum()
    }

    /// Archive entries for ready files, in folder then upload order.
    ///
    /// Paths are unique within the returned set.
    pub fn archive_entries(&self, selection: Selection, folder: Option<FolderId>) -> Vec<ArchiveEntry> {
        let mut entries: Vec<_> = self
            .folders
            .iter()
            .filter(|data| folder.map_or(true, |id| data.id == id))
            .flat_map(|data| {
                data.files.iter().filter_map(move |file| {
                    if selection == Selection::SelectedOnly && !file.selected {
                        return None;
                    }
                    match (&file.status, &file.result) {
                        (FileStatus::Ready, Some(output)) => Some(ArchiveEntry::for_file(
                            &data.name,
                            &file.path_in_folder,
                            output.shared(),
                        )),
                        _ => None,
                    }
                })
            })
            .collect();

        dedupe_paths(&mut entries);
        entries
    }
}

#[derive(Debug, Default)]
struct BatchState {
    folders: Vec<FolderData>,
    global: GlobalStats,
    run_started: Option<Instant>,
}

impl BatchState {
    fn folder_mut(&mut self, id: FolderId) -> Result<&mut FolderData> {
        self.folders
            .iter_mut()
            .find(|folder| folder.id == id)
            .ok_or_else(|| SvgBatchError::unknown_folder(id))
    }

    fn refresh_global(&mut self) {
        self.global.total_folders = self.folders.len();
        self.global.total_files = self.folders.iter().map(|f| f.files.len()).sum();
        self.global.converted = self.folders.iter().map(|f| f.stats.converted).sum();
        self.global.failed = self.folders.iter().map(|f| f.stats.failed).sum();
    }
}

/// `name`, or `name (2)`, `name (3)`, ... when a folder already uses it
fn unique_folder_name(folders: &[FolderData], name: &str) -> String {
    let taken = |candidate: &str| folders.iter().any(|folder| folder.name == candidate);
    if !taken(name) {
        return name.to_string();
    }

    (2..)
        .map(|n| format!("{} ({})", name, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// Single-writer owner of all batch state
pub struct StateStore {
    state: RwLock<BatchState>,
    version: watch::Sender<u64>,
    validator: UploadValidator,
}

impl StateStore {
    pub fn new(limits: LimitsConfig) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: RwLock::new(BatchState::default()),
            version,
            validator: UploadValidator::new(limits),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        self.validator.limits()
    }

    fn read(&self) -> RwLockReadGuard<'_, BatchState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the write lock; callers must bump the version after mutating
    fn write(&self) -> RwLockWriteGuard<'_, BatchState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    /// Current version
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Observe version changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.read();
        StateSnapshot {
            version: self.version(),
            folders: state.folders.clone(),
            global: state.global.clone(),
        }
    }

    /// Screen an upload and append it as a new folder
    pub fn add_folder(&self, upload: FolderUpload, mode: ConversionMode) -> Result<AddFolderReport> {
        let report = {
            let mut state = self.write();
            let index = state.folders.len();
            let held: usize = state.folders.iter().map(|f| f.files.len()).sum();

            let mut report = self.validator.screen(upload, index);
            report.folder_name = unique_folder_name(&state.folders, &report.folder_name);
            if report.accepted.is_empty() {
                return Err(SvgBatchError::limit(format!(
                    "Folder '{}' contains no PNG or JPEG images",
                    report.folder_name
                )));
            }
            self.validator
                .check_capacity(index, held, report.accepted.len())?;

            let rejected = report.rejected.clone();
            let truncated = report.truncated;
            let folder = FolderData::from_report(report, mode);

            let summary = AddFolderReport {
                folder: folder.id,
                name: folder.name.clone(),
                accepted: folder.files.len(),
                rejected,
                truncated,
            };
            state.folders.push(folder);
            state.refresh_global();
            summary
        };

        self.bump();
        info!("Added folder '{}' with {} files", report.name, report.accepted);
        Ok(report)
    }

    /// Drop a folder and release its file blobs.
    ///
    /// Refused while a run is active.
    pub fn remove_folder(&self, id: FolderId) -> Result<()> {
        {
            let mut state = self.write();
            if state.run_started.is_some() {
                return Err(SvgBatchError::AlreadyRunning);
            }
            let index = state
                .folders
                .iter()
                .position(|folder| folder.id == id)
                .ok_or_else(|| SvgBatchError::unknown_folder(id))?;
            let folder = state.folders.remove(index);
            debug!("Removed folder '{}' ({} files)", folder.name, folder.files.len());
            state.refresh_global();
        }
        self.bump();
        Ok(())
    }

    /// Remove every folder and reset run statistics.
    ///
    /// Refused while a run is active.
    pub fn clear_all(&self) -> Result<()> {
        {
            let mut state = self.write();
            if state.run_started.is_some() {
                return Err(SvgBatchError::AlreadyRunning);
            }
            *state = BatchState::default();
        }
        self.bump();
        Ok(())
    }

    /// Return failed files to the queue; `None` retries every folder.
    ///
    /// Resets each touched folder's failure counter. Ready files are left
    /// alone. Returns the number of files requeued.
    pub fn retry_failed(&self, folder: Option<FolderId>) -> Result<usize> {
        let requeued = {
            let mut state = self.write();
            if let Some(id) = folder {
                state.folder_mut(id)?;
            }

            let mut requeued = 0;
            for data in state
                .folders
                .iter_mut()
                .filter(|data| folder.map_or(true, |id| data.id == id))
            {
                let mut in_folder = 0;
                for file in data.files.iter_mut().filter(|f| f.status == FileStatus::Error) {
                    file.status = FileStatus::Queued;
                    file.error = None;
                    file.conversion_time = None;
                    in_folder += 1;
                }
                data.stats.failed = 0;
                if in_folder > 0 && data.status == FolderStatus::Completed {
                    data.status = FolderStatus::Idle;
                }
                requeued += in_folder;
            }
            state.refresh_global();
            requeued
        };

        self.bump();
        Ok(requeued)
    }

    /// Flip one file's selection flag, returning the new value
    pub fn toggle_selection(&self, folder: FolderId, file: FileId) -> Result<bool> {
        let selected = {
            let mut state = self.write();
            let target = state
                .folder_mut(folder)?
                .file_mut(file)
                .ok_or_else(|| SvgBatchError::unknown_folder(format!("{} (file {})", folder, file)))?;
            target.selected = !target.selected;
            target.selected
        };
        self.bump();
        Ok(selected)
    }

    /// Set the selection of every ready file in a folder
    pub fn select_all_in_folder(&self, folder: FolderId, selected: bool) -> Result<usize> {
        let changed = {
            let mut state = self.write();
            let data = state.folder_mut(folder)?;
            let mut changed = 0;
            for file in data.files.iter_mut() {
                if file.status == FileStatus::Ready {
                    file.selected = selected;
                    changed += 1;
                } else {
                    file.selected = false;
                }
            }
            changed
        };
        self.bump();
        Ok(changed)
    }

    // Scheduler commands. Every one of them takes the run's cancellation
    // token and re-checks it under the write lock, so nothing can be applied
    // after `cancel_run` has reset the state.

    /// Open a run: stamp global stats and list folders with queued files
    pub(crate) fn begin_run(&self) -> (Vec<FolderId>, usize) {
        let result = {
            let mut state = self.write();
            state.run_started = Some(Instant::now());
            state.global.started_at = Some(Utc::now());
            state.global.finished_at = None;
            state.global.elapsed = Duration::ZERO;
            state.global.average_speed = 0.0;
            state.refresh_global();

            let folders: Vec<_> = state
                .folders
                .iter()
                .filter(|folder| folder.has_queued())
                .map(|folder| folder.id)
                .collect();
            let queued: usize = state
                .folders
                .iter()
                .map(|folder| folder.count(FileStatus::Queued))
                .sum();
            (folders, queued)
        };
        self.bump();
        result
    }

    /// Mark a folder as started.
    ///
    /// `paused` is read under the write lock, so a concurrent `set_paused`
    /// either lands before it and is seen, or after it and flips the status.
    pub(crate) fn begin_folder<F>(&self, id: FolderId, paused: F, cancel: &CancellationToken) -> Result<()>
    where
        F: FnOnce() -> bool,
    {
        {
            let mut state = self.write();
            if cancel.is_cancelled() {
                return Err(SvgBatchError::Cancelled);
            }
            let folder = state.folder_mut(id)?;
            folder.status = if paused() {
                FolderStatus::Paused
            } else {
                FolderStatus::Converting
            };
            folder.stats.started = Some(Instant::now());
            folder.stats.started_at = Some(Utc::now());
            folder.stats.speed = 0.0;
            folder.stats.eta_seconds = None;
        }
        self.bump();
        Ok(())
    }

    /// Next `size` queued files in upload order, skipping `attempted`
    pub(crate) fn next_slice(
        &self,
        id: FolderId,
        size: usize,
        attempted: &HashSet<FileId>,
    ) -> Result<Vec<FileJob>> {
        let state = self.read();
        let folder = state
            .folders
            .iter()
            .find(|folder| folder.id == id)
            .ok_or_else(|| SvgBatchError::unknown_folder(id))?;

        Ok(folder
            .files
            .iter()
            .filter(|file| file.status == FileStatus::Queued && !attempted.contains(&file.id))
            .take(size)
            .map(|file| FileJob {
                file: file.id,
                name: file.name.clone(),
                mode: file.mode,
            })
            .collect())
    }

    /// Mark a queued file `processing` and hand out its source bytes.
    ///
    /// `None` when the run was cancelled or the file is no longer queued.
    pub(crate) fn start_file(
        &self,
        folder: FolderId,
        file: FileId,
        cancel: &CancellationToken,
    ) -> Option<Arc<[u8]>> {
        let source = {
            let mut state = self.write();
            if cancel.is_cancelled() {
                return None;
            }
            let target = state.folder_mut(folder).ok()?.file_mut(file)?;
            if target.status != FileStatus::Queued {
                return None;
            }

            match target.source.clone() {
                Some(source) => {
                    target.status = FileStatus::Processing;
                    Some(source)
                }
                None => {
                    target.status = FileStatus::Error;
                    target.error = Some("Source image is no longer available".to_string());
                    let data = state.folder_mut(folder).ok()?;
                    data.stats.failed += 1;
                    state.refresh_global();
                    None
                }
            }
        };
        self.bump();
        source
    }

    /// Record a settled conversion. Discarded when the run was cancelled.
    pub(crate) fn apply_outcome(
        &self,
        folder: FolderId,
        file: FileId,
        outcome: Result<ConvertedSvg>,
        elapsed: Duration,
        cancel: &CancellationToken,
    ) -> Option<AppliedOutcome> {
        let applied = {
            let mut state = self.write();
            if cancel.is_cancelled() || matches!(outcome, Err(SvgBatchError::Cancelled)) {
                return None;
            }

            let data = state.folder_mut(folder).ok()?;
            let target = data.files.iter_mut().find(|f| f.id == file)?;
            if target.status != FileStatus::Processing {
                return None;
            }

            target.conversion_time = Some(elapsed);
            let error = match outcome {
                Ok(converted) => {
                    target.status = FileStatus::Ready;
                    target.result = Some(ConversionOutput::new(converted.svg));
                    target.source = None;
                    target.error = None;
                    data.stats.converted += 1;
                    None
                }
                Err(e) => {
                    let message = e.user_message();
                    target.status = FileStatus::Error;
                    target.error = Some(message.clone());
                    data.stats.failed += 1;
                    Some(message)
                }
            };

            let applied = AppliedOutcome {
                name: target.name.clone(),
                error,
            };
            state.refresh_global();
            applied
        };
        self.bump();
        Some(applied)
    }

    /// Recompute a folder's speed and ETA after a wave settles
    pub(crate) fn finish_wave(&self, id: FolderId) -> Result<(f64, Option<u64>)> {
        let rates = {
            let mut state = self.write();
            let folder = state.folder_mut(id)?;
            let remaining = folder.count(FileStatus::Queued);
            let speed = throughput(folder.stats.converted, folder.stats.elapsed());
            let eta = eta_seconds(remaining, speed);
            folder.stats.speed = speed;
            folder.stats.eta_seconds = eta;
            (speed, eta)
        };
        self.bump();
        Ok(rates)
    }

    /// Mark a folder completed once its queue is exhausted
    pub(crate) fn complete_folder(&self, id: FolderId, cancel: &CancellationToken) -> bool {
        let completed = {
            let mut state = self.write();
            if cancel.is_cancelled() {
                return false;
            }
            match state.folder_mut(id) {
                Ok(folder) => {
                    folder.status = FolderStatus::Completed;
                    folder.stats.eta_seconds = None;
                    true
                }
                Err(_) => false,
            }
        };
        self.bump();
        completed
    }

    /// Flip converting folders to paused, or back
    pub(crate) fn set_paused(&self, paused: bool) {
        {
            let mut state = self.write();
            let (from, to) = if paused {
                (FolderStatus::Converting, FolderStatus::Paused)
            } else {
                (FolderStatus::Paused, FolderStatus::Converting)
            };
            for folder in state.folders.iter_mut().filter(|f| f.status == from) {
                folder.status = to;
            }
        }
        self.bump();
    }

    /// Revert in-flight files to queued and every folder to idle
    pub(crate) fn cancel_run(&self) -> usize {
        let reverted = {
            let mut state = self.write();
            let mut reverted = 0;
            for folder in state.folders.iter_mut() {
                for file in folder.files.iter_mut().filter(|f| f.status == FileStatus::Processing) {
                    file.status = FileStatus::Queued;
                    reverted += 1;
                }
                folder.status = FolderStatus::Idle;
                folder.stats.eta_seconds = None;
            }
            reverted
        };
        self.bump();
        reverted
    }

    /// Close the run and finalize global statistics
    pub(crate) fn finish_run(&self) -> GlobalStats {
        let stats = {
            let mut state = self.write();
            let elapsed = state
                .run_started
                .take()
                .map(|start| start.elapsed())
                .unwrap_or_default();

            state.refresh_global();
            state.global.finished_at = Some(Utc::now());
            state.global.elapsed = elapsed;
            state.global.average_speed = throughput(state.global.converted, elapsed);
            state.global.clone()
        };
        self.bump();
        stats
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(LimitsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::decode::tests::encode;
    use crate::processing::IncomingFile;
    use image::ImageOutputFormat;

    fn upload(dir: &str, count: usize) -> FolderUpload {
        FolderUpload::new(
            (0..count)
                .map(|i| {
                    IncomingFile::new(format!("{}.png", i), encode(8, 8, ImageOutputFormat::Png))
                        .with_relative_path(format!("{}/{}.png", dir, i))
                })
                .collect(),
        )
    }

    fn converted(svg: &str) -> Result<ConvertedSvg> {
        Ok(ConvertedSvg {
            svg: svg.to_string(),
            width: 8,
            height: 8,
        })
    }

    /// Run one file through start/apply with the given outcome
    fn settle(store: &StateStore, folder: FolderId, file: FileId, outcome: Result<ConvertedSvg>) {
        let cancel = CancellationToken::new();
        assert!(store.start_file(folder, file, &cancel).is_some());
        store
            .apply_outcome(folder, file, outcome, Duration::from_millis(5), &cancel)
            .unwrap();
    }

    #[test]
    fn test_add_folder() {
        let store = StateStore::default();
        let before = store.version();
        let report = store.add_folder(upload("logos", 3), ConversionMode::BlackWhite).unwrap();

        assert_eq!(report.name, "logos");
        assert_eq!(report.accepted, 3);
        assert!(store.version() > before);

        let snapshot = store.snapshot();
        let folder = snapshot.folder(report.folder).unwrap();
        assert_eq!(folder.stats.total_files, 3);
        assert_eq!(folder.status, FolderStatus::Idle);
        assert!(folder.files.iter().all(|f| f.status == FileStatus::Queued));
        assert_eq!(snapshot.global.total_files, 3);
    }

    #[test]
    fn test_add_folder_limits() {
        let limits = LimitsConfig {
            max_folders: 1,
            ..LimitsConfig::default()
        };
        let store = StateStore::new(limits);
        store.add_folder(upload("a", 1), ConversionMode::BlackWhite).unwrap();
        assert!(matches!(
            store.add_folder(upload("b", 1), ConversionMode::BlackWhite),
            Err(SvgBatchError::LimitExceeded { .. })
        ));

        let empty = FolderUpload::new(vec![IncomingFile::new("x.txt", b"text".to_vec())]);
        assert!(StateStore::default()
            .add_folder(empty, ConversionMode::BlackWhite)
            .is_err());
    }

    #[test]
    fn test_success_releases_source() {
        let store = StateStore::default();
        let folder = store.add_folder(upload("f", 1), ConversionMode::BlackWhite).unwrap().folder;
        let file = store.snapshot().folders[0].files[0].id;

        settle(&store, folder, file, converted("<svg/>"));

        let snapshot = store.snapshot();
        let data = snapshot.folder(folder).unwrap();
        let file = &data.files[0];
        assert_eq!(file.status, FileStatus::Ready);
        assert!(file.source.is_none());
        assert_eq!(file.result.as_ref().unwrap().svg(), "<svg/>");
        assert!(file.conversion_time.is_some());
        assert_eq!(data.stats.converted, 1);
        assert_eq!(snapshot.global.converted, 1);
    }

    #[test]
    fn test_failure_records_message() {
        let store = StateStore::default();
        let folder = store.add_folder(upload("f", 1), ConversionMode::BlackWhite).unwrap().folder;
        let file = store.snapshot().folders[0].files[0].id;

        settle(&store, folder, file, Err(SvgBatchError::tracing("no paths found")));

        let snapshot = store.snapshot();
        let target = &snapshot.folders[0].files[0];
        assert_eq!(target.status, FileStatus::Error);
        assert_eq!(target.error.as_deref(), Some("no paths found"));
        assert!(target.source.is_some());
        assert_eq!(snapshot.folders[0].stats.failed, 1);
        assert_eq!(snapshot.global.failed, 1);
    }

    #[test]
    fn test_cancelled_outcome_is_discarded() {
        let store = StateStore::default();
        let folder = store.add_folder(upload("f", 1), ConversionMode::BlackWhite).unwrap().folder;
        let file = store.snapshot().folders[0].files[0].id;

        let cancel = CancellationToken::new();
        store.start_file(folder, file, &cancel).unwrap();
        cancel.cancel();
        assert!(store
            .apply_outcome(folder, file, converted("<svg/>"), Duration::ZERO, &cancel)
            .is_none());
        assert_eq!(store.cancel_run(), 1);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.folders[0].files[0].status, FileStatus::Queued);
        assert_eq!(snapshot.folders[0].status, FolderStatus::Idle);
        assert_eq!(snapshot.folders[0].stats.converted, 0);
        assert!(store.start_file(folder, file, &cancel).is_none());
    }

    #[test]
    fn test_retry_failed_keeps_ready_files() {
        let store = StateStore::default();
        let folder = store.add_folder(upload("f", 3), ConversionMode::BlackWhite).unwrap().folder;
        let ids: Vec<_> = store.snapshot().folders[0].files.iter().map(|f| f.id).collect();

        settle(&store, folder, ids[0], converted("<svg/>"));
        settle(&store, folder, ids[1], Err(SvgBatchError::tracing("boom")));
        settle(&store, folder, ids[2], Err(SvgBatchError::decode("bad", None)));

        assert_eq!(store.retry_failed(Some(folder)).unwrap(), 2);

        let snapshot = store.snapshot();
        let data = snapshot.folder(folder).unwrap();
        assert_eq!(data.stats.failed, 0);
        assert_eq!(data.stats.converted, 1);
        assert_eq!(data.files[0].status, FileStatus::Ready);
        assert_eq!(data.files[1].status, FileStatus::Queued);
        assert!(data.files[1].error.is_none());
        assert_eq!(data.files[2].status, FileStatus::Queued);
    }

    #[test]
    fn test_next_slice_order_and_exclusion() {
        let store = StateStore::default();
        let folder = store.add_folder(upload("f", 5), ConversionMode::BlackWhite).unwrap().folder;
        let ids: Vec<_> = store.snapshot().folders[0].files.iter().map(|f| f.id).collect();

        let first = store.next_slice(folder, 2, &HashSet::new()).unwrap();
        assert_eq!(first.iter().map(|j| j.file).collect::<Vec<_>>(), ids[..2]);

        let attempted: HashSet<_> = ids[..2].iter().copied().collect();
        let second = store.next_slice(folder, 2, &attempted).unwrap();
        assert_eq!(second.iter().map(|j| j.file).collect::<Vec<_>>(), ids[2..4]);
    }

    #[test]
    fn test_selection_commands() {
        let store = StateStore::default();
        let folder = store.add_folder(upload("f", 2), ConversionMode::BlackWhite).unwrap().folder;
        let ids: Vec<_> = store.snapshot().folders[0].files.iter().map(|f| f.id).collect();
        settle(&store, folder, ids[0], converted("<svg/>"));

        assert_eq!(store.select_all_in_folder(folder, true).unwrap(), 1);
        let snapshot = store.snapshot();
        assert!(snapshot.folders[0].files[0].selected);
        assert!(!snapshot.folders[0].files[1].selected);

        assert!(!store.toggle_selection(folder, ids[0]).unwrap());
        assert!(store.toggle_selection(folder, ids[0]).unwrap());
    }

    #[test]
    fn test_archive_entries() {
        let store = StateStore::default();
        let a = store.add_folder(upload("icons", 2), ConversionMode::BlackWhite).unwrap().folder;
        let b = store.add_folder(upload("photos", 1), ConversionMode::Posterize).unwrap().folder;
        let snapshot = store.snapshot();
        let a_files: Vec<_> = snapshot.folders[0].files.iter().map(|f| f.id).collect();
        let b_file = snapshot.folders[1].files[0].id;

        settle(&store, a, a_files[1], converted("<svg id=\"a1\"/>"));
        settle(&store, b, b_file, converted("<svg id=\"b0\"/>"));
        settle(&store, a, a_files[0], Err(SvgBatchError::tracing("boom")));

        let entries = store.snapshot().archive_entries(Selection::All, None);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["icons/1.svg", "photos/0.svg"]);

        let only_b = store.snapshot().archive_entries(Selection::All, Some(b));
        assert_eq!(only_b.len(), 1);

        assert!(store
            .snapshot()
            .archive_entries(Selection::SelectedOnly, None)
            .is_empty());
        store.toggle_selection(b, b_file).unwrap();
        assert_eq!(
            store.snapshot().archive_entries(Selection::SelectedOnly, None)[0].path,
            "photos/0.svg"
        );
    }

    #[test]
    fn test_remove_and_clear() {
        let store = StateStore::default();
        let a = store.add_folder(upload("a", 2), ConversionMode::BlackWhite).unwrap().folder;
        store.add_folder(upload("b", 1), ConversionMode::BlackWhite).unwrap();

        store.remove_folder(a).unwrap();
        assert!(store.remove_folder(a).is_err());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.folders.len(), 1);
        assert_eq!(snapshot.global.total_files, 1);

        store.clear_all().unwrap();
        let snapshot = store.snapshot();
        assert!(snapshot.folders.is_empty());
        assert_eq!(snapshot.global.total_files, 0);
    }

    #[test]
    fn test_pause_flips_only_active_folders() {
        let store = StateStore::default();
        let a = store.add_folder(upload("a", 1), ConversionMode::BlackWhite).unwrap().folder;
        store.add_folder(upload("b", 1), ConversionMode::BlackWhite).unwrap();

        store.begin_folder(a, || false, &CancellationToken::new()).unwrap();
        store.set_paused(true);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.folders[0].status, FolderStatus::Paused);
        assert_eq!(snapshot.folders[1].status, FolderStatus::Idle);

        store.set_paused(false);
        assert_eq!(store.snapshot().folders[0].status, FolderStatus::Converting);
    }

    #[test]
    fn test_begin_folder_reads_pause_under_lock() {
        let store = StateStore::default();
        let a = store.add_folder(upload("a", 1), ConversionMode::BlackWhite).unwrap().folder;

        store.begin_folder(a, || true, &CancellationToken::new()).unwrap();
        assert_eq!(store.snapshot().folders[0].status, FolderStatus::Paused);

        // A resume applied afterwards still reaches the folder
        store.set_paused(false);
        assert_eq!(store.snapshot().folders[0].status, FolderStatus::Converting);
    }

    #[test]
    fn test_clear_and_remove_refused_during_run() {
        let store = StateStore::default();
        let a = store.add_folder(upload("a", 2), ConversionMode::BlackWhite).unwrap().folder;

        store.begin_run();
        assert!(matches!(store.clear_all(), Err(SvgBatchError::AlreadyRunning)));
        assert!(matches!(store.remove_folder(a), Err(SvgBatchError::AlreadyRunning)));
        assert_eq!(store.snapshot().folders.len(), 1);

        let stats = store.finish_run();
        assert_eq!(stats.total_files, 2);
        store.clear_all().unwrap();
        assert!(store.snapshot().folders.is_empty());
    }

    #[test]
    fn test_duplicate_folder_names_are_numbered() {
        let store = StateStore::default();
        store.add_folder(upload("icons", 1), ConversionMode::BlackWhite).unwrap();
        let second = store.add_folder(upload("icons", 1), ConversionMode::BlackWhite).unwrap();
        let third = store.add_folder(upload("icons", 1), ConversionMode::BlackWhite).unwrap();

        assert_eq!(second.name, "icons (2)");
        assert_eq!(third.name, "icons (3)");
    }

    #[test]
    fn test_archive_paths_unique_for_shared_stems() {
        let store = StateStore::default();
        let upload = FolderUpload::new(vec![
            IncomingFile::new("logo.png", encode(8, 8, ImageOutputFormat::Png)).with_relative_path("d/logo.png"),
            IncomingFile::new("logo.jpg", encode(8, 8, ImageOutputFormat::Jpeg(90))).with_relative_path("d/logo.jpg"),
        ]);
        let id = store.add_folder(upload, ConversionMode::BlackWhite).unwrap().folder;
        let files: Vec<_> = store.snapshot().folders[0].files.iter().map(|f| f.id).collect();
        for file in files {
            settle(&store, id, file, converted("<svg/>"));
        }

        let entries = store.snapshot().archive_entries(Selection::All, None);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["d/logo.svg", "d/logo-1.svg"]);
        assert!(crate::processing::zip_bytes(&entries).is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_see_new_versions() {
        let store = StateStore::default();
        let mut versions = store.subscribe();
        store.add_folder(upload("a", 1), ConversionMode::BlackWhite).unwrap();
        versions.changed().await.unwrap();
        assert_eq!(*versions.borrow(), store.version());
    }
}
