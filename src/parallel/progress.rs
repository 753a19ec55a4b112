//! Progress derivation, run reports and the progress event stream

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::parallel::state::{FileId, FileStatus, FolderData, FolderId, GlobalStats, UploadedFile};

/// Throughput in images per second; 0 when no time has elapsed
pub fn throughput(converted: usize, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds > 0.0 {
        converted as f64 / seconds
    } else {
        0.0
    }
}

/// Seconds left for `remaining` files at `speed` images/sec, rounded up.
///
/// Unknown (`None`) while the speed is zero.
pub fn eta_seconds(remaining: usize, speed: f64) -> Option<u64> {
    if !(speed.is_finite() && speed > 0.0) {
        return None;
    }
    Some((remaining as f64 / speed).ceil() as u64)
}

/// Per-status file counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounts {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub ready: usize,
    pub failed: usize,
}

impl ProgressCounts {
    pub fn from_files<'a, I>(files: I) -> Self
    where
        I: IntoIterator<Item = &'a UploadedFile>,
    {
        files.into_iter().fold(Self::default(), |mut counts, file| {
            counts.total += 1;
            match file.status {
                FileStatus::Queued => counts.queued += 1,
                FileStatus::Processing => counts.processing += 1,
                FileStatus::Ready => counts.ready += 1,
                FileStatus::Error => counts.failed += 1,
            }
            counts
        })
    }

    pub fn from_folders(folders: &[FolderData]) -> Self {
        Self::from_files(folders.iter().flat_map(|folder| folder.files.iter()))
    }

    /// Files that reached a terminal state
    pub fn settled(&self) -> usize {
        self.ready + self.failed
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.settled() as f64 / self.total as f64 * 100.0
        }
    }
}

/// Live view across every folder
#[derive(Debug, Clone, Serialize)]
pub struct GlobalProgress {
    pub counts: ProgressCounts,
    pub speed: f64,
    pub eta_seconds: Option<u64>,
    pub elapsed: Duration,
}

impl GlobalProgress {
    /// Derive from folder state and the time since the run started
    pub fn derive(folders: &[FolderData], elapsed: Duration) -> Self {
        let counts = ProgressCounts::from_folders(folders);
        let speed = throughput(counts.ready, elapsed);

        Self {
            counts,
            speed,
            eta_seconds: eta_seconds(counts.queued, speed),
            elapsed,
        }
    }

    pub fn eta_text(&self) -> String {
        eta_text(self.eta_seconds)
    }

    pub fn speed_text(&self) -> String {
        speed_text(self.speed)
    }
}

/// End-of-run summary
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub folders: usize,
    pub total_files: usize,
    pub converted: usize,
    pub failed: usize,
    /// Percentage of attempted files that converted
    pub success_rate: f64,
    pub elapsed: Duration,
    pub average_speed: f64,
    pub cancelled: bool,
}

impl FinalReport {
    pub fn from_stats(stats: &GlobalStats, cancelled: bool) -> Self {
        let attempted = stats.converted + stats.failed;
        let success_rate = if attempted == 0 {
            0.0
        } else {
            stats.converted as f64 / attempted as f64 * 100.0
        };

        Self {
            folders: stats.total_folders,
            total_files: stats.total_files,
            converted: stats.converted,
            failed: stats.failed,
            success_rate,
            elapsed: stats.elapsed,
            average_speed: stats.average_speed,
            cancelled,
        }
    }

    pub fn time_text(&self) -> String {
        format_elapsed(self.elapsed)
    }

    /// Average speed with two decimals
    pub fn speed_text(&self) -> String {
        format!("{:.2} img/s", self.average_speed)
    }
}

/// `850ms`, `12.3s` or `2.5m`
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else {
        format!("{:.1}m", elapsed.as_secs_f64() / 60.0)
    }
}

/// Human-readable ETA
pub fn eta_text(eta_seconds: Option<u64>) -> String {
    match eta_seconds {
        Some(seconds) if seconds < 60 => format!("{}s", seconds),
        Some(seconds) if seconds < 3600 => format!("{}m {}s", seconds / 60, seconds % 60),
        Some(seconds) => format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60),
        None => "Unknown".to_string(),
    }
}

/// Human-readable speed
pub fn speed_text(speed: f64) -> String {
    if speed >= 1.0 {
        format!("{:.1} img/sec", speed)
    } else if speed > 0.0 {
        format!("{:.1} sec/img", 1.0 / speed)
    } else {
        "Unknown".to_string()
    }
}

/// Events published while a run progresses
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RunStarted {
        folders: usize,
        queued_files: usize,
    },
    FileStarted {
        folder: FolderId,
        file: FileId,
        name: String,
    },
    FileFinished {
        folder: FolderId,
        file: FileId,
        name: String,
        error: Option<String>,
        elapsed: Duration,
    },
    WaveCompleted {
        folder: FolderId,
        size: usize,
        speed: f64,
        eta_seconds: Option<u64>,
    },
    FolderCompleted {
        folder: FolderId,
    },
    Paused,
    Resumed,
    Cancelled,
    RunFinished {
        stats: GlobalStats,
    },
}

/// Broadcast hub for [`ProgressEvent`]s
pub struct ProgressTracker {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::RunStarted {
                folders,
                queued_files,
            } => info!("Converting {} files across {} folders", queued_files, folders),
            ProgressEvent::WaveCompleted {
                folder,
                size,
                speed,
                eta_seconds,
            } => debug!(
                "Folder {}: wave of {} settled ({}, ETA {})",
                folder,
                size,
                speed_text(*speed),
                eta_text(*eta_seconds)
            ),
            ProgressEvent::RunFinished { stats } => info!(
                "Run finished: {} converted, {} failed in {}",
                stats.converted,
                stats.failed,
                format_elapsed(stats.elapsed)
            ),
            _ => {}
        }

        let _ = self.sender.send(event);
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversionMode;
    use crate::parallel::state::{FolderStats, FolderStatus, UploadedFile};
    use crate::processing::SourceFormat;
    use std::sync::Arc;

    fn file(status: FileStatus) -> UploadedFile {
        let mut file = UploadedFile::new(
            "a.png",
            "a.png",
            SourceFormat::Png,
            Arc::from(vec![0u8; 4]),
            ConversionMode::BlackWhite,
        );
        file.status = status;
        file
    }

    #[test]
    fn test_throughput_never_divides_by_zero() {
        assert_eq!(throughput(5, Duration::ZERO), 0.0);
        assert_eq!(throughput(5, Duration::from_secs(2)), 2.5);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta_seconds(3, 2.0), Some(2));
        assert_eq!(eta_seconds(4, 2.0), Some(2));
        assert_eq!(eta_seconds(0, 2.0), Some(0));
        assert_eq!(eta_seconds(3, 0.0), None);
        assert_eq!(eta_seconds(3, f64::NAN), None);
    }

    #[test]
    fn test_counts() {
        let files = vec![
            file(FileStatus::Queued),
            file(FileStatus::Processing),
            file(FileStatus::Ready),
            file(FileStatus::Ready),
            file(FileStatus::Error),
        ];
        let counts = ProgressCounts::from_files(&files);
        assert_eq!(counts.total, 5);
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.ready, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.completion_percentage(), 60.0);
        assert_eq!(ProgressCounts::default().completion_percentage(), 0.0);
    }

    fn folder(statuses: &[FileStatus]) -> FolderData {
        FolderData {
            id: FolderId::new(),
            name: "f".to_string(),
            files: statuses.iter().map(|status| file(*status)).collect(),
            status: FolderStatus::Converting,
            stats: FolderStats::default(),
        }
    }

    #[test]
    fn test_global_progress_across_folders() {
        let folders = vec![
            folder(&[FileStatus::Ready, FileStatus::Ready, FileStatus::Processing]),
            folder(&[FileStatus::Ready, FileStatus::Error, FileStatus::Queued, FileStatus::Queued]),
        ];

        let progress = GlobalProgress::derive(&folders, Duration::from_secs(2));
        assert_eq!(progress.counts.total, 7);
        assert_eq!(progress.counts.ready, 3);
        assert_eq!(progress.counts.failed, 1);
        assert_eq!(progress.counts.processing, 1);
        assert_eq!(progress.speed, 1.5);
        // Only queued files count as remaining, as for a single folder
        assert_eq!(progress.eta_seconds, Some(2));
        assert_eq!(progress.eta_text(), "2s");
        assert_eq!(progress.speed_text(), "1.5 img/sec");
    }

    #[test]
    fn test_global_progress_unknown_at_zero_elapsed() {
        let folders = vec![folder(&[FileStatus::Ready, FileStatus::Queued])];

        let progress = GlobalProgress::derive(&folders, Duration::ZERO);
        assert_eq!(progress.speed, 0.0);
        assert_eq!(progress.eta_seconds, None);

        let idle = GlobalProgress::derive(&[folder(&[FileStatus::Queued])], Duration::from_secs(3));
        assert_eq!(idle.speed, 0.0);
        assert_eq!(idle.eta_seconds, None);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(850)), "850ms");
        assert_eq!(format_elapsed(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(format_elapsed(Duration::from_secs(150)), "2.5m");
    }

    #[test]
    fn test_text_helpers() {
        assert_eq!(eta_text(None), "Unknown");
        assert_eq!(eta_text(Some(42)), "42s");
        assert_eq!(eta_text(Some(125)), "2m 5s");
        assert_eq!(eta_text(Some(7260)), "2h 1m");
        assert!(speed_text(2.5).contains("2.5"));
        assert!(speed_text(0.5).contains("2.0 sec/img"));
        assert_eq!(speed_text(0.0), "Unknown");
    }

    #[test]
    fn test_final_report() {
        let stats = GlobalStats {
            total_folders: 2,
            total_files: 5,
            converted: 4,
            failed: 1,
            elapsed: Duration::from_secs(2),
            average_speed: 2.0,
            ..GlobalStats::default()
        };

        let report = FinalReport::from_stats(&stats, false);
        assert_eq!(report.success_rate, 80.0);
        assert_eq!(report.time_text(), "2.0s");
        assert_eq!(report.speed_text(), "2.00 img/s");
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let tracker = ProgressTracker::new();
        let mut receiver = tracker.subscribe();

        tracker.emit(ProgressEvent::Paused);
        assert!(matches!(receiver.recv().await.unwrap(), ProgressEvent::Paused));
    }
}
