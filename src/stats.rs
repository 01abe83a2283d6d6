use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

// ====== LOAD STATISTICS ======
#[derive(Debug, Default)]
pub struct LoadStats {
    pub files_processed: AtomicU64,
    pub nodes_written: AtomicU64,
    pub edges_written: AtomicU64,
    pub edges_skipped: AtomicU64,
    pub pages_submitted: AtomicU64,
    pub csv_rows: AtomicU64,
}

impl LoadStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn log_summary(&self) {
        info!("Final Load Statistics:");
        info!("  Files processed: {}", self.files_processed.load(Ordering::Relaxed));
        info!("  Nodes written: {}", self.nodes_written.load(Ordering::Relaxed));
        info!("  Edges written: {}", self.edges_written.load(Ordering::Relaxed));
        info!("  Edges skipped (no dest_lni): {}", self.edges_skipped.load(Ordering::Relaxed));
        info!("  Pages submitted: {}", self.pages_submitted.load(Ordering::Relaxed));
        info!("  CSV rows: {}", self.csv_rows.load(Ordering::Relaxed));
    }
}

pub fn progress_bar(len: usize, unit: &str) -> Result<ProgressBar> {
    let progress = ProgressBar::new(len as u64);
    progress.set_style(ProgressStyle::with_template(&format!(
        "[{{elapsed_precise}}] {{bar:50.cyan/blue}} {{pos:>7}}/{{len:7}} {} | {{msg}}",
        unit
    ))?);
    Ok(progress)
}
