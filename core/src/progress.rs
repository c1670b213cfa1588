//! Progress reporting for long loads.

/// Receives progress in kilobytes of source data.
pub trait Progress {
    fn begin(&mut self, _total_kb: u64, _label: &str) {}

    fn update(&mut self, _done_kb: u64) {}
}

/// Discards all progress reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

impl Progress for NullProgress {}

/// Logs progress at debug level, at most once per whole percent.
#[derive(Debug, Default)]
pub struct LogProgress {
    total_kb: u64,
    last_percent: Option<u64>,
}

impl Progress for LogProgress {
    fn begin(&mut self, total_kb: u64, label: &str) {
        self.total_kb = total_kb;
        self.last_percent = None;
        log::debug!("{label}: {total_kb}K");
    }

    fn update(&mut self, done_kb: u64) {
        let percent = if self.total_kb == 0 { 100 } else { (done_kb * 100 / self.total_kb).min(100) };
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            log::debug!("Processed {done_kb}K / {}K ({percent}%)", self.total_kb);
        }
    }
}
