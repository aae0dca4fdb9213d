//! Transfer progress display with progress bars.

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar for one download
pub struct TransferBar {
    bar: ProgressBar,
}

impl TransferBar {
    /// Create a progress bar
    #[must_use]
    pub fn new(total_bytes: u64, filename: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);

        let style = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(format!("Downloading: {filename}"));

        Self { bar }
    }

    /// Update progress
    pub fn update(&self, transferred_bytes: u64) {
        self.bar.set_position(transferred_bytes);
    }

    /// Finish with success message
    pub fn finish(&self) {
        self.bar.finish_with_message("Transfer complete!");
    }

    /// Abandon the bar with a reason
    pub fn fail(&self, reason: &str) {
        self.bar.abandon_with_message(format!("Transfer failed: {reason}"));
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Parse a size such as `12582912`, `512K`, `5M` or `1G`
///
/// # Errors
///
/// Returns an error if the number or suffix is not understood.
pub fn parse_size(input: &str) -> anyhow::Result<u64> {
    let input = input.trim();
    let (digits, multiplier) = match input.chars().last() {
        Some('K' | 'k') => (&input[..input.len() - 1], 1024),
        Some('M' | 'm') => (&input[..input.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&input[..input.len() - 1], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid size: {input}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("size too large: {input}"))
}
