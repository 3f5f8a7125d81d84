//! Transfer progress bars for the interactive client

use indicatif::{ProgressBar, ProgressStyle};

/// Byte-count bar for one transfer; hidden when `enabled` is false so
/// callers can update it unconditionally.
pub fn transfer_bar(total: u64, label: &str, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:20!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_message(label.to_string());
    bar
}

/// Finish a bar with a one-word outcome.
pub fn finish(bar: &ProgressBar, ok: bool) {
    if ok {
        bar.finish_with_message("done");
    } else {
        bar.abandon_with_message("incomplete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_bar_still_counts() {
        let bar = transfer_bar(100, "x", false);
        bar.inc(40);
        assert_eq!(bar.position(), 40);
        assert!(bar.is_hidden());
        finish(&bar, true);
    }
}
