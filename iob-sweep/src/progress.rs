// Copyright (c) Facebook, Inc. and its affiliates.
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

/// Sweep progress. Draws a bar when stderr is a terminal and falls back to
/// periodic log messages otherwise.
pub struct SweepProgress {
    bar: Option<ProgressBar>,
    term_width: usize,
    intv_cnt: u32,
}

impl SweepProgress {
    const LOG_INTV: u32 = 5;

    pub fn new(len: u64) -> Self {
        let bar = if console::user_attended_stderr() {
            let bar = ProgressBar::new(len);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:30}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.tick();
            Some(bar)
        } else {
            None
        };

        Self {
            bar,
            term_width: term_size::dimensions_stderr().unwrap_or((80, 0)).0,
            intv_cnt: 0,
        }
    }

    pub fn set_status(&mut self, status: &str) {
        match self.bar.as_ref() {
            Some(bar) => {
                let width = self.term_width.saturating_sub(48).max(16);
                let msg: String = status.chars().take(width).collect();
                bar.set_message(msg);
            }
            None => {
                if self.intv_cnt % Self::LOG_INTV == 0 {
                    info!("{}", status);
                }
                self.intv_cnt += 1;
            }
        }
    }

    pub fn advance(&mut self) {
        if let Some(bar) = self.bar.as_ref() {
            bar.inc(1);
        }
    }
}

impl Drop for SweepProgress {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
