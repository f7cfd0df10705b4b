// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The timer-observer seam.
//!
//! The manager only depends on the `TimerSource` trait, so tests can
//! drive the state machine with scripted observations.

use crate::timers::parse_timer_list;
use crate::timers::TimerScan;
use anyhow::Context;
use anyhow::Result;
use std::path::PathBuf;

pub trait TimerSource: Send {
    /// One pass over the kernel's timer view.
    fn scan(&mut self) -> Result<TimerScan>;
}

/// Production source reading `/proc/timer_list`.
pub struct ProcTimerSource {
    path: PathBuf,
}

impl ProcTimerSource {
    pub fn new(path: PathBuf) -> ProcTimerSource {
        ProcTimerSource { path }
    }
}

impl Default for ProcTimerSource {
    fn default() -> Self {
        ProcTimerSource::new(PathBuf::from("/proc/timer_list"))
    }
}

impl TimerSource for ProcTimerSource {
    fn scan(&mut self) -> Result<TimerScan> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(parse_timer_list(&text))
    }
}
