// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Interrupt-counter monitor.
//!
//! Snapshots `/proc/interrupts` at an interval and reports every
//! interrupt source whose per-CPU counters moved on the watched CPUs.
//! Isolated CPUs are supposed to stay silent; anything printed here is
//! interference worth explaining.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use isol_utils::read_cpulist;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Parser)]
struct Opts {
    /// CPUs to watch, as a cpulist. All CPUs when absent.
    #[clap(short, long)]
    cpus: Option<String>,

    /// Sampling interval in seconds.
    #[clap(short, long, default_value = "1.0")]
    interval: f64,

    /// Number of samples; run until interrupted when absent.
    #[clap(short = 'n', long)]
    count: Option<u64>,

    /// Path of the interrupts view.
    #[clap(long, default_value = "/proc/interrupts")]
    path: String,
}

/// One source line: label, per-column counters, trailing description.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IntrSource {
    label: String,
    counts: Vec<u64>,
    desc: String,
}

#[derive(Debug, Default)]
struct IntrSnapshot {
    /// CPU number per counter column, from the header line.
    cpus: Vec<usize>,
    sources: Vec<IntrSource>,
}

fn parse_interrupts(text: &str) -> IntrSnapshot {
    let mut snap = IntrSnapshot::default();
    let mut lines = text.lines();

    let Some(header) = lines.next() else {
        return snap;
    };
    for tok in header.split_whitespace() {
        if let Some(n) = tok.strip_prefix("CPU").and_then(|n| n.parse().ok()) {
            snap.cpus.push(n);
        }
    }

    for line in lines {
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim().to_string();
        if label.is_empty() {
            continue;
        }
        // Leading numeric tokens are the per-CPU counters, at most one
        // per header column; the remainder describes the source.
        let mut counts = Vec::with_capacity(snap.cpus.len());
        let mut tail = Vec::new();
        for tok in rest.split_whitespace() {
            if tail.is_empty() && counts.len() < snap.cpus.len() {
                if let Ok(v) = tok.parse::<u64>() {
                    counts.push(v);
                    continue;
                }
            }
            tail.push(tok);
        }
        snap.sources.push(IntrSource {
            label,
            counts,
            desc: tail.join(" "),
        });
    }
    snap
}

/// Counter deltas per source, restricted to the watched CPUs.
fn deltas(
    prev: &IntrSnapshot,
    curr: &IntrSnapshot,
    watched: &[usize],
) -> Vec<(String, String, Vec<(usize, u64)>)> {
    let prev_by_label: HashMap<&str, &IntrSource> =
        prev.sources.iter().map(|s| (s.label.as_str(), s)).collect();
    let mut out = Vec::new();
    for src in &curr.sources {
        let Some(old) = prev_by_label.get(src.label.as_str()) else {
            continue;
        };
        let mut moved = Vec::new();
        for (col, cpu) in curr.cpus.iter().enumerate() {
            if !watched.is_empty() && !watched.contains(cpu) {
                continue;
            }
            let new = src.counts.get(col).copied().unwrap_or(0);
            let before = old.counts.get(col).copied().unwrap_or(0);
            if new > before {
                moved.push((*cpu, new - before));
            }
        }
        if !moved.is_empty() {
            out.push((src.label.clone(), src.desc.clone(), moved));
        }
    }
    out
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let watched = match &opts.cpus {
        Some(list) => read_cpulist(list)?,
        None => Vec::new(),
    };

    let mut prev = parse_interrupts(
        &std::fs::read_to_string(&opts.path)
            .with_context(|| format!("Failed to read {}", opts.path))?,
    );
    let mut samples = 0;
    loop {
        std::thread::sleep(Duration::from_secs_f64(opts.interval));
        let curr = parse_interrupts(
            &std::fs::read_to_string(&opts.path)
                .with_context(|| format!("Failed to read {}", opts.path))?,
        );
        for (label, desc, moved) in deltas(&prev, &curr, &watched) {
            let detail = moved
                .iter()
                .map(|(cpu, d)| format!("CPU{cpu} +{d}"))
                .collect::<Vec<_>>()
                .join(", ");
            if desc.is_empty() {
                println!("{label}: {detail}");
            } else {
                println!("{label} ({desc}): {detail}");
            }
        }
        prev = curr;
        samples += 1;
        if let Some(count) = opts.count {
            if samples >= count {
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_A: &str = "\
           CPU0       CPU1       CPU2       CPU3
 27:     874272     874101     100        99      GICv2  30 Level     arch_timer
 42:        100          0       0         0      GICv2 175 Level     eth0
IPI0:       500        400     300       200      Rescheduling interrupts
Err:          0
";

    const SAMPLE_B: &str = "\
           CPU0       CPU1       CPU2       CPU3
 27:     874300     874200     100       101      GICv2  30 Level     arch_timer
 42:        150          0       0         0      GICv2 175 Level     eth0
IPI0:       500        400     300       200      Rescheduling interrupts
Err:          0
";

    #[test]
    fn test_parse_interrupts() {
        let snap = parse_interrupts(SAMPLE_A);
        assert_eq!(snap.cpus, vec![0, 1, 2, 3]);
        assert_eq!(snap.sources.len(), 4);
        assert_eq!(snap.sources[0].label, "27");
        assert_eq!(snap.sources[0].counts, vec![874272, 874101, 100, 99]);
        assert_eq!(snap.sources[3].label, "Err");
        assert_eq!(snap.sources[3].counts, vec![0]);
    }

    #[test]
    fn test_deltas_restricted_to_watched_cpus() {
        let a = parse_interrupts(SAMPLE_A);
        let b = parse_interrupts(SAMPLE_B);

        // Watching the isolation CPUs only: the timer tick on CPU 3
        // shows up, the eth0 burst on CPU 0 does not.
        let moved = deltas(&a, &b, &[2, 3]);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].0, "27");
        assert_eq!(moved[0].2, vec![(3, 2)]);

        // Watching everything reports both sources.
        let moved = deltas(&a, &b, &[]);
        assert_eq!(moved.len(), 2);
    }
}
