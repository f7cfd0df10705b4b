// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! `/proc/timer_list` parsing.
//!
//! The file format is unstable across kernel versions, so parsing is
//! best-effort and line-oriented: unknown lines advance to the next
//! line, values that fail to parse abort only the current record. The
//! pass produces the global `now` and one record per live timer: every
//! enqueued high-resolution timer whose expiration is not the sentinel
//! maximum, each CPU's `expires_next`, and the tick devices in both
//! broadcast and per-CPU modes.

use isol_utils::Cpumask;

/// KTIME_MAX, the kernel's never-expiring sentinel.
pub const KTIME_MAX: i64 = i64::MAX;

/// hrtimer state bit: enqueued. Inactive is 0.
const HRTIMER_STATE_INACTIVE: i64 = 0;

/// Clock-event device states that keep a tick running, from the
/// kernel's clockchips definitions.
const CLOCK_EVT_STATE_PERIODIC: i64 = 2;
const CLOCK_EVT_STATE_ONESHOT: i64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    HrTimer,
    CpuTimer,
    BroadcastTick,
    CpuTick,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimerKind::HrTimer => "HR timer",
            TimerKind::CpuTimer => "CPU timer",
            TimerKind::BroadcastTick => "Tick",
            TimerKind::CpuTick => "Tick (CPU)",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerRecord {
    pub cpu: usize,
    pub kind: TimerKind,
    pub expires: i64,
}

/// One pass over the timer view.
#[derive(Clone, Debug, Default)]
pub struct TimerScan {
    /// The global `now` nanosecond value, or `KTIME_MAX` when the
    /// header was not recognized.
    pub now: i64,
    pub records: Vec<TimerRecord>,
}

impl TimerScan {
    pub fn empty(now: i64) -> TimerScan {
        TimerScan {
            now,
            records: Vec::new(),
        }
    }

    /// The set of CPUs with at least one record.
    pub fn cpus(&self) -> Cpumask {
        let mut mask = Cpumask::new();
        for rec in &self.records {
            let _ = mask.set_cpu(rec.cpu);
        }
        mask
    }
}

/// Accumulator rule for a slot's last-timer value: keep the latest
/// expiration, resetting to the sentinel once the stored value falls
/// into the past relative to the observed `now`.
pub fn update_last_timer(last: i64, expires: i64, now: i64) -> i64 {
    if last == KTIME_MAX {
        expires
    } else if last.wrapping_sub(now) < 0 {
        KTIME_MAX
    } else if last.wrapping_sub(expires) < 0 {
        expires
    } else {
        last
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Start,
    CpuList,
    Cpu,
    Active,
    ActiveRecord,
    Tdev,
    TdevBcast,
    TdevCpu,
}

const KNOWN_CPU: u8 = 0x01;
const KNOWN_STATE: u8 = 0x02;
const KNOWN_NEXT_EVENT: u8 = 0x04;
const KNOWN_BCAST_SET: u8 = 0x08;
const KNOWN_BCAST_OS_SET: u8 = 0x10;

/// Parse the integer at the start of `s`, ignoring leading whitespace
/// and anything after the digits.
fn leading_num(s: &str) -> Option<i64> {
    let t = s.trim_start();
    let neg = t.starts_with('-');
    let t = t.strip_prefix('-').unwrap_or(t);
    let end = t
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(t.len());
    if end == 0 {
        return None;
    }
    t[..end].parse::<i64>().ok().map(|v| if neg { -v } else { v })
}

/// Consume one expected word from the front of `s`, returning the rest.
fn skip_word<'a>(s: &'a str, word: &str) -> Option<&'a str> {
    let t = s.trim_start();
    let rest = t.strip_prefix(word)?;
    if rest.starts_with(|c: char| !c.is_whitespace()) && !rest.is_empty() {
        return None;
    }
    Some(rest)
}

/// First line of an hrtimer description:
/// ` #0: <ffff8003fda67bd0>, tick_sched_timer, S:01`.
/// Returns the timer state; a missing `S:` field counts as enqueued.
fn hrtimer_parse_line_1(s: &str) -> Option<i64> {
    let (count, rest) = s.split_once(':')?;
    leading_num(count)?;
    let mut fields = rest.splitn(3, ',');
    fields.next()?;
    fields.next()?;
    let tail = fields.next()?.trim_start();
    match tail.strip_prefix("S:") {
        Some(state) => Some(leading_num(state).unwrap_or(1)),
        None => Some(1),
    }
}

/// Second line of an hrtimer description:
/// ` # expires at <soft>-<hard> nsecs [...]`.
fn hrtimer_parse_line_2(s: &str) -> Option<(i64, i64)> {
    let rest = skip_word(s, "expires")?;
    let rest = skip_word(rest, "at")?;
    let (soft, hard) = rest.split_once('-')?;
    Some((leading_num(soft)?, leading_num(hard)?))
}

/// One pass over the timer view text.
pub fn parse_timer_list(text: &str) -> TimerScan {
    let mut scan = TimerScan::empty(KTIME_MAX);
    let mut state = ParserState::Start;
    let mut curr_cpu: i64 = -1;
    let mut hrtimer_state: i64 = 0;
    let mut hrtimer_err = false;
    let mut tick_dev_cpu: i64 = -1;
    let mut tick_dev_state: i64 = 0;
    let mut tick_dev_next: i64 = KTIME_MAX;
    let mut tick_dev_known: u8 = 0;
    let mut tick_dev_mask = Cpumask::new();
    let mut tick_dev_os_mask = Cpumask::new();

    for raw in text.lines() {
        let line = raw.trim_start();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('#') {
            match state {
                ParserState::Active => {
                    state = ParserState::ActiveRecord;
                    match hrtimer_parse_line_1(rest) {
                        Some(s) => {
                            hrtimer_state = s;
                            hrtimer_err = false;
                        }
                        None => hrtimer_err = true,
                    }
                }
                ParserState::ActiveRecord => {
                    state = ParserState::Active;
                    if let Some((soft, hard)) = hrtimer_parse_line_2(rest) {
                        if !hrtimer_err
                            && hrtimer_state != HRTIMER_STATE_INACTIVE
                            && (hard != KTIME_MAX || soft != KTIME_MAX)
                            && curr_cpu >= 0
                        {
                            scan.records.push(TimerRecord {
                                cpu: curr_cpu as usize,
                                kind: TimerKind::HrTimer,
                                expires: hard,
                            });
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        let rest = &line[token.len()..];

        match token {
            "now" => {
                if state == ParserState::Start {
                    if let Some(rest) = skip_word(rest, "at") {
                        if let Some(v) = leading_num(rest) {
                            scan.now = v;
                            state = ParserState::CpuList;
                        }
                    }
                }
            }
            "cpu:" => {
                if matches!(
                    state,
                    ParserState::CpuList | ParserState::Cpu | ParserState::Active
                ) {
                    if let Some(v) = leading_num(rest) {
                        curr_cpu = v;
                        state = ParserState::Cpu;
                    }
                }
            }
            "active" => {
                if state == ParserState::Cpu && skip_word(rest, "timers:").is_some() {
                    state = ParserState::Active;
                }
            }
            ".expires_next" => {
                if matches!(state, ParserState::Cpu | ParserState::Active) {
                    if let Some(rest) = skip_word(rest, ":") {
                        if let Some(v) = leading_num(rest) {
                            state = ParserState::CpuList;
                            if v != KTIME_MAX && curr_cpu >= 0 {
                                scan.records.push(TimerRecord {
                                    cpu: curr_cpu as usize,
                                    kind: TimerKind::CpuTimer,
                                    expires: v,
                                });
                            }
                        }
                    }
                }
            }
            "Tick" => {
                if let Some(rest) = skip_word(rest, "Device:") {
                    if let Some(rest) = skip_word(rest, "mode:") {
                        if leading_num(rest).is_some() {
                            state = ParserState::Tdev;
                        }
                    }
                }
            }
            "Broadcast" => {
                if state == ParserState::Tdev && skip_word(rest, "device").is_some() {
                    state = ParserState::TdevBcast;
                    tick_dev_known = 0;
                }
            }
            "Per" => {
                if state == ParserState::Tdev {
                    if let Some(rest) = skip_word(rest, "CPU") {
                        if let Some(rest) = skip_word(rest, "device:") {
                            if let Some(v) = leading_num(rest) {
                                tick_dev_cpu = v;
                                state = ParserState::TdevCpu;
                                tick_dev_known = KNOWN_CPU;
                            }
                        }
                    }
                }
            }
            "mode:" => {
                if matches!(state, ParserState::TdevBcast | ParserState::TdevCpu) {
                    if let Some(v) = leading_num(rest) {
                        tick_dev_state = v;
                        tick_dev_known |= KNOWN_STATE;
                    }
                }
            }
            "next_event:" => {
                if matches!(state, ParserState::TdevBcast | ParserState::TdevCpu) {
                    if let Some(v) = leading_num(rest) {
                        tick_dev_next = v;
                        tick_dev_known |= KNOWN_NEXT_EVENT;
                    }
                }
            }
            "tick_broadcast_mask:" => {
                if state == ParserState::TdevBcast {
                    tick_dev_mask = Cpumask::from_str(rest.trim()).unwrap_or_default();
                    tick_dev_known |= KNOWN_BCAST_SET;
                }
            }
            "tick_broadcast_oneshot_mask:" => {
                if state == ParserState::TdevBcast {
                    tick_dev_os_mask = Cpumask::from_str(rest.trim()).unwrap_or_default();
                    tick_dev_known |= KNOWN_BCAST_OS_SET;
                }
            }
            _ => {}
        }

        let ticking = tick_dev_state == CLOCK_EVT_STATE_PERIODIC
            || tick_dev_state == CLOCK_EVT_STATE_ONESHOT;
        match state {
            ParserState::TdevCpu => {
                const NEED: u8 = KNOWN_CPU | KNOWN_STATE | KNOWN_NEXT_EVENT;
                if tick_dev_known & NEED == NEED
                    && ticking
                    && tick_dev_next != KTIME_MAX
                    && tick_dev_cpu >= 0
                {
                    scan.records.push(TimerRecord {
                        cpu: tick_dev_cpu as usize,
                        kind: TimerKind::CpuTick,
                        expires: tick_dev_next,
                    });
                    tick_dev_known = 0;
                }
            }
            ParserState::TdevBcast => {
                const NEED: u8 =
                    KNOWN_STATE | KNOWN_NEXT_EVENT | KNOWN_BCAST_SET | KNOWN_BCAST_OS_SET;
                if tick_dev_known & NEED == NEED {
                    if ticking
                        && tick_dev_next != KTIME_MAX
                        && (!tick_dev_mask.is_empty() || !tick_dev_os_mask.is_empty())
                    {
                        for cpu in tick_dev_mask.or(&tick_dev_os_mask).iter() {
                            scan.records.push(TimerRecord {
                                cpu,
                                kind: TimerKind::BroadcastTick,
                                expires: tick_dev_next,
                            });
                        }
                    }
                    tick_dev_known = 0;
                }
            }
            _ => {}
        }
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Timer List Version: v0.8
HRTIMER_MAX_CLOCK_BASES: 4
now at 80521821118000 nsecs

cpu: 0
 clock 0:
  .base:       ffff8003fda58d80
  .index:      0
  .resolution: 1 nsecs
  .get_time:   ktime_get
 active timers:
 #0: <ffff8003fda67bd0>, tick_sched_timer, S:01
 # expires at 80521860000000-80521860000000 nsecs [in 38882000 to 38882000 nsecs]
 #1: <ffff8003f6d0bb30>, hrtimer_wakeup, S:00
 # expires at 80522109418970-80522169418970 nsecs [in 288300970 to 348300970 nsecs]
  .expires_next   : 80521860000000 nsecs
  .hres_active    : 1
  .nr_events      : 19689092
cpu: 2
 clock 0:
  .base:       ffff8003fda58e00
 active timers:
  .expires_next   : 9223372036854775807 nsecs
  .hres_active    : 1

Tick Device: mode:     1
Broadcast device
Clock Event Device: bc_hrtimer
 max_delta_ns:   9223372036854775807
 mode:           1
 next_event:     9223372036854775807 nsecs
 event_handler:  tick_handle_oneshot_broadcast
tick_broadcast_mask: 000000
tick_broadcast_oneshot_mask: 000000

Tick Device: mode:     1
Per CPU device: 0
Clock Event Device: arch_sys_timer
 max_delta_ns:   21474836451
 mode:           3
 next_event:     80522484000000 nsecs
 event_handler:  hrtimer_interrupt

Tick Device: mode:     1
Per CPU device: 2
Clock Event Device: arch_sys_timer
 mode:           1
 next_event:     9223372036854775807 nsecs
 event_handler:  hrtimer_interrupt
";

    #[test]
    fn test_parse_sample() {
        let scan = parse_timer_list(SAMPLE);
        assert_eq!(scan.now, 80521821118000);

        // The enqueued hrtimer counts, the inactive (S:00) one does not.
        let hr: Vec<_> = scan
            .records
            .iter()
            .filter(|r| r.kind == TimerKind::HrTimer)
            .collect();
        assert_eq!(hr.len(), 1);
        assert_eq!(hr[0].cpu, 0);
        assert_eq!(hr[0].expires, 80521860000000);

        // expires_next on cpu 0 counts; the sentinel on cpu 2 does not.
        let ct: Vec<_> = scan
            .records
            .iter()
            .filter(|r| r.kind == TimerKind::CpuTimer)
            .collect();
        assert_eq!(ct.len(), 1);
        assert_eq!(ct[0].cpu, 0);

        // The shutdown broadcast device and the stopped per-CPU device
        // on cpu 2 are ignored; the oneshot device on cpu 0 counts.
        let ticks: Vec<_> = scan
            .records
            .iter()
            .filter(|r| r.kind == TimerKind::CpuTick)
            .collect();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].cpu, 0);
        assert_eq!(ticks[0].expires, 80522484000000);
        assert!(!scan
            .records
            .iter()
            .any(|r| r.kind == TimerKind::BroadcastTick));

        let cpus = scan.cpus();
        assert!(cpus.test_cpu(0));
        assert!(!cpus.test_cpu(2));
    }

    #[test]
    fn test_parse_tolerates_garbage() {
        let scan = parse_timer_list("utter nonsense\nnow at x nsecs\ncpu: zero\n");
        assert_eq!(scan.now, KTIME_MAX);
        assert!(scan.records.is_empty());
    }

    #[test]
    fn test_broadcast_mask_expansion() {
        let text = "\
now at 1000 nsecs
Tick Device: mode:     1
Broadcast device
 mode:           3
 next_event:     2000 nsecs
tick_broadcast_mask: 000005
tick_broadcast_oneshot_mask: 000000
";
        let scan = parse_timer_list(text);
        let cpus: Vec<_> = scan
            .records
            .iter()
            .filter(|r| r.kind == TimerKind::BroadcastTick)
            .map(|r| r.cpu)
            .collect();
        assert_eq!(cpus, vec![0, 2]);
    }

    #[test]
    fn test_update_last_timer() {
        // First record latches.
        assert_eq!(update_last_timer(KTIME_MAX, 500, 100), 500);
        // Later expiration wins.
        assert_eq!(update_last_timer(500, 900, 100), 900);
        // Earlier expiration does not regress the value.
        assert_eq!(update_last_timer(900, 500, 100), 900);
        // A stale value resets to the sentinel.
        assert_eq!(update_last_timer(50, 900, 100), KTIME_MAX);
    }
}
