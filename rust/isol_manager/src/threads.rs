// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Thread view of the kernel: `/proc/<pid>/task/<tid>/{status,stat}`.
//!
//! Every pass walks all numeric pid/tid directories and upserts a table
//! entry per thread with its allowed-CPU set, last CPU, and context
//! switch counts. Entries not seen in a pass are dropped. Threads that
//! match a managed slot's recorded (pid, tid) are linked to that slot so
//! the manager can show their state and exclude them from push-away.

use anyhow::Context;
use anyhow::Result;
use isol_utils::Cpumask;
use std::path::Path;

#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub pid: libc::pid_t,
    pub tid: libc::pid_t,
    pub name: String,
    pub cpus_allowed: Cpumask,
    /// CPU the thread last ran on, -1 when unknown.
    pub cpu: i32,
    pub vol_ctxt_switches: u64,
    pub nonvol_ctxt_switches: u64,
    /// Managed-slot index when this thread is a registered worker.
    pub slot: Option<usize>,
    updated: bool,
}

impl ThreadInfo {
    fn new(pid: libc::pid_t, tid: libc::pid_t) -> ThreadInfo {
        ThreadInfo {
            pid,
            tid,
            name: String::new(),
            cpus_allowed: Cpumask::new(),
            cpu: -1,
            vol_ctxt_switches: 0,
            nonvol_ctxt_switches: 0,
            slot: None,
            updated: false,
        }
    }

    /// Apply one line of the status view. Unrecognized lines are
    /// skipped, bad values abort only the field.
    fn update_from_status_line(&mut self, line: &str) {
        let Some((key, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim();
        match key {
            "Name" => self.name = value.to_string(),
            "Cpus_allowed" => {
                if let Ok(mask) = Cpumask::from_str(value) {
                    self.cpus_allowed = mask;
                }
            }
            "voluntary_ctxt_switches" => {
                if let Ok(v) = value.parse() {
                    self.vol_ctxt_switches = v;
                }
            }
            "nonvoluntary_ctxt_switches" => {
                if let Ok(v) = value.parse() {
                    self.nonvol_ctxt_switches = v;
                }
            }
            _ => {}
        }
    }

    /// Extract the processor field from the stat view. The comm field
    /// may contain anything, so fields are counted from the last `)`.
    fn update_from_stat(&mut self, line: &str) {
        let Some(pos) = line.rfind(')') else {
            return;
        };
        // processor is field 39; 36 fields separate it from state.
        if let Some(cpu) = line[pos + 1..]
            .split_whitespace()
            .nth(36)
            .and_then(|tok| tok.parse::<i32>().ok())
        {
            self.cpu = cpu;
        }
    }
}

#[derive(Default)]
pub struct ProcTable {
    entries: Vec<ThreadInfo>,
}

impl ProcTable {
    pub fn new() -> ProcTable {
        ProcTable::default()
    }

    pub fn entries(&self) -> &[ThreadInfo] {
        &self.entries
    }

    pub fn entry_for_slot(&self, slot: usize) -> Option<&ThreadInfo> {
        self.entries.iter().find(|e| e.slot == Some(slot))
    }

    /// Drop the managed link of a slot, used when its worker exits.
    pub fn unlink_slot(&mut self, slot: usize) {
        for e in &mut self.entries {
            if e.slot == Some(slot) {
                e.slot = None;
            }
        }
    }

    fn upsert(&mut self, mut info: ThreadInfo, link: &impl Fn(libc::pid_t, libc::pid_t) -> Option<usize>) {
        info.slot = link(info.pid, info.tid);
        info.updated = true;
        match self
            .entries
            .iter_mut()
            .find(|e| e.pid == info.pid && e.tid == info.tid)
        {
            Some(entry) => *entry = info,
            None => self.entries.push(info),
        }
    }

    /// Walk the thread directories under `proc_root` and refresh the
    /// table. Threads that disappeared since the previous pass are
    /// detached and removed.
    pub fn rescan(
        &mut self,
        proc_root: &Path,
        link: impl Fn(libc::pid_t, libc::pid_t) -> Option<usize>,
    ) -> Result<()> {
        for e in &mut self.entries {
            e.updated = false;
        }

        let procs = std::fs::read_dir(proc_root)
            .with_context(|| format!("Failed to read {}", proc_root.display()))?;
        for proc_entry in procs.flatten() {
            let Some(pid) = numeric_name(&proc_entry) else {
                continue;
            };
            let task_dir = proc_entry.path().join("task");
            let Ok(tasks) = std::fs::read_dir(&task_dir) else {
                continue;
            };
            for task_entry in tasks.flatten() {
                let Some(tid) = numeric_name(&task_entry) else {
                    continue;
                };
                let mut info = ThreadInfo::new(pid, tid);
                let base = task_entry.path();
                // The thread may vanish mid-walk; whatever was read
                // before that still counts.
                if let Ok(status) = std::fs::read_to_string(base.join("status")) {
                    for line in status.lines() {
                        info.update_from_status_line(line);
                    }
                } else {
                    continue;
                }
                if let Ok(stat) = std::fs::read_to_string(base.join("stat")) {
                    if let Some(line) = stat.lines().next() {
                        info.update_from_stat(line);
                    }
                }
                self.upsert(info, &link);
            }
        }

        self.entries.retain(|e| e.updated);
        Ok(())
    }

    /// Compute the affinity changes that push foreign threads off the
    /// isolation CPUs. For every unmanaged thread whose allowed set
    /// intersects `isol` and spans more than one CPU, the new set is the
    /// complement of the overlap within its allowed set, or `nonisol`
    /// when that complement is empty. Threads of the manager's own
    /// process are exempt, except the main thread itself. Threads bound
    /// to a single CPU are left alone even on an isolation CPU; the pin
    /// is treated as deliberate.
    pub fn push_away_plan(
        &self,
        isol: &Cpumask,
        nonisol: &Cpumask,
        my_pid: libc::pid_t,
    ) -> Vec<(libc::pid_t, Cpumask)> {
        let mut plan = Vec::new();
        for e in &self.entries {
            if e.slot.is_some() {
                continue;
            }
            if e.pid == my_pid && e.tid != my_pid {
                continue;
            }
            if e.cpus_allowed.weight() <= 1 {
                continue;
            }
            let overlap = e.cpus_allowed.and(isol);
            if overlap.is_empty() {
                continue;
            }
            let mut target = e.cpus_allowed.xor(&overlap);
            if target.is_empty() {
                target = nonisol.clone();
            }
            plan.push((e.tid, target));
        }
        plan
    }
}

fn numeric_name(entry: &std::fs::DirEntry) -> Option<libc::pid_t> {
    let name = entry.file_name();
    let name = name.to_str()?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_thread(
        root: &Path,
        pid: i32,
        tid: i32,
        name: &str,
        allowed: &str,
        cpu: i32,
    ) {
        let dir = root.join(pid.to_string()).join("task").join(tid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("status"),
            format!(
                "Name:\t{name}\nState:\tS (sleeping)\nCpus_allowed:\t{allowed}\n\
                 Cpus_allowed_list:\t0-3\nvoluntary_ctxt_switches:\t150\n\
                 nonvoluntary_ctxt_switches:\t7\n"
            ),
        )
        .unwrap();
        let mut stat_fields = vec!["S".to_string()];
        stat_fields.extend((4..=38).map(|n| n.to_string()));
        stat_fields.push(cpu.to_string());
        stat_fields.push("0".to_string());
        fs::write(
            dir.join("stat"),
            format!("{pid} ({name}) {}\n", stat_fields.join(" ")),
        )
        .unwrap();
    }

    #[test]
    fn test_rescan_and_detach() {
        let root = tempfile::tempdir().unwrap();
        write_thread(root.path(), 100, 100, "app", "f", 1);
        write_thread(root.path(), 100, 101, "app-worker", "4", 2);
        fs::create_dir_all(root.path().join("sys")).unwrap();

        let mut table = ProcTable::new();
        table
            .rescan(root.path(), |pid, tid| {
                (pid == 100 && tid == 101).then_some(0)
            })
            .unwrap();
        assert_eq!(table.entries().len(), 2);

        let main = table
            .entries()
            .iter()
            .find(|e| e.tid == 100)
            .unwrap();
        assert_eq!(main.name, "app");
        assert_eq!(main.cpus_allowed, Cpumask::from_str("f").unwrap());
        assert_eq!(main.cpu, 1);
        assert_eq!(main.vol_ctxt_switches, 150);
        assert_eq!(main.nonvol_ctxt_switches, 7);
        assert_eq!(main.slot, None);

        let worker = table.entry_for_slot(0).unwrap();
        assert_eq!(worker.tid, 101);

        // The worker thread goes away; the next pass drops it.
        fs::remove_dir_all(root.path().join("100").join("task").join("101")).unwrap();
        table.rescan(root.path(), |_, _| None).unwrap();
        assert_eq!(table.entries().len(), 1);
        assert!(table.entry_for_slot(0).is_none());
    }

    #[test]
    fn test_push_away_plan() {
        let root = tempfile::tempdir().unwrap();
        // Spans the isolation CPU 2 among others: must be narrowed.
        write_thread(root.path(), 100, 100, "wide", "f", 0);
        // Pinned to the isolation CPU alone: left as the user set it.
        write_thread(root.path(), 200, 200, "pinned", "4", 2);
        // Entirely inside the isolation set: pushed to the nonisol set.
        write_thread(root.path(), 300, 300, "inside", "c", 3);
        // Manager's own secondary thread: exempt.
        write_thread(root.path(), 400, 401, "mgr-helper", "f", 0);
        // A managed worker: exempt.
        write_thread(root.path(), 500, 501, "worker", "f", 2);

        let mut table = ProcTable::new();
        table
            .rescan(root.path(), |pid, tid| {
                (pid == 500 && tid == 501).then_some(0)
            })
            .unwrap();

        let isol = Cpumask::from_cpulist("2-3").unwrap();
        let nonisol = Cpumask::from_cpulist("0-1").unwrap();
        let mut plan = table.push_away_plan(&isol, &nonisol, 400);
        plan.sort_by_key(|(tid, _)| *tid);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].0, 100);
        assert_eq!(plan[0].1, Cpumask::from_cpulist("0-1").unwrap());
        assert_eq!(plan[1].0, 300);
        assert_eq!(plan[1].1, nonisol);
    }
}
