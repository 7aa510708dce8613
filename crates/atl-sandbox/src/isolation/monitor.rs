//! Resource accounting for local process trees
//!
//! Runs on the local process backend have no kernel-side accounting the
//! engine can read back, so their ceilings are policed by sampling: resident
//! memory is summed over every live member of the run, CPU time accumulates
//! per member (including members that already exited).
//!
//! A process belongs to a run when it descends from the run's root process
//! or still sits in the root's process group.

use crate::types::ResourceLimits;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid as NixPid};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System};

// Longest parent chain followed when deciding membership.
const MAX_DEPTH: usize = 64;

/// Aggregate usage of one run's processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Usage {
    /// Resident memory summed over live members
    pub(crate) memory_bytes: u64,
    /// CPU time of every member seen so far
    pub(crate) cpu_time: Duration,
    /// Live members
    pub(crate) processes: usize,
}

/// Ceiling a sample went over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Breach {
    Memory,
    Cpu,
}

impl Usage {
    /// First ceiling this sample breaches, memory before CPU
    pub(crate) fn breach(&self, limits: &ResourceLimits) -> Option<Breach> {
        if self.memory_bytes > limits.max_memory_bytes {
            Some(Breach::Memory)
        } else if self.cpu_time >= Duration::from_secs(limits.max_cpu_seconds) {
            Some(Breach::Cpu)
        } else {
            None
        }
    }
}

/// Sampler for the processes of one run
#[derive(Debug)]
pub(crate) struct ProcessTree {
    root: Pid,
    system: System,
    cpu_millis: HashMap<Pid, u64>,
}

impl ProcessTree {
    pub(crate) fn new(root: u32) -> Self {
        Self {
            root: Pid::from_u32(root),
            system: System::new(),
            cpu_millis: HashMap::new(),
        }
    }

    /// Refresh the process table and total the run's usage
    ///
    /// Blocking: reads the whole process table.
    pub(crate) fn sample(&mut self) -> Usage {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let group = process_group(self.root.as_u32());
        let mut usage = Usage::default();
        for (pid, process) in self.system.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            if !descends_from(&self.system, *pid, self.root)
                && (group.is_none() || process_group(pid.as_u32()) != group)
            {
                continue;
            }
            usage.memory_bytes = usage.memory_bytes.saturating_add(process.memory());
            usage.processes += 1;
            self.cpu_millis.insert(*pid, process.accumulated_cpu_time());
        }
        usage.cpu_time = Duration::from_millis(self.cpu_millis.values().sum());
        usage
    }
}

fn descends_from(system: &System, mut pid: Pid, root: Pid) -> bool {
    for _ in 0..MAX_DEPTH {
        if pid == root {
            return true;
        }
        match system.process(pid).and_then(Process::parent) {
            Some(parent) => pid = parent,
            None => return false,
        }
    }
    false
}

fn process_group(pid: u32) -> Option<u32> {
    let pid = i32::try_from(pid).ok()?;
    let group = getpgid(Some(NixPid::from_raw(pid))).ok()?;
    u32::try_from(group.as_raw()).ok()
}

/// Send `SIGKILL` to every member of process group `pgid`
///
/// Returns `false` when the group no longer exists.
pub(crate) fn kill_group(pgid: u32) -> bool {
    let Some(raw) = i32::try_from(pgid).ok().filter(|p| *p > 1) else {
        return false;
    };
    match killpg(NixPid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pgid, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Members of group `pgid` that were already running at `cutoff`
///
/// A group id can only be handed out again once every member is gone, so a
/// group that still holds processes started before `cutoff` is the same
/// group that existed at `cutoff`.
pub(crate) fn members_started_before(pgid: u32, cutoff: SystemTime) -> usize {
    let cutoff = cutoff
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.thread_kind().is_none())
        .filter(|(pid, process)| {
            process.start_time() <= cutoff && process_group(pid.as_u32()) == Some(pgid)
        })
        .count()
}
