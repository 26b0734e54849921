use log::{debug, warn};
use perf_event_open_sys as sys;
use std::{
    fmt::Display,
    fs::{self, File},
    io::{self, Read},
    os::{
        fd::{AsRawFd, FromRawFd, RawFd},
        raw::c_ulong,
    },
};

use crate::{Error, Result};

const PERF_EVENT_PARANOID: &str = "/proc/sys/kernel/perf_event_paranoid";

/// What a cycle counter observes.
///
/// Only some combination of (pid, cpu) are valid for perf_event_open,
/// each variant maps to one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterScope {
    /// All processes, one CPU.
    Cpu(u32),
    /// One task, and the threads it creates after the counter is opened, any CPU.
    /// A whole process needs one counter per existing thread.
    Process(i32),
    /// All the tasks of a cgroup, one CPU.
    /// The directory descriptor only has to stay valid while the counter is opened.
    Cgroup { cgroup_fd: RawFd, cpu: u32 },
}

impl CounterScope {
    /// Returns the `(pid, cpu, flags)` arguments of perf_event_open.
    fn syscall_args(&self) -> (i32, i32, c_ulong) {
        match *self {
            CounterScope::Cpu(cpu) => (-1, cpu as i32, 0),
            CounterScope::Process(pid) => (pid, -1, 0),
            CounterScope::Cgroup { cgroup_fd, cpu } => {
                (cgroup_fd, cpu as i32, sys::bindings::PERF_FLAG_PID_CGROUP as c_ulong)
            }
        }
    }
}

impl Display for CounterScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterScope::Cpu(cpu) => write!(f, "cpu {cpu}"),
            CounterScope::Process(pid) => write!(f, "process {pid}"),
            CounterScope::Cgroup { cgroup_fd, cpu } => {
                write!(f, "cgroup fd {cgroup_fd} on cpu {cpu}")
            }
        }
    }
}

/// A hardware CPU-cycles counter.
///
/// Reading the counter resets it, so every value returned by [`CycleCounter::read_and_reset`]
/// covers the time elapsed since the previous read (or since the counter was opened).
/// There is deliberately no way to peek at the counter without resetting it.
#[derive(Debug)]
pub struct CycleCounter {
    /// `None` once closed.
    fd: Option<File>,
    scope: CounterScope,
    /// Total at the previous read, for inherited counters. RESET does not clear
    /// the counts of the inherited child events, so these are read as a difference.
    inherited_total: Option<u64>,
}

impl CycleCounter {
    pub fn open_cpu(cpu: u32) -> Result<CycleCounter> {
        Self::open(CounterScope::Cpu(cpu))
    }

    /// Counts the task `tid` and the threads it spawns afterwards.
    pub fn open_process(tid: i32) -> Result<CycleCounter> {
        Self::open(CounterScope::Process(tid))
    }

    /// Cgroup counters must be opened per-CPU: in cgroup mode the kernel does not
    /// aggregate the CPUs in one descriptor.
    pub fn open_cgroup(cgroup_fd: RawFd, cpu: u32) -> Result<CycleCounter> {
        Self::open(CounterScope::Cgroup { cgroup_fd, cpu })
    }

    /// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
    /// for `PERF_COUNT_HW_CPU_CYCLES`, then reset and enable the counter.
    ///
    /// The counter is created disabled so that nothing is counted before the reset.
    pub fn open(scope: CounterScope) -> Result<CycleCounter> {
        let (pid, cpu, flags) = scope.syscall_args();

        let mut attr = sys::bindings::perf_event_attr::default();
        attr.size = core::mem::size_of_val(&attr) as u32;
        attr.type_ = sys::bindings::PERF_TYPE_HARDWARE;
        attr.config = sys::bindings::PERF_COUNT_HW_CPU_CYCLES as u64;
        attr.set_disabled(1);
        attr.set_exclude_kernel(0);
        attr.set_exclude_hv(1);
        let inherit = matches!(scope, CounterScope::Process(_));
        if inherit {
            attr.set_inherit(1);
        }

        let flags = flags | sys::bindings::PERF_FLAG_FD_CLOEXEC as c_ulong;
        let result = unsafe { sys::perf_event_open(&mut attr, pid, cpu, -1, flags) };
        if result == -1 {
            return Err(unavailable(scope, io::Error::last_os_error()));
        }
        let fd = unsafe { File::from_raw_fd(result) };

        let raw = fd.as_raw_fd();
        if unsafe { sys::ioctls::RESET(raw, 0) } == -1 || unsafe { sys::ioctls::ENABLE(raw, 0) } == -1 {
            return Err(unavailable(scope, io::Error::last_os_error()));
        }
        debug!("cycle counter opened for {scope}");

        Ok(CycleCounter {
            fd: Some(fd),
            scope,
            inherited_total: inherit.then_some(0),
        })
    }

    pub fn scope(&self) -> CounterScope {
        self.scope
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Returns the number of cycles counted since the last call, and resets the counter to zero.
    ///
    /// A failed read, or a closed counter, counts as zero cycles for the interval.
    pub fn read_and_reset(&mut self) -> u64 {
        let Some(fd) = self.fd.as_mut() else {
            return 0;
        };
        let res = match self.inherited_total.as_mut() {
            Some(previous) => read_perf_event(fd).map(|total| {
                let value = total.saturating_sub(*previous);
                *previous = total;
                value
            }),
            None => read_perf_event(fd).and_then(|value| reset(fd).map(|_| value)),
        };
        match res {
            Ok(value) => value,
            Err(e) => {
                debug!("failed to read cycle counter for {}: {e}", self.scope);
                0
            }
        }
    }

    /// Disables the counter and releases its descriptor. Closing twice does nothing.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe { sys::ioctls::DISABLE(fd.as_raw_fd(), 0) };
            debug!("cycle counter closed for {}", self.scope);
        }
    }
}

impl Drop for CycleCounter {
    fn drop(&mut self) {
        self.close()
    }
}

fn read_perf_event(fd: &mut File) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    // rewind() is INVALID for perf events, we must read "at the cursor" every time
    fd.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn reset(fd: &File) -> io::Result<()> {
    if unsafe { sys::ioctls::RESET(fd.as_raw_fd(), 0) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn unavailable(scope: CounterScope, source: io::Error) -> Error {
    Error::CounterUnavailable {
        scope: scope.to_string(),
        paranoid: paranoid_level(),
        source,
    }
}

/// Current value of `perf_event_paranoid`, which is the usual reason for a counter to be unavailable.
pub fn paranoid_level() -> String {
    fs::read_to_string(PERF_EVENT_PARANOID)
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Opens one counter per CPU, with the scope given by `scope_of`.
///
/// CPUs whose counter cannot be opened are skipped: cycle accounting is
/// best-effort, the caller keeps monitoring the other metrics.
pub fn open_per_cpu(
    cpus: &[u32],
    what: &str,
    scope_of: impl Fn(u32) -> CounterScope,
) -> Vec<CycleCounter> {
    let mut counters = Vec::with_capacity(cpus.len());
    let mut first_error = None;
    for &cpu in cpus {
        match CycleCounter::open(scope_of(cpu)) {
            Ok(c) => counters.push(c),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        warn!(
            "cycle counters unavailable on {}/{} CPUs for {what}: {e}",
            cpus.len() - counters.len(),
            cpus.len()
        );
    }
    counters
}

/// Reads all the counters back-to-back and returns the sum.
pub fn read_all(counters: &mut [CycleCounter]) -> u64 {
    counters.iter_mut().map(CycleCounter::read_and_reset).sum()
}
