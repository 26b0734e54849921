//! The kinds of entities that can be monitored, behind one interface.

use std::{
    fs::{self, File},
    io::{self, ErrorKind},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use log::warn;
use procfs::{process::Process, ProcError};

use crate::{
    perf_event::{open_per_cpu, CounterScope, CycleCounter},
    stats::{self, CgroupIoStat, ResourceCounters},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    System,
    Process,
    Container,
    Cgroup,
}

/// Something whose resource usage can be sampled: the whole system, a process, a container...
pub trait ResourceProbe: Send {
    fn kind(&self) -> EntityKind;

    /// Identifier of the entity, unique among the entities of the same kind.
    fn identifier(&self) -> String;

    /// Reads the cumulative counters of the entity.
    ///
    /// Returns [`Error::EntityTerminated`] if the entity does not exist anymore.
    fn sample(&mut self) -> Result<ResourceCounters>;

    /// Opens the cycle counters of the entity. Best-effort: an empty Vec means that
    /// the entity is monitored without cycles (and thus gets no energy).
    fn open_cycle_counters(&self, cpus: &[u32]) -> Vec<CycleCounter>;
}

/// A process and its threads, read from `/proc/<pid>`.
#[derive(Debug)]
pub struct ProcessProbe {
    pid: i32,
    ticks_per_second: u64,
}

impl ProcessProbe {
    pub fn new(pid: i32) -> ProcessProbe {
        ProcessProbe {
            pid,
            ticks_per_second: procfs::ticks_per_second(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn thread_ids(&self) -> procfs::ProcResult<Vec<i32>> {
        let process = Process::new(self.pid)?;
        let tids = process.tasks()?.flatten().map(|task| task.tid).collect();
        Ok(tids)
    }

    fn terminated(&self, file: &str, e: ProcError) -> Error {
        Error::EntityTerminated {
            id: format!("process {}", self.pid),
            path: Path::new("/proc").join(self.pid.to_string()).join(file),
            source: proc_error(e),
        }
    }
}

impl ResourceProbe for ProcessProbe {
    fn kind(&self) -> EntityKind {
        EntityKind::Process
    }

    fn identifier(&self) -> String {
        self.pid.to_string()
    }

    fn sample(&mut self) -> Result<ResourceCounters> {
        let process = Process::new(self.pid).map_err(|e| self.terminated("", e))?;
        let stat = process.stat().map_err(|e| self.terminated("stat", e))?;
        if stat.state == 'Z' || stat.state == 'X' {
            return Err(Error::EntityTerminated {
                id: format!("process {}", self.pid),
                path: Path::new("/proc").join(self.pid.to_string()).join("stat"),
                source: io::Error::new(ErrorKind::NotFound, format!("process is in state {}", stat.state)),
            });
        }
        let io = process.io().map_err(|e| self.terminated("io", e))?;
        let status = process.status().map_err(|e| self.terminated("status", e))?;

        Ok(ResourceCounters {
            cpu_time_us: stats::ticks_to_micros(stat.utime + stat.stime, self.ticks_per_second),
            memory_bytes: status.vmrss.unwrap_or(0) * 1024,
            io_ops: io.syscr + io.syscw,
        })
    }

    /// One counter per thread of the process. The threads created later are
    /// counted by the counter of the thread that spawns them.
    fn open_cycle_counters(&self, _cpus: &[u32]) -> Vec<CycleCounter> {
        let tids = match self.thread_ids() {
            Ok(tids) => tids,
            Err(e) => {
                warn!("process {} will be monitored without cycles: {e}", self.pid);
                return Vec::new();
            }
        };
        let mut counters = Vec::with_capacity(tids.len());
        let mut first_error = None;
        for tid in tids {
            match CycleCounter::open_process(tid) {
                Ok(c) => counters.push(c),
                // the thread may have exited in between
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let (true, Some(e)) = (counters.is_empty(), first_error) {
            warn!("process {} will be monitored without cycles: {e}", self.pid);
        }
        counters
    }
}

fn proc_error(e: ProcError) -> io::Error {
    let kind = match &e {
        ProcError::NotFound(_) => ErrorKind::NotFound,
        ProcError::PermissionDenied(_) => ErrorKind::PermissionDenied,
        _ => ErrorKind::Other,
    };
    io::Error::new(kind, e.to_string())
}

/// A container, i.e. a cgroup v2 directory in the container slice.
#[derive(Debug)]
pub struct ContainerProbe {
    id: String,
    dir: PathBuf,
}

impl ContainerProbe {
    pub fn new(id: impl Into<String>, dir: PathBuf) -> ContainerProbe {
        ContainerProbe { id: id.into(), dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads one of the statistic files. Failing to open it means that the container is gone.
    fn read(&self, file: &str) -> Result<String> {
        let path = self.dir.join(file);
        fs::read_to_string(&path).map_err(|source| Error::EntityTerminated {
            id: format!("container {}", self.id),
            path,
            source,
        })
    }
}

impl ResourceProbe for ContainerProbe {
    fn kind(&self) -> EntityKind {
        EntityKind::Container
    }

    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn sample(&mut self) -> Result<ResourceCounters> {
        let cpu_time_us = stats::parse_cpu_usage(&self.read("cpu.stat")?)?;
        // only the first device is accounted for containers
        let io = CgroupIoStat::parse_first(&self.read("io.stat")?)?;
        let memory_bytes = stats::parse_single_value("memory.current", &self.read("memory.current")?)?;
        Ok(ResourceCounters {
            cpu_time_us,
            memory_bytes,
            io_ops: io.ops(),
        })
    }

    fn open_cycle_counters(&self, cpus: &[u32]) -> Vec<CycleCounter> {
        let dir = match File::open(&self.dir) {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "cannot open {:?}, container {} is monitored without cycles: {e}",
                    self.dir, self.id
                );
                return Vec::new();
            }
        };
        let fd = dir.as_raw_fd();
        open_per_cpu(cpus, &format!("container {}", self.id), |cpu| CounterScope::Cgroup {
            cgroup_fd: fd,
            cpu,
        })
    }
}

/// The whole machine: `/proc/stat`, `/proc/meminfo` and `/proc/diskstats`.
#[derive(Debug)]
pub struct SystemProbe {
    ticks_per_second: u64,
}

impl SystemProbe {
    pub fn new() -> SystemProbe {
        SystemProbe {
            ticks_per_second: procfs::ticks_per_second(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn kind(&self) -> EntityKind {
        EntityKind::System
    }

    fn identifier(&self) -> String {
        "system".to_owned()
    }

    fn sample(&mut self) -> Result<ResourceCounters> {
        // everything but idle
        let cpu = procfs::KernelStats::new().map_err(proc_error)?.total;
        let busy_ticks = cpu.user
            + cpu.nice
            + cpu.system
            + [cpu.iowait, cpu.irq, cpu.softirq, cpu.steal, cpu.guest, cpu.guest_nice]
                .into_iter()
                .flatten()
                .sum::<u64>();

        let meminfo = procfs::Meminfo::new().map_err(proc_error)?;

        // loop devices are virtual, their I/O ends up on real devices
        let io_ops = procfs::diskstats()
            .map_err(proc_error)?
            .into_iter()
            .filter(|d| !d.name.starts_with("loop"))
            .map(|d| d.reads as u64 + d.writes as u64)
            .sum();

        Ok(ResourceCounters {
            cpu_time_us: stats::ticks_to_micros(busy_ticks, self.ticks_per_second),
            memory_bytes: meminfo.mem_total.saturating_sub(meminfo.mem_free),
            io_ops,
        })
    }

    fn open_cycle_counters(&self, cpus: &[u32]) -> Vec<CycleCounter> {
        open_per_cpu(cpus, "the system", CounterScope::Cpu)
    }
}
