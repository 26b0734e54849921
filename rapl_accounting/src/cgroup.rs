//! An ephemeral cgroup v2 in which a measured program runs.

use std::{
    ffi::OsStr,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info, warn};

use crate::{
    perf_event::{open_per_cpu, read_all, CounterScope, CycleCounter},
    stats::{self, CgroupIoStat},
    Error, Result,
};

const SCOPE_PREFIX: &str = "benchmarking_";
const CONTROLLERS: &str = "+cpu +memory +io";

/// Aggregated statistics of a cgroup scope, read once the measured program has ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CgroupStats {
    pub cpu_time_us: u64,
    pub peak_rss_bytes: u64,
    /// Read + write operations, on all the devices.
    pub io_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cycles: u64,
}

/// The cgroup `<root>/benchmarking_<pid>`, with one cycle counter per CPU.
#[derive(Debug)]
pub struct CgroupScope {
    root: PathBuf,
    path: PathBuf,
    /// The directory must stay open while the counters are opened.
    dir: Option<File>,
    counters: Vec<CycleCounter>,
    created: bool,
}

impl CgroupScope {
    pub fn new(root: &Path, owner_pid: u32) -> CgroupScope {
        CgroupScope {
            root: root.to_path_buf(),
            path: root.join(format!("{SCOPE_PREFIX}{owner_pid}")),
            dir: None,
            counters: Vec::new(),
            created: false,
        }
    }

    /// The scope owned by the current process.
    pub fn for_this_process(root: &Path) -> CgroupScope {
        Self::new(root, std::process::id())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file to write a pid into, to move that process into the scope.
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    pub fn cycle_counters(&self) -> usize {
        self.counters.len()
    }

    /// (Re)creates the cgroup, with fresh counters.
    ///
    /// A leftover directory, from a previous run or a crash, is removed first.
    pub fn reset(&mut self, cpus: &[u32]) -> Result<()> {
        self.counters.iter_mut().for_each(CycleCounter::close);
        self.counters.clear();
        self.dir = None;

        self.enable_controllers();

        match fs::remove_dir(&self.path) {
            Ok(()) => debug!("removed stale cgroup {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => debug!("cannot remove {:?}: {e}", self.path),
        }
        fs::create_dir(&self.path).map_err(|source| self.setup_error(source))?;
        self.created = true;

        let dir = File::open(&self.path).map_err(|source| self.setup_error(source))?;
        let fd = dir.as_raw_fd();
        let what = format!("cgroup {:?}", self.path);
        self.counters = open_per_cpu(cpus, &what, |cpu| CounterScope::Cgroup { cgroup_fd: fd, cpu });
        self.dir = Some(dir);
        info!("cgroup scope ready at {:?}", self.path);
        Ok(())
    }

    /// Makes sure that the controllers, and thus the statistic files, are available
    /// in the children of the root.
    fn enable_controllers(&self) {
        let control = self.root.join("cgroup.subtree_control");
        // never create it: if it doesn't exist, there is nothing to enable
        let res = OpenOptions::new()
            .write(true)
            .open(&control)
            .and_then(|mut f| f.write_all(CONTROLLERS.as_bytes()));
        if let Err(e) = res {
            if e.kind() != ErrorKind::NotFound {
                warn!("cannot enable '{CONTROLLERS}' in {control:?}: {e}");
            }
        }
    }

    fn setup_error(&self, source: std::io::Error) -> Error {
        Error::ScopeSetup {
            path: self.path.clone(),
            source,
        }
    }

    /// Builds the command that runs `command_line` in a shell placed inside the scope.
    ///
    /// The shell moves itself into the cgroup before running anything, so that the
    /// program and all its children are accounted. It exits with 125 if that fails.
    pub fn shell_command(&self, command_line: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"echo $$ > "$0" || exit 125; eval "$1""#)
            .arg(self.procs_path())
            .arg(command_line);
        cmd
    }

    /// Builds the command that runs the program `argv` inside the scope, without any shell
    /// interpretation of its arguments.
    ///
    /// Like [`CgroupScope::shell_command`], it exits with 125 if the cgroup cannot be joined.
    pub fn exec_command<S: AsRef<OsStr>>(&self, argv: &[S]) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"echo $$ > "$0" || exit 125; exec "$@""#)
            .arg(self.procs_path())
            .args(argv);
        cmd
    }

    /// Kills every process of the scope, if the kernel supports `cgroup.kill`.
    pub fn kill_all(&self) {
        let kill = self.path.join("cgroup.kill");
        let res = OpenOptions::new()
            .write(true)
            .open(&kill)
            .and_then(|mut f| f.write_all(b"1"));
        match res {
            Ok(()) => info!("killed the processes of {:?}", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => debug!("{kill:?} is not available"),
            Err(e) => warn!("failed to kill the processes of {:?}: {e}", self.path),
        }
    }

    /// Sums and closes the cycle counters, then reads the statistics of the scope.
    pub fn read_aggregate_stats(&mut self) -> Result<CgroupStats> {
        let cycles = read_all(&mut self.counters);
        self.counters.iter_mut().for_each(CycleCounter::close);

        let cpu_time_us = stats::parse_cpu_usage(&self.read("cpu.stat")?)?;
        let peak_rss_bytes = stats::parse_single_value("memory.peak", &self.read("memory.peak")?)?;
        let io = CgroupIoStat::sum(&CgroupIoStat::parse_all(&self.read("io.stat")?)?);

        Ok(CgroupStats {
            cpu_time_us,
            peak_rss_bytes,
            io_ops: io.ops(),
            read_bytes: io.rbytes,
            write_bytes: io.wbytes,
            cycles,
        })
    }

    fn read(&self, file: &str) -> Result<String> {
        let path = self.path.join(file);
        fs::read_to_string(&path).map_err(|source| Error::ScopeRead { path, source })
    }

    /// Closes the counters and removes the cgroup. Closing twice does nothing.
    pub fn close(&mut self) {
        self.counters.iter_mut().for_each(CycleCounter::close);
        self.counters.clear();
        self.dir = None;
        if self.created {
            self.created = false;
            match fs::remove_dir(&self.path) {
                Ok(()) => debug!("removed cgroup {:?}", self.path),
                Err(e) if e.kind() == ErrorKind::NotFound => (),
                Err(e) => warn!("failed to remove cgroup {:?}: {e}", self.path),
            }
        }
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        self.close();
    }
}
