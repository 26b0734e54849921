//! Output of the measurements: a summary on stdout, and comma-separated lines in a log file.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use enum_map::EnumMap;
use rapl_accounting::{
    monitor::{CgroupRunReport, EntityReport, IntervalReport},
    RaplDomainType,
};
use time::OffsetDateTime;

const WRITER_BUFFER_CAPACITY: usize = 8192;

/// An append-only log file.
pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFile {
    /// Opens `logfile_<YYYYMMDDhhmmss>.txt` in the current directory.
    pub fn create_timestamped() -> anyhow::Result<LogFile> {
        // the local offset cannot always be determined (in multi-threaded programs)
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let format = time::format_description::parse("[year][month][day][hour][minute][second]")?;
        let name = format!("logfile_{}.txt", now.format(&format)?);
        Self::open(Path::new(&name))
    }

    pub fn open(path: &Path) -> anyhow::Result<LogFile> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {path:?}"))?;
        Ok(LogFile {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the system line, then one line per entity, and flushes.
    pub fn write_interval(&mut self, report: &IntervalReport) -> io::Result<()> {
        writeln!(self.writer, "{}", system_line(report))?;
        for entity in &report.entities {
            writeln!(self.writer, "{}", entity_line(entity))?;
        }
        self.writer.flush()
    }

    pub fn write_cgroup_run(&mut self, report: &CgroupRunReport) -> io::Result<()> {
        writeln!(self.writer, "{}", cgroup_run_line(report))?;
        self.writer.flush()
    }
}

/// CPU time and I/O of the interval. Zero for an entity that was just discovered.
fn interval_usage(entity: &EntityReport) -> (i64, i64) {
    entity.delta.map(|d| (d.cpu_time_us, d.io_ops)).unwrap_or_default()
}

/// `energy, cpu_time, memory, io_ops, cycles`
pub fn system_line(report: &IntervalReport) -> String {
    let (cpu_time, io_ops) = interval_usage(&report.system);
    format!(
        "{}, {cpu_time}, {}, {io_ops}, {}",
        report.energy_uj, report.system.counters.memory_bytes, report.system.cycles
    )
}

/// `id, cpu_time, memory, io_ops, cycles, estimated_energy`
pub fn entity_line(entity: &EntityReport) -> String {
    let (cpu_time, io_ops) = interval_usage(entity);
    format!(
        "{}, {cpu_time}, {}, {io_ops}, {}, {}",
        entity.id, entity.counters.memory_bytes, entity.cycles, entity.energy_uj
    )
}

/// `energy, cpu_time, peak_rss, io_ops, read_bytes, write_bytes, cycles, estimated_energy, elapsed_s`
pub fn cgroup_run_line(report: &CgroupRunReport) -> String {
    let s = &report.stats;
    format!(
        "{}, {}, {}, {}, {}, {}, {}, {}, {:.6}",
        report.energy_uj,
        s.cpu_time_us,
        s.peak_rss_bytes,
        s.io_ops,
        s.read_bytes,
        s.write_bytes,
        s.cycles,
        report.estimated_energy_uj,
        report.elapsed.as_secs_f64()
    )
}

/// The domains that consumed something, like `Package 700 µJ, Dram 100 µJ`.
fn domain_breakdown(energy_per_domain: &EnumMap<RaplDomainType, u64>) -> String {
    let parts: Vec<String> = energy_per_domain
        .iter()
        .filter(|(_, uj)| **uj > 0)
        .map(|(domain, uj)| format!("{domain:?} {uj} µJ"))
        .collect();
    parts.join(", ")
}

/// Human-readable summary of an interval.
pub fn interval_summary(report: &IntervalReport) -> String {
    let (cpu_time, io_ops) = interval_usage(&report.system);
    let mut out = format!(
        "[{:.3}s] energy: {} µJ ({}) | system: cpu {} µs, memory {} B, io {} ops, {} cycles",
        report.elapsed.as_secs_f64(),
        report.energy_uj,
        domain_breakdown(&report.energy_per_domain),
        cpu_time,
        report.system.counters.memory_bytes,
        io_ops,
        report.system.cycles
    );
    for id in &report.added {
        out.push_str(&format!("\n  + {id}"));
    }
    for id in &report.removed {
        out.push_str(&format!("\n  - {id}"));
    }
    for entity in &report.entities {
        let (cpu_time, io_ops) = interval_usage(entity);
        out.push_str(&format!(
            "\n  {:?} {}: cpu {} µs, memory {} B, io {} ops, {} cycles, ~{} µJ",
            entity.kind, entity.id, cpu_time, entity.counters.memory_bytes, io_ops, entity.cycles, entity.energy_uj
        ));
    }
    out
}

pub fn run_summary(report: &CgroupRunReport) -> String {
    let s = &report.stats;
    format!(
        "Total energy: {} µJ ({}) in {:.6} s\n\
         cgroup: cpu {} µs, peak memory {} B, io {} ops ({} B read, {} B written), {} cycles ({} on the system)\n\
         Estimated energy: {} µJ",
        report.energy_uj,
        domain_breakdown(&report.energy_per_domain),
        report.elapsed.as_secs_f64(),
        s.cpu_time_us,
        s.peak_rss_bytes,
        s.io_ops,
        s.read_bytes,
        s.write_bytes,
        s.cycles,
        report.system_cycles,
        report.estimated_energy_uj
    )
}
