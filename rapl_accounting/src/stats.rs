//! Cumulative resource counters, and parsers for the cgroup v2 statistic files.
//!
//! All the entity kinds use the same units: CPU time in microseconds, memory in bytes,
//! I/O in number of operations.

use crate::{Error, Result};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounters {
    pub cpu_time_us: u64,
    pub memory_bytes: u64,
    pub io_ops: u64,
}

/// Difference between two samples of [`ResourceCounters`].
///
/// Memory usage can go down, hence the signed values.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub cpu_time_us: i64,
    pub memory_bytes: i64,
    pub io_ops: i64,
}

impl ResourceCounters {
    pub fn delta_since(&self, previous: &ResourceCounters) -> CounterDelta {
        fn diff(current: u64, previous: u64) -> i64 {
            current.wrapping_sub(previous) as i64
        }
        CounterDelta {
            cpu_time_us: diff(self.cpu_time_us, previous.cpu_time_us),
            memory_bytes: diff(self.memory_bytes, previous.memory_bytes),
            io_ops: diff(self.io_ops, previous.io_ops),
        }
    }
}

pub fn ticks_to_micros(ticks: u64, ticks_per_second: u64) -> u64 {
    (ticks as u128 * 1_000_000 / ticks_per_second.max(1) as u128) as u64
}

/// Parses a file that contains a single integer, like `memory.current` or `memory.peak`.
pub fn parse_single_value(what: &str, content: &str) -> Result<u64> {
    content.trim().parse().map_err(|_| Error::parse(what, content))
}

/// Extracts `usage_usec` from `cpu.stat`.
pub fn parse_cpu_usage(content: &str) -> Result<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("usage_usec "))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::parse("cpu.stat usage_usec", content))
}

/// I/O counters of one block device, from one line of `io.stat`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CgroupIoStat {
    /// Bytes read.
    pub rbytes: u64,
    /// Bytes written.
    pub wbytes: u64,
    /// Read I/O operations.
    pub rios: u64,
    /// Write I/O operations.
    pub wios: u64,
}

impl CgroupIoStat {
    pub fn ops(&self) -> u64 {
        self.rios + self.wios
    }

    /// Parses one line of `io.stat`, for instance
    /// `8:0 rbytes=1459200 wbytes=314773504 rios=192 wios=353 dbytes=0 dios=0`.
    ///
    /// Unknown keys are ignored and missing keys count as zero.
    pub fn parse_line(line: &str) -> Result<CgroupIoStat> {
        let mut fields = line.split_whitespace();
        let device = fields.next().ok_or_else(|| Error::parse("io.stat line", line))?;
        if !device.contains(':') {
            return Err(Error::parse("io.stat device", line));
        }
        let mut stat = CgroupIoStat::default();
        for field in fields {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let value: u64 = value.parse().map_err(|_| Error::parse("io.stat value", line))?;
            match key {
                "rbytes" => stat.rbytes = value,
                "wbytes" => stat.wbytes = value,
                "rios" => stat.rios = value,
                "wios" => stat.wios = value,
                _ => (),
            }
        }
        Ok(stat)
    }

    /// Parses all the lines of `io.stat`. An empty file means no I/O at all.
    pub fn parse_all(content: &str) -> Result<Vec<CgroupIoStat>> {
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(CgroupIoStat::parse_line)
            .collect()
    }

    /// Parses the first line of `io.stat` only, zero if the file is empty.
    pub fn parse_first(content: &str) -> Result<CgroupIoStat> {
        match content.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => CgroupIoStat::parse_line(line),
            None => Ok(CgroupIoStat::default()),
        }
    }

    pub fn sum(stats: &[CgroupIoStat]) -> CgroupIoStat {
        stats.iter().fold(CgroupIoStat::default(), |acc, s| CgroupIoStat {
            rbytes: acc.rbytes + s.rbytes,
            wbytes: acc.wbytes + s.wbytes,
            rios: acc.rios + s.rios,
            wios: acc.wios + s.wios,
        })
    }
}
