use std::{fs, num::ParseIntError, path::Path};

use enum_map::Enum;

pub mod attribution;
pub mod calibration;
pub mod cgroup;
pub mod error;
pub mod monitor;
pub mod perf_event;
pub mod powercap;
pub mod probe;
pub mod registry;
pub mod stats;

pub use error::{Error, Result};

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaplDomainType {
    /// entire socket
    Package,
    /// power plane 0: core
    PP0,
    /// power plane 1: uncore
    PP1,
    ///  DRAM
    Dram,
    /// psys
    Platform,
}

impl RaplDomainType {
    pub const ALL: [RaplDomainType; 5] = [
        RaplDomainType::Package,
        RaplDomainType::PP0,
        RaplDomainType::PP1,
        RaplDomainType::Dram,
        RaplDomainType::Platform,
    ];

    /// The domains whose energy is split between the monitored entities.
    pub const ATTRIBUTED: [RaplDomainType; 2] = [RaplDomainType::Package, RaplDomainType::Dram];
}

/// Where the collector finds (and creates) things on the host.
///
/// Every path is overridable so that the whole accounting engine can run
/// against a fake sysfs tree.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the cgroup v2 hierarchy.
    pub cgroup_root: std::path::PathBuf,
    /// Directory scanned for container cgroups, relative to `cgroup_root`.
    pub container_slice: String,
    /// Container cgroups are named `<prefix><id><suffix>`.
    pub container_prefix: String,
    pub container_suffix: String,
    /// Maximum number of tracked containers.
    pub max_containers: usize,
    /// Root of the RAPL powercap control type.
    pub powercap_root: std::path::PathBuf,
    /// The idle calibration file (two integers: average and minimum µJ/s).
    pub calibration_file: std::path::PathBuf,
    /// Duration of one sampling interval.
    pub interval: std::time::Duration,
}

pub const DEFAULT_MAX_CONTAINERS: usize = 25;

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cgroup_root: "/sys/fs/cgroup".into(),
            container_slice: "system.slice".to_owned(),
            container_prefix: "docker-".to_owned(),
            container_suffix: ".scope".to_owned(),
            max_containers: DEFAULT_MAX_CONTAINERS,
            powercap_root: powercap::POWERCAP_RAPL_PATH.into(),
            calibration_file: calibration::DEFAULT_CALIBRATION_FILE.into(),
            interval: std::time::Duration::from_secs(1),
        }
    }
}

impl Settings {
    pub fn container_dir(&self) -> std::path::PathBuf {
        self.cgroup_root.join(&self.container_slice)
    }
}

/// Retrieves the list of online CPUs, which are the CPUs that get a cycle counter.
pub fn online_cpus() -> anyhow::Result<Vec<u32>> {
    read_cpu_list(Path::new("/sys/devices/system/cpu/online"))
}

pub fn read_cpu_list(path: &Path) -> anyhow::Result<Vec<u32>> {
    let list = fs::read_to_string(path)?;
    parse_cpu_list(&list)
}

pub fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    // this can be "0,64" or "0-1" or maybe "0-1,64-66"
    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter() // not the same as iter() !
        .flatten()
        .collect();

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use crate::parse_cpu_list;

    #[test]
    fn test_parse_cpu_list() -> anyhow::Result<()> {
        assert_eq!(parse_cpu_list("0\n")?, vec![0]);
        assert_eq!(parse_cpu_list("0,64")?, vec![0, 64]);
        assert_eq!(parse_cpu_list("0-3")?, vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("1-3,5-6")?, vec![1, 2, 3, 5, 6]);
        assert!(parse_cpu_list("1-2-3").is_err());
        assert!(parse_cpu_list("a").is_err());
        Ok(())
    }
}
