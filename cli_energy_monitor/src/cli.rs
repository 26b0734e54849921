use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use rapl_accounting::{
    calibration::{CALIBRATION_INTERVALS, DEFAULT_CALIBRATION_FILE},
    powercap::POWERCAP_RAPL_PATH,
    Settings, DEFAULT_MAX_CONTAINERS,
};

/// Measures the resources and the energy used by the system, by processes, by containers
/// or by programs run in a dedicated cgroup.
///
/// Without a subcommand, the whole system is monitored.
#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Also write the measurements to logfile_<date>.txt.
    #[arg(short, long, global = true)]
    pub log: bool,

    /// Duration of a measurement interval, in seconds.
    #[arg(long, global = true, default_value = "1", value_parser = parse_interval)]
    pub interval: Duration,

    /// The idle calibration file.
    #[arg(long, global = true, default_value = DEFAULT_CALIBRATION_FILE)]
    pub calibration_file: PathBuf,

    /// Root of the cgroup v2 hierarchy.
    #[arg(long, global = true, default_value = "/sys/fs/cgroup")]
    pub cgroup_root: PathBuf,

    /// Where to find the RAPL power zones.
    #[arg(long, global = true, default_value = POWERCAP_RAPL_PATH)]
    pub powercap_root: PathBuf,

    /// Maximum number of containers to monitor.
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_CONTAINERS)]
    pub max_containers: usize,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command in a dedicated cgroup, and measure it until it exits.
    #[command(short_flag = 'e')]
    Exec {
        /// The program and its arguments, passed without shell interpretation.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Monitor some processes until they all exit.
    #[command(short_flag = 'm')]
    Monitor {
        #[arg(required = true, num_args = 1..)]
        pids: Vec<i32>,
    },

    /// Monitor the containers (docker-<id>.scope cgroups).
    #[command(short_flag = 'c')]
    Containers,

    /// Measure the idle energy consumption. The system should be idle meanwhile.
    #[command(short_flag = 'i')]
    Calibrate {
        /// Number of one-second intervals.
        #[arg(long, default_value_t = CALIBRATION_INTERVALS)]
        intervals: usize,
    },

    /// Run and measure every program of a benchmark directory, organized as
    /// <dir>/<language>/<algorithm>/run.txt.
    #[command(short_flag = 'b')]
    Benchmark { dir: PathBuf },
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            cgroup_root: self.cgroup_root.clone(),
            max_containers: self.max_containers,
            powercap_root: self.powercap_root.clone(),
            calibration_file: self.calibration_file.clone(),
            interval: self.interval,
            ..Default::default()
        }
    }
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("invalid interval '{s}': {e}"))?;
    if secs.is_finite() && secs > 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(format!("the interval must be positive, got {s}"))
    }
}
