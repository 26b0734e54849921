//! Running programs in the cgroup scope, alone or from a benchmark directory.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use rapl_accounting::{
    cgroup::CgroupScope,
    monitor::{CgroupMeasurement, CgroupRunReport, MonitorContext},
};

use crate::logging::{self, LogFile};

const RUN_FILE: &str = "run.txt";
const DROP_CACHES: &str = "/proc/sys/vm/drop_caches";
const PAUSE_BETWEEN_RUNS: Duration = Duration::from_secs(3);

/// Exit code of the launcher shell when it cannot join the cgroup.
const CGROUP_JOIN_FAILED: i32 = 125;

/// Runs `cmd`, built by [`CgroupScope::shell_command`] or [`CgroupScope::exec_command`],
/// and measures it. `command_line` is only used in the messages.
///
/// Returns `None` if interrupted by Ctrl+C, in which case the command is killed.
pub async fn measure_command(
    ctx: &MonitorContext,
    scope: &mut CgroupScope,
    cmd: std::process::Command,
    command_line: &str,
) -> anyhow::Result<Option<CgroupRunReport>> {
    let measurement = CgroupMeasurement::start(ctx, scope)?;

    let mut child = tokio::process::Command::from(cmd)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to run `{command_line}`"))?;
    debug!("`{command_line}` started");

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.code() == Some(CGROUP_JOIN_FAILED) {
                return Err(anyhow!("`{command_line}` could not join the cgroup {:?}", scope.path()));
            } else if !status.success() {
                warn!("`{command_line}` exited with {status}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, killing `{command_line}`");
            child.kill().await?;
            scope.kill_all();
            return Ok(None);
        }
    }

    let report = measurement.finish(ctx, scope)?;
    Ok(Some(report))
}

/// A program of the benchmark directory: `<dir>/<language>/<algorithm>/run.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkProgram {
    pub language: String,
    pub algorithm: String,
    pub dir: PathBuf,
}

impl BenchmarkProgram {
    /// The first line of `run.txt`.
    pub fn command_line(&self) -> anyhow::Result<String> {
        let path = self.dir.join(RUN_FILE);
        let content = fs::read_to_string(&path).with_context(|| format!("no {RUN_FILE} in {:?}", self.dir))?;
        let line = content.lines().next().unwrap_or_default().trim();
        if line.is_empty() {
            return Err(anyhow!("{path:?} is empty"));
        }
        Ok(line.to_owned())
    }

    pub fn log_file_name(&self) -> String {
        format!("{}_{}.txt", self.language, self.algorithm)
    }
}

/// Lists the programs of a benchmark directory, sorted by language and algorithm.
pub fn find_programs(benchmark_dir: &Path) -> anyhow::Result<Vec<BenchmarkProgram>> {
    fn subdirs(dir: &Path) -> anyhow::Result<Vec<(String, PathBuf)>> {
        let mut res = Vec::new();
        for e in fs::read_dir(dir).with_context(|| format!("Failed to list {dir:?}"))? {
            let entry = e?;
            if entry.file_type()?.is_dir() {
                res.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
            }
        }
        res.sort();
        Ok(res)
    }

    let mut programs = Vec::new();
    for (language, lang_dir) in subdirs(benchmark_dir)? {
        let algorithms = match subdirs(&lang_dir) {
            Ok(algs) => algs,
            Err(e) => {
                warn!("skipping language {language}: {e:#}");
                continue;
            }
        };
        for (algorithm, dir) in algorithms {
            programs.push(BenchmarkProgram {
                language: language.clone(),
                algorithm,
                dir,
            });
        }
    }
    Ok(programs)
}

/// Measures every program of the benchmark directory, one after the other.
///
/// A program that fails to run is skipped. The results are written to `<language>_<algorithm>.txt`.
pub async fn run_benchmarks(ctx: &MonitorContext, benchmark_dir: &Path) -> anyhow::Result<()> {
    let programs = find_programs(benchmark_dir)?;
    info!("{} programs found in {benchmark_dir:?}", programs.len());

    let mut scope = CgroupScope::for_this_process(&ctx.settings.cgroup_root);
    for program in programs {
        let name = format!("{}/{}", program.language, program.algorithm);
        let command_line = match program.command_line() {
            Ok(c) => c,
            Err(e) => {
                warn!("skipping {name}: {e:#}");
                continue;
            }
        };
        info!("Running {name}: {command_line}");

        let mut cmd = scope.shell_command(&command_line);
        cmd.current_dir(&program.dir);
        match measure_command(ctx, &mut scope, cmd, &command_line).await {
            Ok(Some(report)) => {
                println!("{name}\n{}", logging::run_summary(&report));
                let mut log = LogFile::open(Path::new(&program.log_file_name()))?;
                log.write_cgroup_run(&report)?;
            }
            Ok(None) => return Ok(()),
            Err(e) => warn!("{name} aborted: {e:#}"),
        }

        drop_caches();
        tokio::time::sleep(PAUSE_BETWEEN_RUNS).await;
    }
    scope.close();
    Ok(())
}

/// Clears the page cache so that every program starts with the same I/O conditions.
fn drop_caches() {
    if let Err(e) = fs::write(DROP_CACHES, "3") {
        warn!("failed to drop the caches: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::find_programs;

    #[test]
    fn test_find_programs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (lang, alg) in [("rust", "nbody"), ("c", "nbody"), ("c", "fasta")] {
            fs::create_dir_all(root.join(lang).join(alg)).unwrap();
        }
        fs::write(root.join("README"), "not a language").unwrap();
        fs::write(root.join("c/fasta/run.txt"), "./fasta 1000\n./ignored\n").unwrap();
        fs::write(root.join("rust/nbody/run.txt"), "\n").unwrap();

        let programs = find_programs(root).unwrap();
        let names: Vec<String> = programs.iter().map(|p| p.log_file_name()).collect();
        assert_eq!(names, vec!["c_fasta.txt", "c_nbody.txt", "rust_nbody.txt"]);

        assert_eq!(programs[0].command_line().unwrap(), "./fasta 1000");
        // missing run.txt
        assert!(programs[1].command_line().is_err());
        // empty run.txt
        assert!(programs[2].command_line().is_err());
    }

    #[test]
    fn test_missing_benchmark_dir() {
        assert!(find_programs(std::path::Path::new("/nonexistent/benchmarks")).is_err());
    }
}
