use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use rapl_accounting::{
    calibration,
    cgroup::CgroupScope,
    monitor::{ContainerSetSampler, IntervalSampler, MonitorContext, ProcessSetSampler, SystemSampler},
    powercap::RaplReader,
};

use cli::{Cli, Commands};
use logging::LogFile;

mod bench;
mod cli;
mod logging;
mod polling;

const CALIBRATION_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();
    let settings = cli.settings();

    // calibration doesn't need the rest of the context, and happens before it exists
    if let Some(Commands::Calibrate { intervals }) = cli.command {
        let reader = RaplReader::new(&settings.powercap_root);
        info!(
            "Measuring the idle consumption for {intervals} intervals of {}s, please keep the system idle.",
            CALIBRATION_PERIOD.as_secs()
        );
        let calibrate = move || calibration::calibrate(&reader, intervals, CALIBRATION_PERIOD);
        let task = tokio::task::spawn_blocking(calibrate);
        tokio::select! {
            res = task => {
                let idle = res.context("calibration task failed")??;
                idle.save(&settings.calibration_file)
                    .with_context(|| format!("failed to write {:?}", settings.calibration_file))?;
                println!("{}\n{}", idle.average_uj_per_s, idle.minimum_uj_per_s);
                info!("Idle calibration saved to {:?}", settings.calibration_file);
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Calibration interrupted, nothing saved.");
                // don't wait for the blocking task
                std::process::exit(130);
            }
        }
        return Ok(());
    }

    let mut log = if cli.log {
        let log = LogFile::create_timestamped()?;
        info!("Writing measurements to {:?}", log.path());
        Some(log)
    } else {
        None
    };

    let ctx = MonitorContext::new(settings)?;
    info!("{} CPUs monitored: {:?}", ctx.cpus.len(), ctx.cpus);

    match cli.command {
        None => {
            let sampler = SystemSampler::new(&ctx)?;
            polling::run(ctx, Box::new(sampler), log).await?;
        }
        Some(Commands::Monitor { pids }) => {
            let sampler = ProcessSetSampler::new(&ctx, &pids)?;
            polling::run(ctx, Box::new(sampler), log).await?;
        }
        Some(Commands::Containers) => {
            let sampler: Box<dyn IntervalSampler> = Box::new(ContainerSetSampler::new(&ctx)?);
            polling::run(ctx, sampler, log).await?;
        }
        Some(Commands::Exec { command }) => {
            // the arguments are passed as-is, only joined for the messages
            let command_line = command.join(" ");
            let mut scope = CgroupScope::for_this_process(&ctx.settings.cgroup_root);
            let cmd = scope.exec_command(&command);
            if let Some(report) = bench::measure_command(&ctx, &mut scope, cmd, &command_line).await? {
                println!("{}", logging::run_summary(&report));
                if let Some(log) = log.as_mut() {
                    log.write_cgroup_run(&report)?;
                }
            }
        }
        Some(Commands::Benchmark { dir }) => {
            bench::run_benchmarks(&ctx, &dir).await?;
        }
        Some(Commands::Calibrate { .. }) => (),
    }

    Ok(())
}
