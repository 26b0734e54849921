use rapl_accounting::monitor::{IntervalReport, IntervalSampler, MonitorContext};

use anyhow::Context;
use futures::stream::StreamExt;
use log::info;
use tokio::sync::mpsc::{self, Sender};
use tokio_timerfd::Interval;

use crate::logging::{self, LogFile};

/// Samples at regular intervals until the sampler has nothing left to monitor, or until Ctrl+C.
///
/// The sampler and the context are dropped on return, which closes every counter.
pub async fn run(
    ctx: MonitorContext,
    mut sampler: Box<dyn IntervalSampler>,
    mut log: Option<LogFile>,
) -> anyhow::Result<()> {
    // open a Channel to write to the output in another task
    let (tx, mut rx) = mpsc::channel::<IntervalReport>(256);

    // Start the writer task, which will receive the reports from the channel and write
    // them to stdout and to the log file.
    let handle = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            println!("{}", logging::interval_summary(&report));
            if let Some(log) = log.as_mut() {
                log.write_interval(&report)
                    .with_context(|| format!("failed to write to {:?}", log.path()))?;
            }
        }
        anyhow::Ok(())
    });

    // Start the polling task, which will sample at regular intervals
    // and send the reports to the writer task, through the channel.
    tokio::select! {
        res = poll_sampler(&ctx, sampler.as_mut(), tx) => res?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping."),
    }

    handle.await??;
    Ok(())
}

async fn poll_sampler(
    ctx: &MonitorContext,
    sampler: &mut dyn IntervalSampler,
    tx: Sender<IntervalReport>,
) -> anyhow::Result<()> {
    // Underneath, this uses a periodic timer from timerfd, which has a higher resolution
    // than std::time::sleep and tokio::time::sleep
    let mut interval = Interval::new_interval(ctx.settings.interval)?;

    sampler.begin(ctx);
    loop {
        // wait for the next tick of the periodic timer
        interval.next().await;

        let report = sampler.sample(ctx);
        tx.send(report).await.context("the writer task has stopped")?;

        if sampler.is_finished() {
            info!("Nothing left to monitor, stopping.");
            return Ok(());
        }
    }
}
