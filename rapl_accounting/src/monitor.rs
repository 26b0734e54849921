//! Interval sampling: energy windows, cycle counts and resource deltas, put together.
//!
//! Every poll reads the RAPL counters twice. The first snapshot is taken before the
//! cycle counters are read and becomes the start of the next window, the second one is
//! taken after all the reads and ends the current window. The energy window thus
//! always contains the cycle window.

use std::time::{Duration, Instant};

use anyhow::Context;
use enum_map::EnumMap;
use log::{debug, warn};

use crate::{
    attribution::estimate_entity_energy,
    calibration::IdleCalibration,
    cgroup::{CgroupScope, CgroupStats},
    online_cpus,
    perf_event::{open_per_cpu, read_all, CounterScope, CycleCounter},
    powercap::{EnergySnapshot, RaplReader},
    probe::{ContainerProbe, EntityKind, ProcessProbe, ResourceProbe, SystemProbe},
    registry::{ContainerDiscovery, EntityRegistry, MonitoredEntity},
    stats::{CounterDelta, ResourceCounters},
    RaplDomainType, Result, Settings,
};

/// Everything a sampler needs to know about the host.
#[derive(Debug)]
pub struct MonitorContext {
    pub settings: Settings,
    /// CPUs that get a cycle counter.
    pub cpus: Vec<u32>,
    pub rapl: RaplReader,
    pub idle: IdleCalibration,
}

impl MonitorContext {
    /// Discovers the CPUs and the RAPL zones, and loads the idle calibration.
    pub fn new(settings: Settings) -> anyhow::Result<MonitorContext> {
        let cpus = online_cpus().context("failed to get the list of online CPUs")?;
        let rapl = RaplReader::new(&settings.powercap_root);
        for zone in rapl.zones() {
            debug!("Found power zone {zone}");
        }
        let idle = IdleCalibration::load(&settings.calibration_file)?;
        Ok(Self::with_parts(settings, cpus, rapl, idle))
    }

    pub fn with_parts(
        settings: Settings,
        cpus: Vec<u32>,
        rapl: RaplReader,
        idle: IdleCalibration,
    ) -> MonitorContext {
        MonitorContext {
            settings,
            cpus,
            rapl,
            idle,
        }
    }
}

/// What happened to one entity during an interval.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReport {
    pub kind: EntityKind,
    pub id: String,
    /// Cumulative counters at the end of the interval.
    pub counters: ResourceCounters,
    /// `None` for an entity discovered during the interval.
    pub delta: Option<CounterDelta>,
    pub cycles: u64,
    pub energy_uj: u64,
}

impl<P: ResourceProbe> From<&MonitoredEntity<P>> for EntityReport {
    fn from(entity: &MonitoredEntity<P>) -> Self {
        EntityReport {
            kind: entity.kind(),
            id: entity.identifier(),
            counters: entity.counters(),
            delta: entity.delta(),
            cycles: entity.cycles(),
            energy_uj: entity.energy_uj(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntervalReport {
    pub elapsed: Duration,
    /// Package + DRAM energy of the interval.
    pub energy_uj: u64,
    /// Energy of every readable domain, including the ones that are not attributed.
    pub energy_per_domain: EnumMap<RaplDomainType, u64>,
    pub system: EntityReport,
    pub entities: Vec<EntityReport>,
    /// Entities discovered during the interval.
    pub added: Vec<String>,
    /// Entities that terminated during the interval.
    pub removed: Vec<String>,
}

/// Produces one [`IntervalReport`] per poll.
pub trait IntervalSampler: Send {
    /// Starts the first interval: discards the cycles counted so far.
    fn begin(&mut self, ctx: &MonitorContext);

    /// Ends the current interval and starts the next one.
    fn sample(&mut self, ctx: &MonitorContext) -> IntervalReport;

    /// True when there is nothing left to monitor.
    fn is_finished(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Window {
    start: EnergySnapshot,
    started_at: Instant,
}

/// What the system-wide part of a poll measured.
struct Measured {
    elapsed: Duration,
    energy_uj: u64,
    energy_per_domain: EnumMap<RaplDomainType, u64>,
}

/// The whole machine, which every sampler needs for the total cycles and energy.
#[derive(Debug)]
struct SystemWindow {
    system: MonitoredEntity<SystemProbe>,
    window: Option<Window>,
}

impl SystemWindow {
    fn new(ctx: &MonitorContext) -> Result<SystemWindow> {
        Ok(SystemWindow {
            system: MonitoredEntity::discover(SystemProbe::new(), &ctx.cpus)?,
            window: None,
        })
    }

    /// `reset_others` must discard the cycles of the other entities.
    fn begin(&mut self, ctx: &MonitorContext, reset_others: impl FnOnce()) {
        let start = ctx.rapl.snapshot();
        self.system.reset_cycles();
        reset_others();
        self.window = Some(Window {
            start,
            started_at: Instant::now(),
        });
    }

    /// Ends the window, `update_others` updates the other entities between the two snapshots.
    fn measure<R>(
        &mut self,
        ctx: &MonitorContext,
        update_others: impl FnOnce() -> R,
    ) -> (Measured, R) {
        let next_start = ctx.rapl.snapshot();
        let now = Instant::now();
        if let Err(e) = self.system.update() {
            warn!("failed to sample the system: {e}");
        }
        let others = update_others();
        let end = ctx.rapl.snapshot();

        let measured = match self.window.replace(Window {
            start: next_start,
            started_at: now,
        }) {
            Some(window) => {
                let energy_per_domain = ctx.rapl.consumed_per_domain(&window.start, &end);
                let energy_uj = RaplDomainType::ATTRIBUTED.iter().map(|d| energy_per_domain[*d]).sum();
                Measured {
                    elapsed: now.saturating_duration_since(window.started_at),
                    energy_uj,
                    energy_per_domain,
                }
            }
            None => {
                debug!("sampling before the first interval began, reporting an empty interval");
                Measured {
                    elapsed: Duration::ZERO,
                    energy_uj: 0,
                    energy_per_domain: EnumMap::default(),
                }
            }
        };
        self.system.set_energy_estimate(measured.energy_uj);
        (measured, others)
    }

    /// Gives each entity its share of the energy, according to its share of the cycles.
    fn attribute<P: ResourceProbe>(
        &self,
        ctx: &MonitorContext,
        measured: &Measured,
        registry: &mut EntityRegistry<P>,
    ) {
        let elapsed_s = measured.elapsed.as_secs_f64();
        let system_cycles = self.system.cycles();
        for entity in registry.iter_mut() {
            let energy = if entity.delta().is_some() {
                let cycles = entity.cycles();
                estimate_entity_energy(system_cycles, cycles, measured.energy_uj, elapsed_s, &ctx.idle)
            } else {
                0
            };
            entity.set_energy_estimate(energy);
        }
    }

    fn report(
        &self,
        measured: Measured,
        entities: Vec<EntityReport>,
        added: Vec<String>,
        removed: Vec<String>,
    ) -> IntervalReport {
        IntervalReport {
            elapsed: measured.elapsed,
            energy_uj: measured.energy_uj,
            energy_per_domain: measured.energy_per_domain,
            system: EntityReport::from(&self.system),
            entities,
            added,
            removed,
        }
    }
}

/// Monitors the whole machine only.
#[derive(Debug)]
pub struct SystemSampler {
    window: SystemWindow,
}

impl SystemSampler {
    pub fn new(ctx: &MonitorContext) -> Result<SystemSampler> {
        Ok(SystemSampler {
            window: SystemWindow::new(ctx)?,
        })
    }
}

impl IntervalSampler for SystemSampler {
    fn begin(&mut self, ctx: &MonitorContext) {
        self.window.begin(ctx, || ());
    }

    fn sample(&mut self, ctx: &MonitorContext) -> IntervalReport {
        let (measured, ()) = self.window.measure(ctx, || ());
        self.window.report(measured, Vec::new(), Vec::new(), Vec::new())
    }
}

/// Monitors a fixed set of processes, until they have all exited.
#[derive(Debug)]
pub struct ProcessSetSampler {
    window: SystemWindow,
    registry: EntityRegistry<ProcessProbe>,
}

impl ProcessSetSampler {
    /// Fails if none of the processes exist.
    pub fn new(ctx: &MonitorContext, pids: &[i32]) -> anyhow::Result<ProcessSetSampler> {
        let mut registry = EntityRegistry::new(pids.len());
        for &pid in pids {
            match MonitoredEntity::discover(ProcessProbe::new(pid), &ctx.cpus) {
                Ok(entity) => {
                    if let Err(e) = registry.add(entity) {
                        warn!("{e}");
                    }
                }
                Err(e) => warn!("process {pid} is not monitored: {e}"),
            }
        }
        if registry.is_empty() {
            anyhow::bail!("none of the processes {pids:?} can be monitored");
        }
        Ok(ProcessSetSampler {
            window: SystemWindow::new(ctx)?,
            registry,
        })
    }

    pub fn registry(&self) -> &EntityRegistry<ProcessProbe> {
        &self.registry
    }
}

impl IntervalSampler for ProcessSetSampler {
    fn begin(&mut self, ctx: &MonitorContext) {
        let registry = &mut self.registry;
        self.window
            .begin(ctx, || registry.iter_mut().for_each(MonitoredEntity::reset_cycles));
    }

    fn sample(&mut self, ctx: &MonitorContext) -> IntervalReport {
        let registry = &mut self.registry;
        let (measured, removed) = self.window.measure(ctx, || registry.update_all());
        self.window.attribute(ctx, &measured, &mut self.registry);
        let entities = self.registry.iter().map(EntityReport::from).collect();
        self.window.report(measured, entities, Vec::new(), removed)
    }

    fn is_finished(&self) -> bool {
        self.registry.is_empty()
    }
}

/// Monitors the containers, which come and go.
#[derive(Debug)]
pub struct ContainerSetSampler {
    window: SystemWindow,
    discovery: ContainerDiscovery,
    registry: EntityRegistry<ContainerProbe>,
}

impl ContainerSetSampler {
    /// Admits the containers that already exist.
    pub fn new(ctx: &MonitorContext) -> anyhow::Result<ContainerSetSampler> {
        let mut discovery = ContainerDiscovery::new(&ctx.settings)?;
        let mut registry = EntityRegistry::new(ctx.settings.max_containers);
        let found = discovery.admit_new(&mut registry, &ctx.cpus);
        debug!("{} containers found at startup", found.len());
        Ok(ContainerSetSampler {
            window: SystemWindow::new(ctx)?,
            discovery,
            registry,
        })
    }

    pub fn registry(&self) -> &EntityRegistry<ContainerProbe> {
        &self.registry
    }
}

impl IntervalSampler for ContainerSetSampler {
    fn begin(&mut self, ctx: &MonitorContext) {
        let registry = &mut self.registry;
        self.window
            .begin(ctx, || registry.iter_mut().for_each(MonitoredEntity::reset_cycles));
    }

    fn sample(&mut self, ctx: &MonitorContext) -> IntervalReport {
        let registry = &mut self.registry;
        let (measured, removed) = self.window.measure(ctx, || registry.update_all());
        self.window.attribute(ctx, &measured, &mut self.registry);
        let entities = self.registry.iter().map(EntityReport::from).collect();
        // new containers start counting now, within the next window
        let added = self.discovery.admit_new(&mut self.registry, &ctx.cpus);
        self.window.report(measured, entities, added, removed)
    }
}

/// Result of one program run in a [`CgroupScope`].
#[derive(Debug, Clone)]
pub struct CgroupRunReport {
    /// Package + DRAM energy of the whole run.
    pub energy_uj: u64,
    pub energy_per_domain: EnumMap<RaplDomainType, u64>,
    pub stats: CgroupStats,
    pub system_cycles: u64,
    pub estimated_energy_uj: u64,
    pub elapsed: Duration,
}

/// Measures everything that runs in a cgroup scope, from `start` to `finish`.
#[derive(Debug)]
pub struct CgroupMeasurement {
    start: EnergySnapshot,
    started_at: Instant,
    system_cycles: Vec<CycleCounter>,
}

impl CgroupMeasurement {
    /// Takes the first energy snapshot, then (re)creates the scope and opens the counters.
    pub fn start(ctx: &MonitorContext, scope: &mut CgroupScope) -> Result<CgroupMeasurement> {
        let start = ctx.rapl.snapshot();
        scope.reset(&ctx.cpus)?;
        let system_cycles = open_per_cpu(&ctx.cpus, "the system", CounterScope::Cpu);
        Ok(CgroupMeasurement {
            start,
            started_at: Instant::now(),
            system_cycles,
        })
    }

    /// Reads the counters and the statistics of the scope, then takes the last energy snapshot.
    pub fn finish(mut self, ctx: &MonitorContext, scope: &mut CgroupScope) -> Result<CgroupRunReport> {
        let elapsed = self.started_at.elapsed();
        let system_cycles = read_all(&mut self.system_cycles);
        let stats = scope.read_aggregate_stats()?;
        let end = ctx.rapl.snapshot();

        let energy_per_domain = ctx.rapl.consumed_per_domain(&self.start, &end);
        let energy_uj = RaplDomainType::ATTRIBUTED.iter().map(|d| energy_per_domain[*d]).sum();
        let estimated_energy_uj =
            estimate_entity_energy(system_cycles, stats.cycles, energy_uj, elapsed.as_secs_f64(), &ctx.idle);
        Ok(CgroupRunReport {
            energy_uj,
            energy_per_domain,
            stats,
            system_cycles,
            estimated_energy_uj,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{
        CgroupMeasurement, ContainerSetSampler, IntervalSampler, MonitorContext, ProcessSetSampler, SystemSampler,
    };
    use crate::{
        calibration::IdleCalibration,
        cgroup::CgroupScope,
        powercap::{
            tests::{fake_powercap, set_energy},
            RaplReader,
        },
        probe::EntityKind,
        RaplDomainType, Settings,
    };

    fn context(powercap: &std::path::Path, cgroup_root: &std::path::Path) -> MonitorContext {
        fake_powercap(powercap, 1);
        let settings = Settings {
            cgroup_root: cgroup_root.to_path_buf(),
            powercap_root: powercap.to_path_buf(),
            ..Default::default()
        };
        MonitorContext::with_parts(settings, Vec::new(), RaplReader::new(powercap), IdleCalibration::default())
    }

    fn fake_container(cgroup_root: &std::path::Path, id: &str, usage_usec: u64) {
        let dir = cgroup_root.join("system.slice").join(format!("docker-{id}.scope"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cpu.stat"), format!("usage_usec {usage_usec}\n")).unwrap();
        fs::write(dir.join("io.stat"), "8:0 rbytes=0 wbytes=0 rios=1 wios=1\n").unwrap();
        fs::write(dir.join("memory.current"), "4096\n").unwrap();
    }

    #[test]
    fn test_system_windows_are_chained() {
        let powercap = tempfile::tempdir().unwrap();
        let cgroups = tempfile::tempdir().unwrap();
        let ctx = context(powercap.path(), cgroups.path());
        let mut sampler = SystemSampler::new(&ctx).unwrap();

        sampler.begin(&ctx);
        set_energy(powercap.path(), "intel-rapl:0", 1_000);
        set_energy(powercap.path(), "intel-rapl:0/intel-rapl:0:0", 500);
        let first = sampler.sample(&ctx);
        assert_eq!(first.energy_uj, 1_500);
        assert_eq!(first.energy_per_domain[RaplDomainType::Package], 1_000);
        assert_eq!(first.system.energy_uj, 1_500);
        assert_eq!(first.system.kind, EntityKind::System);
        assert!(first.system.delta.is_some());

        // the next window starts where the previous one ended
        set_energy(powercap.path(), "intel-rapl:0", 3_000);
        let second = sampler.sample(&ctx);
        assert_eq!(second.energy_uj, 2_000);
        assert!(second.entities.is_empty());
    }

    #[test]
    fn test_sample_without_begin() {
        let powercap = tempfile::tempdir().unwrap();
        let cgroups = tempfile::tempdir().unwrap();
        let ctx = context(powercap.path(), cgroups.path());
        let mut sampler = SystemSampler::new(&ctx).unwrap();
        set_energy(powercap.path(), "intel-rapl:0", 1_000);
        assert_eq!(sampler.sample(&ctx).energy_uj, 0);
    }

    #[test]
    fn test_containers() {
        let powercap = tempfile::tempdir().unwrap();
        let cgroups = tempfile::tempdir().unwrap();
        let ctx = context(powercap.path(), cgroups.path());
        fake_container(cgroups.path(), "aaa", 1_000);
        fake_container(cgroups.path(), "bbb", 2_000);

        let mut sampler = ContainerSetSampler::new(&ctx).unwrap();
        assert_eq!(sampler.registry().len(), 2);
        sampler.begin(&ctx);

        fake_container(cgroups.path(), "aaa", 1_500);
        fake_container(cgroups.path(), "ccc", 0);
        let report = sampler.sample(&ctx);
        assert_eq!(report.entities.len(), 2);
        let aaa = report.entities.iter().find(|e| e.id == "aaa").unwrap();
        assert_eq!(aaa.delta.unwrap().cpu_time_us, 500);
        assert_eq!(aaa.kind, EntityKind::Container);
        // no cycle counters, no energy
        assert_eq!(aaa.energy_uj, 0);
        assert_eq!(report.added, vec!["ccc"]);
        assert!(report.removed.is_empty());

        fs::remove_file(cgroups.path().join("system.slice/docker-bbb.scope/cpu.stat")).unwrap();
        let report = sampler.sample(&ctx);
        assert_eq!(report.removed, vec!["bbb"]);
        assert_eq!(sampler.registry().len(), 2);
        assert!(!sampler.is_finished());
    }

    #[test]
    fn test_process_set() {
        let powercap = tempfile::tempdir().unwrap();
        let cgroups = tempfile::tempdir().unwrap();
        let ctx = context(powercap.path(), cgroups.path());

        assert!(ProcessSetSampler::new(&ctx, &[i32::MAX]).is_err());

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pids = [std::process::id() as i32, child.id() as i32, i32::MAX];
        let mut sampler = ProcessSetSampler::new(&ctx, &pids).unwrap();
        assert_eq!(sampler.registry().len(), 2);
        sampler.begin(&ctx);
        let report = sampler.sample(&ctx);
        assert_eq!(report.entities.len(), 2);
        assert!(report.entities.iter().all(|e| e.delta.is_some()));

        child.kill().unwrap();
        child.wait().unwrap();
        let report = sampler.sample(&ctx);
        assert_eq!(report.removed, vec![child.id().to_string()]);
        assert_eq!(report.entities.len(), 1);
        assert!(!sampler.is_finished());
    }

    #[test]
    fn test_cgroup_measurement() {
        let powercap = tempfile::tempdir().unwrap();
        let cgroups = tempfile::tempdir().unwrap();
        let ctx = context(powercap.path(), cgroups.path());
        let mut scope = CgroupScope::new(cgroups.path(), 1);

        let measurement = CgroupMeasurement::start(&ctx, &mut scope).unwrap();
        set_energy(powercap.path(), "intel-rapl:0", 40_000);
        set_energy(powercap.path(), "intel-rapl:0/intel-rapl:0:0", 2_000);
        let dir = scope.path().to_path_buf();
        fs::write(dir.join("cpu.stat"), "usage_usec 10\n").unwrap();
        fs::write(dir.join("memory.peak"), "8192\n").unwrap();
        fs::write(dir.join("io.stat"), "").unwrap();

        let report = measurement.finish(&ctx, &mut scope).unwrap();
        assert_eq!(report.energy_uj, 42_000);
        assert_eq!(report.stats.cpu_time_us, 10);
        assert_eq!(report.stats.peak_rss_bytes, 8192);
        assert_eq!(report.stats.io_ops, 0);
        assert_eq!(report.estimated_energy_uj, 0);

        for f in ["cpu.stat", "memory.peak", "io.stat"] {
            fs::remove_file(dir.join(f)).unwrap();
        }
        scope.close();
        assert!(!dir.exists());
    }
}
