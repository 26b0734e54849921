use std::{collections::HashSet, fs, io::ErrorKind, mem, path::PathBuf};

use log::{debug, info, warn};
use regex::Regex;

use crate::{
    perf_event::{read_all, CycleCounter},
    probe::{ContainerProbe, EntityKind, ResourceProbe},
    stats::{CounterDelta, ResourceCounters},
    Error, Result, Settings,
};

/// One monitored process, container or system, with its state between two intervals.
#[derive(Debug)]
pub struct MonitoredEntity<P> {
    probe: P,
    /// Cumulative counters, as of the last sample.
    current: ResourceCounters,
    /// Cumulative counters of the sample before, `None` until the entity has been
    /// sampled twice.
    previous: Option<ResourceCounters>,
    cycle_counters: Vec<CycleCounter>,
    /// Cycles of the last interval.
    cycles: u64,
    /// Energy attributed for the last interval, in microjoules.
    energy_uj: u64,
}

impl<P: ResourceProbe> MonitoredEntity<P> {
    /// Takes the baseline sample of a newly discovered entity and opens its cycle counters.
    pub fn discover(mut probe: P, cpus: &[u32]) -> Result<MonitoredEntity<P>> {
        let current = probe.sample()?;
        let cycle_counters = probe.open_cycle_counters(cpus);
        Ok(MonitoredEntity {
            probe,
            current,
            previous: None,
            cycle_counters,
            cycles: 0,
            energy_uj: 0,
        })
    }

    /// Samples the entity again: the cycle counters first (back-to-back), then the
    /// cumulative counters.
    ///
    /// If the entity has terminated, [`Error::EntityTerminated`] is returned and the
    /// counters of the previous interval are kept as they were.
    pub fn update(&mut self) -> Result<()> {
        let cycles = read_all(&mut self.cycle_counters);
        let sample = self.probe.sample()?;
        self.cycles = cycles;
        self.previous = Some(mem::replace(&mut self.current, sample));
        Ok(())
    }

    /// Discards the cycles counted so far, to start a new interval.
    pub fn reset_cycles(&mut self) {
        read_all(&mut self.cycle_counters);
    }

    pub fn identifier(&self) -> String {
        self.probe.identifier()
    }

    pub fn kind(&self) -> EntityKind {
        self.probe.kind()
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn counters(&self) -> ResourceCounters {
        self.current
    }

    /// Difference between the last two samples.
    pub fn delta(&self) -> Option<CounterDelta> {
        self.previous.map(|prev| self.current.delta_since(&prev))
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn energy_uj(&self) -> u64 {
        self.energy_uj
    }

    pub fn set_energy_estimate(&mut self, energy_uj: u64) {
        self.energy_uj = energy_uj;
    }

    /// Number of cycle counters that are still open.
    pub fn open_counters(&self) -> usize {
        self.cycle_counters.iter().filter(|c| c.is_open()).count()
    }

    pub fn close_counters(&mut self) {
        self.cycle_counters.iter_mut().for_each(CycleCounter::close);
    }
}

/// A bounded pool of monitored entities, in no particular order.
///
/// Removal swaps the last entity into the freed slot. Code that removes while iterating
/// by index must look at the same index again after a removal.
#[derive(Debug)]
pub struct EntityRegistry<P> {
    entities: Vec<MonitoredEntity<P>>,
    capacity: usize,
}

impl<P: ResourceProbe> EntityRegistry<P> {
    pub fn new(capacity: usize) -> EntityRegistry<P> {
        EntityRegistry {
            entities: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entities.len() >= self.capacity
    }

    pub fn get(&self, index: usize) -> Option<&MonitoredEntity<P>> {
        self.entities.get(index)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.identifier() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitoredEntity<P>> {
        self.entities.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MonitoredEntity<P>> {
        self.entities.iter_mut()
    }

    /// Adds an entity and returns its index.
    ///
    /// A full registry rejects the entity (whose counters are then closed) and stays unchanged.
    pub fn add(&mut self, entity: MonitoredEntity<P>) -> Result<usize> {
        let id = entity.identifier();
        if self.is_full() {
            return Err(Error::RegistryFull {
                id,
                capacity: self.capacity,
            });
        }
        if self.contains(&id) {
            debug!("{id} is already monitored");
            return Ok(self.position(&id).unwrap_or_default());
        }
        self.entities.push(entity);
        Ok(self.entities.len() - 1)
    }

    /// Closes the counters of the entity at `index`, then removes it.
    /// The last entity takes its place.
    pub fn remove(&mut self, index: usize) -> MonitoredEntity<P> {
        self.entities[index].close_counters();
        self.entities.swap_remove(index)
    }

    pub fn remove_by_id(&mut self, id: &str) -> Option<MonitoredEntity<P>> {
        self.position(id).map(|i| self.remove(i))
    }

    /// Updates every entity, and removes the ones that have terminated.
    ///
    /// Returns the identifiers of the removed entities.
    pub fn update_all(&mut self) -> Vec<String> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.entities.len() {
            match self.entities[i].update() {
                Ok(()) => i += 1,
                Err(e) if e.is_terminated() => {
                    info!("{e}, no longer monitored");
                    let gone = self.remove(i);
                    removed.push(gone.identifier());
                    // the last entity is now at index i, don't skip it
                }
                Err(e) => {
                    warn!("failed to update {}: {e}", self.entities[i].identifier());
                    i += 1;
                }
            }
        }
        removed
    }
}

/// Finds the container cgroups, which are directories named `<prefix><id><suffix>`
/// in the container slice (for instance `docker-<id>.scope` in `system.slice`).
#[derive(Debug, Clone)]
pub struct ContainerDiscovery {
    dir: PathBuf,
    pattern: Regex,
    /// Containers left out because the registry was full, warned about once.
    rejected: HashSet<String>,
}

impl ContainerDiscovery {
    pub fn new(settings: &Settings) -> anyhow::Result<ContainerDiscovery> {
        let pattern = format!(
            "^{}(.+){}$",
            regex::escape(&settings.container_prefix),
            regex::escape(&settings.container_suffix)
        );
        Ok(ContainerDiscovery {
            dir: settings.container_dir(),
            pattern: Regex::new(&pattern)?,
            rejected: HashSet::new(),
        })
    }

    /// Extracts the container id from a cgroup directory name.
    pub fn container_id<'a>(&self, dir_name: &'a str) -> Option<&'a str> {
        self.pattern.captures(dir_name).and_then(|c| c.get(1)).map(|m| m.as_str())
    }

    /// Lists the containers that currently exist, sorted by id.
    pub fn scan(&self) -> Vec<ContainerProbe> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{:?} does not exist, is cgroup v2 mounted?", self.dir);
                return Vec::new();
            }
            Err(e) => {
                warn!("cannot list containers in {:?}: {e}", self.dir);
                return Vec::new();
            }
        };
        let mut found: Vec<ContainerProbe> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                self.container_id(&name)
                    .map(|id| ContainerProbe::new(id, e.path()))
            })
            .collect();
        found.sort_by_key(|p| p.identifier());
        found
    }

    /// Adds the containers that are not tracked yet, as long as the registry has room.
    ///
    /// Returns the identifiers of the new containers.
    pub fn admit_new(
        &mut self,
        registry: &mut EntityRegistry<ContainerProbe>,
        cpus: &[u32],
    ) -> Vec<String> {
        let mut added = Vec::new();
        let found = self.scan();
        // a rejected container that stops and comes back is reported again
        self.rejected.retain(|id| found.iter().any(|p| &p.identifier() == id));
        for probe in found {
            let id = probe.identifier();
            if registry.contains(&id) {
                continue;
            }
            if registry.is_full() {
                if self.rejected.insert(id.clone()) {
                    warn!(
                        "container {id} is not monitored: already monitoring {} containers",
                        registry.capacity()
                    );
                }
                continue;
            }
            self.rejected.remove(&id);
            match MonitoredEntity::discover(probe, cpus) {
                Ok(entity) => match registry.add(entity) {
                    Ok(_) => {
                        info!("monitoring container {id}");
                        added.push(id);
                    }
                    Err(e) => warn!("{e}"),
                },
                // probably stopped right after the scan
                Err(e) => debug!("skipping container {id}: {e}"),
            }
        }
        added
    }
}
