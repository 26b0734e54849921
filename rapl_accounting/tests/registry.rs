use std::{
    fs,
    path::{Path, PathBuf},
};

use rapl_accounting::{
    probe::{ContainerProbe, ResourceProbe},
    registry::{ContainerDiscovery, EntityRegistry, MonitoredEntity},
    Error, Settings,
};

/// A cgroup v2 tree with a `system.slice`, where containers can be created and updated.
struct FakeCgroups {
    _dir: tempfile::TempDir,
    settings: Settings,
}

impl FakeCgroups {
    fn new(max_containers: usize) -> FakeCgroups {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("system.slice")).unwrap();
        let settings = Settings {
            cgroup_root: dir.path().to_path_buf(),
            max_containers,
            ..Default::default()
        };
        FakeCgroups { _dir: dir, settings }
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.settings.container_dir().join(format!("docker-{id}.scope"))
    }

    fn set(&self, id: &str, usage_usec: u64, memory: u64, rios: u64, wios: u64) {
        let dir = self.container_dir(id);
        fs::create_dir_all(&dir).unwrap();
        write_stats(&dir, usage_usec, memory, rios, wios);
    }
}

fn write_stats(dir: &Path, usage_usec: u64, memory: u64, rios: u64, wios: u64) {
    fs::write(
        dir.join("cpu.stat"),
        format!("usage_usec {usage_usec}\nuser_usec {usage_usec}\nsystem_usec 0\n"),
    )
    .unwrap();
    fs::write(
        dir.join("io.stat"),
        format!("8:0 rbytes=0 wbytes=0 rios={rios} wios={wios} dbytes=0 dios=0\n8:16 rios=1000 wios=1000\n"),
    )
    .unwrap();
    fs::write(dir.join("memory.current"), format!("{memory}\n")).unwrap();
}

fn ids(registry: &EntityRegistry<ContainerProbe>) -> Vec<String> {
    let mut ids: Vec<String> = registry.iter().map(|e| e.identifier()).collect();
    ids.sort();
    ids
}

#[test]
fn discovery_ignores_other_cgroups() {
    let cgroups = FakeCgroups::new(25);
    cgroups.set("c1", 0, 0, 0, 0);
    cgroups.set("c2", 0, 0, 0, 0);
    fs::create_dir(cgroups.settings.container_dir().join("cron.service")).unwrap();
    fs::write(cgroups.settings.container_dir().join("docker-c3.scope"), "not a directory").unwrap();

    let discovery = ContainerDiscovery::new(&cgroups.settings).unwrap();
    let found: Vec<String> = discovery.scan().iter().map(|p| p.identifier()).collect();
    assert_eq!(found, vec!["c1", "c2"]);
}

#[test]
fn missing_slice_means_no_container() {
    let settings = Settings {
        cgroup_root: "/nonexistent/cgroup".into(),
        ..Default::default()
    };
    let discovery = ContainerDiscovery::new(&settings).unwrap();
    assert!(discovery.scan().is_empty());
}

#[test]
fn delta_is_difference_of_consecutive_samples() {
    let cgroups = FakeCgroups::new(25);
    cgroups.set("web", 1_000, 4096, 10, 5);

    let probe = ContainerProbe::new("web", cgroups.container_dir("web"));
    let mut entity = MonitoredEntity::discover(probe, &[]).unwrap();
    assert!(entity.delta().is_none());

    cgroups.set("web", 3_500, 2048, 12, 9);
    entity.update().unwrap();
    let delta = entity.delta().unwrap();
    assert_eq!(delta.cpu_time_us, 2_500);
    assert_eq!(delta.memory_bytes, -2048);
    // only the first device of io.stat counts
    assert_eq!(delta.io_ops, 6);
    assert_eq!(entity.counters().io_ops, 21);
}

#[test]
fn full_registry_is_unchanged() {
    let cgroups = FakeCgroups::new(2);
    for id in ["a", "b", "c"] {
        cgroups.set(id, 0, 0, 0, 0);
    }
    let mut discovery = ContainerDiscovery::new(&cgroups.settings).unwrap();
    let mut registry = EntityRegistry::new(cgroups.settings.max_containers);

    let added = discovery.admit_new(&mut registry, &[]);
    assert_eq!(added, vec!["a", "b"]);
    assert!(registry.is_full());

    let extra = MonitoredEntity::discover(ContainerProbe::new("c", cgroups.container_dir("c")), &[]).unwrap();
    match registry.add(extra) {
        Err(Error::RegistryFull { id, capacity }) => {
            assert_eq!(id, "c");
            assert_eq!(capacity, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(ids(&registry), vec!["a", "b"]);

    // rescanning doesn't change anything either
    assert!(discovery.admit_new(&mut registry, &[]).is_empty());
    assert_eq!(registry.len(), 2);
}

#[test]
fn stopped_container_is_removed_at_next_poll() {
    let cgroups = FakeCgroups::new(25);
    for id in ["alpha", "beta", "gamma"] {
        cgroups.set(id, 0, 0, 0, 0);
    }
    let mut discovery = ContainerDiscovery::new(&cgroups.settings).unwrap();
    let mut registry = EntityRegistry::new(cgroups.settings.max_containers);
    discovery.admit_new(&mut registry, &[]);
    assert_eq!(registry.len(), 3);

    for poll in 1..=5u64 {
        for id in ["alpha", "beta", "gamma"] {
            cgroups.set(id, poll * 100, 4096, poll, poll);
        }
        if poll == 5 {
            // beta stops: its cgroup files vanish
            fs::remove_file(cgroups.container_dir("beta").join("cpu.stat")).unwrap();
        }

        let removed = registry.update_all();
        discovery.admit_new(&mut registry, &[]);

        if poll < 5 {
            assert!(removed.is_empty(), "poll {poll}");
            assert_eq!(registry.len(), 3);
        } else {
            assert_eq!(removed, vec!["beta"]);
            assert_eq!(ids(&registry), vec!["alpha", "gamma"]);
        }
        for entity in registry.iter() {
            let delta = entity.delta().unwrap();
            assert_eq!(delta.cpu_time_us, 100, "poll {poll}");
            assert_eq!(delta.io_ops, 2, "poll {poll}");
            assert_eq!(delta.memory_bytes, if poll == 1 { 4096 } else { 0 });
        }
    }
}

#[test]
fn new_containers_are_admitted_on_rescan() {
    let cgroups = FakeCgroups::new(25);
    cgroups.set("first", 0, 0, 0, 0);
    let mut discovery = ContainerDiscovery::new(&cgroups.settings).unwrap();
    let mut registry = EntityRegistry::new(cgroups.settings.max_containers);
    assert_eq!(discovery.admit_new(&mut registry, &[]), vec!["first"]);

    cgroups.set("second", 50, 0, 0, 0);
    registry.update_all();
    assert_eq!(discovery.admit_new(&mut registry, &[]), vec!["second"]);
    let second = registry.get(registry.position("second").unwrap()).unwrap();
    assert!(second.delta().is_none());
    assert_eq!(second.counters().cpu_time_us, 50);
}
