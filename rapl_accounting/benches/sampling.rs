use std::{fs, time::Duration};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rapl_accounting::{
    perf_event::{open_per_cpu, read_all, CounterScope},
    powercap::RaplReader,
    probe::{ContainerProbe, ResourceProbe, SystemProbe},
    registry::{ContainerDiscovery, EntityRegistry},
    RaplDomainType, Settings,
};

fn fake_containers(n: usize) -> (tempfile::TempDir, Settings) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        cgroup_root: dir.path().to_path_buf(),
        max_containers: n,
        ..Default::default()
    };
    for i in 0..n {
        let c = settings.container_dir().join(format!("docker-{i:064x}.scope"));
        fs::create_dir_all(&c).unwrap();
        fs::write(c.join("cpu.stat"), "usage_usec 123456789\nuser_usec 100000000\nsystem_usec 23456789\n").unwrap();
        let io_stat = "8:0 rbytes=1459200 wbytes=314773504 rios=192 wios=353 dbytes=0 dios=0\n";
        fs::write(c.join("io.stat"), io_stat).unwrap();
        fs::write(c.join("memory.current"), "268435456\n").unwrap();
    }
    (dir, settings)
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampling");
    group
        .significance_level(0.01)
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(10));

    // the real RAPL counters, if readable
    let rapl = RaplReader::new(&Settings::default().powercap_root);
    group.bench_function("rapl_snapshot", |b| {
        b.iter(|| black_box(rapl.snapshot()));
    });
    let before = rapl.snapshot();
    group.bench_function("rapl_consumed", |b| {
        b.iter(|| black_box(rapl.consumed_between(&before, &rapl.snapshot(), &RaplDomainType::ATTRIBUTED)));
    });

    let mut system = SystemProbe::new();
    group.bench_function("system_probe", |b| {
        b.iter(|| black_box(system.sample().unwrap()));
    });

    let cpus = rapl_accounting::online_cpus().unwrap();
    let mut counters = open_per_cpu(&cpus, "the benchmark", CounterScope::Cpu);
    group.bench_function("read_cpu_cycles", |b| {
        b.iter(|| black_box(read_all(&mut counters)));
    });

    for n in [1, 5, 25] {
        let (_dir, settings) = fake_containers(n);
        let mut discovery = ContainerDiscovery::new(&settings).unwrap();
        let mut registry: EntityRegistry<ContainerProbe> = EntityRegistry::new(n);
        discovery.admit_new(&mut registry, &[]);

        group.bench_function(BenchmarkId::new("update_containers", n), |b| {
            b.iter(|| black_box(registry.update_all()));
        });
        group.bench_function(BenchmarkId::new("scan_containers", n), |b| {
            b.iter(|| black_box(discovery.scan()));
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
