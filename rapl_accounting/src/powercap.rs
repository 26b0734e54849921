// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use enum_map::EnumMap;
use log::{debug, warn};

use super::RaplDomainType;

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";

/// A power zone.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `core`.
    pub name: String,

    /// The RAPL domain type, as an enum
    pub domain: RaplDomainType,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone.
    pub path: PathBuf,

    /// The id of the socket that "contains" this zone, if applicable (psys has no socket)
    pub socket_id: Option<u32>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let socket = self.socket_id.map(|s| s.to_string()).unwrap_or_else(|| "-".to_owned());
        write!(f, "{} ({:?}, socket {socket}): {}", self.name, self.domain, self.path.display())
    }
}

/// Discovers all the RAPL power zones below `root`, sorted by path.
pub fn all_power_zones(root: &Path) -> anyhow::Result<Vec<PowerZone>> {
    fn parse_zone_name(name: &str) -> Option<RaplDomainType> {
        match name {
            "psys" => Some(RaplDomainType::Platform),
            "core" => Some(RaplDomainType::PP0),
            "uncore" => Some(RaplDomainType::PP1),
            "dram" => Some(RaplDomainType::Dram),
            _ if name.starts_with("package-") => Some(RaplDomainType::Package),
            _ => None,
        }
    }

    /// Recursively explore a power zone
    fn explore_rec(dir: &Path, parent_socket: Option<u32>, flat: &mut Vec<PowerZone>) -> anyhow::Result<()> {
        for e in fs::read_dir(dir).with_context(|| format!("Failed to list {dir:?}"))? {
            let entry = e?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().to_string();

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let name = fs::read_to_string(&name_path)
                    .with_context(|| format!("Failed to read {name_path:?}"))?
                    .trim()
                    .to_owned();
                let socket_id = {
                    if let Some(parent_id) = parent_socket {
                        Some(parent_id)
                    } else if let Some(id_str) = name.strip_prefix("package-") {
                        let id: u32 = id_str
                            .parse()
                            .with_context(|| format!("Failed to extract package id from '{name}'"))?;
                        Some(id)
                    } else {
                        None
                    }
                };
                explore_rec(&path, socket_id, flat)?; // recursively explore
                match parse_zone_name(&name) {
                    Some(domain) => flat.push(PowerZone {
                        name,
                        domain,
                        path,
                        socket_id,
                    }),
                    None => debug!("ignoring unknown RAPL powercap zone {name}"),
                }
            }
        }
        Ok(())
    }
    let mut flat = Vec::new();
    explore_rec(root, None, &mut flat)?;
    flat.sort_by_key(|z| z.path.to_string_lossy().to_string());
    Ok(flat)
}

/// Difference between two readings of a wrapping energy counter.
///
/// If `before > after`, the counter went past `max_range` during the interval.
/// Only one wraparound can be corrected, the polling interval must be short enough.
pub fn correct_wraparound(before: u64, after: u64, max_range: u64) -> u64 {
    if before > after {
        let corrected = (after as u128 + max_range as u128).saturating_sub(before as u128);
        corrected.min(u64::MAX as u128) as u64
    } else {
        after - before
    }
}

/// A zone whose counter can be read, with the range at which it wraps.
#[derive(Debug, Clone)]
struct ReadableZone {
    zone: PowerZone,
    /// The maximum energy value for this zone, as reported by `max_energy_range_uj`
    max_energy_uj: u64,
}

/// The raw counter values of all the zones of a [`RaplReader`], at one point in time.
///
/// `None` marks a zone that could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergySnapshot {
    values: Vec<Option<u64>>,
}

/// Reads the RAPL energy counters exposed by powercap.
///
/// Reading is stateless: every read opens the sysfs file again, only the zones and
/// their maximum range are kept.
#[derive(Debug, Clone)]
pub struct RaplReader {
    zones: Vec<ReadableZone>,
}

impl RaplReader {
    /// Discovers the zones below `root` and reads their maximum range.
    ///
    /// Zones whose maximum range cannot be read (usually for lack of privilege) are dropped.
    /// A machine without RAPL gives an empty reader, which measures zero energy.
    pub fn new(root: &Path) -> RaplReader {
        let zones = match all_power_zones(root) {
            Ok(zones) => zones,
            Err(e) => {
                warn!("No RAPL powercap zones, energy will be reported as zero: {e:#}");
                Vec::new()
            }
        };
        let zones = zones
            .into_iter()
            .filter_map(|zone| match read_u64(&zone.max_energy_path()) {
                Some(max_energy_uj) => Some(ReadableZone { zone, max_energy_uj }),
                None => {
                    warn!("Cannot read {:?}, zone {} is unsupported", zone.max_energy_path(), zone.name);
                    None
                }
            })
            .collect();
        RaplReader { zones }
    }

    pub fn zones(&self) -> impl Iterator<Item = &PowerZone> {
        self.zones.iter().map(|z| &z.zone)
    }

    /// The maximum range of the first zone of that domain, if any.
    pub fn max_range(&self, domain: RaplDomainType) -> Option<u64> {
        self.first_zone(domain).map(|z| z.max_energy_uj)
    }

    pub fn supports(&self, domain: RaplDomainType) -> bool {
        self.first_zone(domain).is_some()
    }

    fn first_zone(&self, domain: RaplDomainType) -> Option<&ReadableZone> {
        self.zones.iter().find(|z| z.zone.domain == domain)
    }

    /// Reads the counter of the first zone (socket 0) of `domain`, in microjoules.
    ///
    /// Returns `None` if the domain is unsupported or its counter cannot be read,
    /// the caller must count it as zero.
    pub fn read_domain_energy(&self, domain: RaplDomainType) -> Option<u64> {
        self.first_zone(domain).and_then(|z| read_u64(&z.zone.energy_path()))
    }

    /// Reads the counters of all the zones.
    pub fn snapshot(&self) -> EnergySnapshot {
        let values = self.zones.iter().map(|z| read_u64(&z.zone.energy_path())).collect();
        EnergySnapshot { values }
    }

    /// Energy consumed between two snapshots, per domain and summed over the sockets.
    ///
    /// Wraparounds are corrected zone by zone. A zone missing from one of the
    /// snapshots contributes zero.
    pub fn consumed_per_domain(
        &self,
        before: &EnergySnapshot,
        after: &EnergySnapshot,
    ) -> EnumMap<RaplDomainType, u64> {
        let mut res = EnumMap::default();
        for ((zone, b), a) in self.zones.iter().zip(&before.values).zip(&after.values) {
            if let (Some(b), Some(a)) = (b, a) {
                res[zone.zone.domain] += correct_wraparound(*b, *a, zone.max_energy_uj);
            }
        }
        res
    }

    /// Energy consumed by `domains` between two snapshots, in microjoules.
    pub fn consumed_between(
        &self,
        before: &EnergySnapshot,
        after: &EnergySnapshot,
        domains: &[RaplDomainType],
    ) -> u64 {
        let per_domain = self.consumed_per_domain(before, after);
        domains.iter().map(|d| per_domain[*d]).sum()
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    match fs::read_to_string(path) {
        Ok(content) => match content.trim_end().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                debug!("failed to parse {path:?}: '{content}'");
                None
            }
        },
        Err(e) => {
            debug!("cannot read {path:?}: {e}");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{fs, path::Path};

    use super::{all_power_zones, correct_wraparound, RaplReader};
    use crate::RaplDomainType;

    /// Creates a powercap-like tree with one package (and its dram subzone) per socket.
    pub(crate) fn fake_powercap(root: &Path, sockets: u32) {
        for s in 0..sockets {
            let pkg = root.join(format!("intel-rapl:{s}"));
            let dram = pkg.join(format!("intel-rapl:{s}:0"));
            fs::create_dir_all(&dram).unwrap();
            fs::write(pkg.join("name"), format!("package-{s}\n")).unwrap();
            fs::write(pkg.join("max_energy_range_uj"), "1000000\n").unwrap();
            fs::write(pkg.join("energy_uj"), "0\n").unwrap();
            fs::write(dram.join("name"), "dram\n").unwrap();
            fs::write(dram.join("max_energy_range_uj"), "500000\n").unwrap();
            fs::write(dram.join("energy_uj"), "0\n").unwrap();
        }
    }

    pub(crate) fn set_energy(root: &Path, zone: &str, value: u64) {
        fs::write(root.join(zone).join("energy_uj"), format!("{value}\n")).unwrap();
    }

    #[test]
    fn test_wraparound() {
        assert_eq!(correct_wraparound(100, 250, 1000), 150);
        assert_eq!(correct_wraparound(100, 100, 1000), 0);
        assert_eq!(correct_wraparound(900, 50, 1000), 150);
        // never negative, even with an inconsistent range
        assert_eq!(correct_wraparound(900, 50, 10), 0);
        assert_eq!(correct_wraparound(u64::MAX, 0, u64::MAX), 0);
    }

    #[test]
    fn test_zone_discovery() {
        let dir = tempfile::tempdir().unwrap();
        fake_powercap(dir.path(), 2);
        let zones = all_power_zones(dir.path()).unwrap();
        assert_eq!(zones.len(), 4);
        let drams: Vec<_> = zones.iter().filter(|z| z.domain == RaplDomainType::Dram).collect();
        assert_eq!(drams.len(), 2);
        assert_eq!(drams[0].socket_id, Some(0));
        assert_eq!(drams[1].socket_id, Some(1));
    }

    #[test]
    fn test_read_and_wrap_per_zone() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fake_powercap(root, 2);
        let reader = RaplReader::new(root);
        assert_eq!(reader.max_range(RaplDomainType::Package), Some(1_000_000));
        assert_eq!(reader.max_range(RaplDomainType::Dram), Some(500_000));
        assert!(!reader.supports(RaplDomainType::Platform));
        assert_eq!(reader.read_domain_energy(RaplDomainType::Platform), None);

        set_energy(root, "intel-rapl:0", 999_000);
        set_energy(root, "intel-rapl:1", 10);
        set_energy(root, "intel-rapl:0/intel-rapl:0:0", 400_000);
        let before = reader.snapshot();
        assert_eq!(reader.read_domain_energy(RaplDomainType::Package), Some(999_000));

        // socket 0 package wraps, socket 1 doesn't, dram 0 wraps with its own range
        set_energy(root, "intel-rapl:0", 1_000);
        set_energy(root, "intel-rapl:1", 110);
        set_energy(root, "intel-rapl:0/intel-rapl:0:0", 100_000);
        let after = reader.snapshot();

        let per_domain = reader.consumed_per_domain(&before, &after);
        assert_eq!(per_domain[RaplDomainType::Package], 2_000 + 100);
        assert_eq!(per_domain[RaplDomainType::Dram], 200_000);
        assert_eq!(reader.consumed_between(&before, &after, &RaplDomainType::ATTRIBUTED), 202_100);
    }

    #[test]
    fn test_unreadable_zone_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fake_powercap(root, 1);
        let reader = RaplReader::new(root);
        let before = reader.snapshot();
        fs::remove_file(root.join("intel-rapl:0/energy_uj")).unwrap();
        let after = reader.snapshot();
        assert_eq!(reader.read_domain_energy(RaplDomainType::Package), None);
        assert_eq!(reader.consumed_between(&before, &after, &[RaplDomainType::Package]), 0);
    }

    #[test]
    fn test_no_rapl() {
        let reader = RaplReader::new(Path::new("/nonexistent/powercap"));
        assert_eq!(reader.zones().count(), 0);
        let s = reader.snapshot();
        assert_eq!(reader.consumed_between(&s, &s, &RaplDomainType::ALL), 0);
    }
}
