use std::{
    fs,
    io::{self, ErrorKind},
    path::Path,
    time::{Duration, Instant},
};

use log::{info, warn};

use crate::{powercap::RaplReader, Error, RaplDomainType, Result};

pub const DEFAULT_CALIBRATION_FILE: &str = "config_idle.txt";

/// Number of one-second intervals sampled by a calibration run.
pub const CALIBRATION_INTERVALS: usize = 180;

/// Energy drawn by the machine when idle, in microjoules per second.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IdleCalibration {
    /// Mean over the calibration intervals.
    pub average_uj_per_s: u64,
    /// Minimum over the calibration intervals. Used when subtracting the average
    /// would remove more energy than what was measured.
    pub minimum_uj_per_s: u64,
}

impl IdleCalibration {
    /// Loads the calibration file written by [`IdleCalibration::save`].
    ///
    /// A missing file is not an error: nothing is subtracted, and a warning says so.
    pub fn load(path: &Path) -> Result<IdleCalibration> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("No idle calibration found at {path:?}, idle consumption will not be subtracted.");
                warn!("Run the calibration on an idle system first.");
                return Ok(IdleCalibration::default());
            }
            Err(e) => return Err(e.into()),
        };
        let calibration = Self::parse(&content).map_err(|reason| Error::Calibration {
            path: path.to_path_buf(),
            reason,
        })?;
        info!(
            "Idle consumption: {} µJ/s on average, {} µJ/s at minimum",
            calibration.average_uj_per_s, calibration.minimum_uj_per_s
        );
        Ok(calibration)
    }

    fn parse(content: &str) -> std::result::Result<IdleCalibration, String> {
        let mut values = content.split_whitespace().map(|v| v.parse::<u64>());
        let mut next = |name: &str| match values.next() {
            Some(Ok(v)) => Ok(v),
            Some(Err(e)) => Err(format!("invalid {name}: {e}")),
            None => Err(format!("missing {name}")),
        };
        let average_uj_per_s = next("average")?;
        let minimum_uj_per_s = next("minimum")?;
        Ok(IdleCalibration {
            average_uj_per_s,
            minimum_uj_per_s,
        })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(path, format!("{}\n{}\n", self.average_uj_per_s, self.minimum_uj_per_s))
    }
}

/// Measures the idle consumption of the machine: package + DRAM energy is sampled once per
/// `period`, `intervals` times, and the mean and minimum per-second values are returned.
///
/// This blocks for about `intervals * period`, the machine should be idle meanwhile.
/// The energy is divided by the time actually elapsed between two snapshots, which is
/// always a bit more than `period`.
pub fn calibrate(
    reader: &RaplReader,
    intervals: usize,
    period: Duration,
) -> Result<IdleCalibration> {
    if !reader.supports(RaplDomainType::Package) {
        return Err(Error::Calibration {
            path: Default::default(),
            reason: "the package RAPL domain is not readable".to_owned(),
        });
    }
    if intervals == 0 || period.is_zero() {
        return Err(Error::Calibration {
            path: Default::default(),
            reason: "at least one non-empty interval is required".to_owned(),
        });
    }

    let mut per_interval = Vec::with_capacity(intervals);
    let mut previous = reader.snapshot();
    let mut previous_t = Instant::now();
    for i in 0..intervals {
        std::thread::sleep(period);
        let current = reader.snapshot();
        let t = Instant::now();
        let consumed = reader.consumed_between(&previous, &current, &RaplDomainType::ATTRIBUTED);
        let elapsed = t - previous_t;
        log::debug!("calibration interval {i}: {consumed} µJ in {elapsed:?}");
        per_interval.push((consumed, elapsed));
        previous = current;
        previous_t = t;
    }

    let calibration = summarize(&per_interval);
    info!(
        "New idle energy consumption: {} µJ/s (minimum {} µJ/s)",
        calibration.average_uj_per_s, calibration.minimum_uj_per_s
    );
    Ok(calibration)
}

/// Turns `(energy, elapsed)` intervals into per-second mean and minimum.
fn summarize(per_interval: &[(u64, Duration)]) -> IdleCalibration {
    let per_second = |uj: u64, elapsed: Duration| match elapsed.as_secs_f64() {
        secs if secs > 0.0 => (uj as f64 / secs).round() as u64,
        _ => 0,
    };
    let total_uj: u64 = per_interval.iter().map(|(uj, _)| *uj).sum();
    let total_time: Duration = per_interval.iter().map(|(_, t)| *t).sum();
    let minimum = per_interval
        .iter()
        .map(|(uj, t)| per_second(*uj, *t))
        .min()
        .unwrap_or(0);
    IdleCalibration {
        average_uj_per_s: per_second(total_uj, total_time),
        minimum_uj_per_s: minimum,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{calibrate, summarize, IdleCalibration};
    use crate::{
        powercap::{tests::fake_powercap, RaplReader},
        Error,
    };

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_idle.txt");
        let calib = IdleCalibration {
            average_uj_per_s: 900_000,
            minimum_uj_per_s: 700_000,
        };
        calib.save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "900000\n700000\n");
        assert_eq!(IdleCalibration::load(&path).unwrap(), calib);
    }

    #[test]
    fn test_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let calib = IdleCalibration::load(&dir.path().join("nope.txt")).unwrap();
        assert_eq!(calib, IdleCalibration::default());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_idle.txt");
        std::fs::write(&path, "12\n").unwrap();
        assert!(matches!(IdleCalibration::load(&path), Err(Error::Calibration { .. })));
        std::fs::write(&path, "12\nabc\n").unwrap();
        assert!(matches!(IdleCalibration::load(&path), Err(Error::Calibration { .. })));
    }

    #[test]
    fn test_summarize() {
        let secs = Duration::from_secs;
        let calib = summarize(&[(10, secs(1)), (30, secs(1)), (20, secs(1))]);
        assert_eq!(calib.average_uj_per_s, 20);
        assert_eq!(calib.minimum_uj_per_s, 10);

        // per second, not per interval
        let half = Duration::from_millis(500);
        let calib = summarize(&[(10, half), (30, half), (20, half)]);
        assert_eq!(calib.average_uj_per_s, 40);
        assert_eq!(calib.minimum_uj_per_s, 20);
    }

    #[test]
    fn test_summarize_uses_elapsed_time() {
        // a constant 100000 µJ/s, with sleeps that overran by various amounts
        let calib = summarize(&[
            (100_000, Duration::from_millis(1000)),
            (105_000, Duration::from_millis(1050)),
            (2_000, Duration::from_millis(20)),
        ]);
        assert_eq!(calib.average_uj_per_s, 100_000);
        assert_eq!(calib.minimum_uj_per_s, 100_000);

        assert_eq!(summarize(&[(5, Duration::ZERO)]), IdleCalibration::default());
    }

    #[test]
    fn test_calibrate_constant_counter() {
        let dir = tempfile::tempdir().unwrap();
        fake_powercap(dir.path(), 1);
        let reader = RaplReader::new(dir.path());
        // the fake counters don't move
        let calib = calibrate(&reader, 2, Duration::from_millis(1)).unwrap();
        assert_eq!(calib, IdleCalibration::default());
    }

    #[test]
    fn test_calibrate_without_rapl() {
        let dir = tempfile::tempdir().unwrap();
        let reader = RaplReader::new(dir.path());
        assert!(calibrate(&reader, 2, Duration::from_millis(1)).is_err());
    }
}
