//! Cycle-fraction attribution of the measured energy.
//!
//! An entity gets the share of the non-idle energy that corresponds to its share of the
//! CPU cycles of the whole machine during the interval. This is a proportional model, not a
//! measurement: it assumes that energy scales linearly with the number of cycles.

use crate::calibration::IdleCalibration;

/// Estimates the energy consumed by one entity during an interval, in microjoules.
///
/// # Arguments
/// * `system_cycles` - cycles of all the CPUs during the interval
/// * `entity_cycles` - cycles of the entity during the interval
/// * `energy_uj` - measured (package + DRAM) energy of the interval
/// * `elapsed_s` - duration of the interval
/// * `idle` - calibrated idle consumption, subtracted before splitting
///
/// Returns 0 when the entity has not run, or when the idle consumption alone (even at its
/// calibrated minimum) is larger than the measured energy.
pub fn estimate_entity_energy(
    system_cycles: u64,
    entity_cycles: u64,
    energy_uj: u64,
    elapsed_s: f64,
    idle: &IdleCalibration,
) -> u64 {
    if entity_cycles == 0 {
        return 0;
    }

    let measured = energy_uj as f64;
    let mut idle_uj = idle.average_uj_per_s as f64 * elapsed_s;
    if idle_uj > measured {
        idle_uj = idle.minimum_uj_per_s as f64 * elapsed_s;
        if idle_uj > measured {
            return 0;
        }
    }

    let fraction = if system_cycles == 0 {
        0.0
    } else {
        entity_cycles as f64 / system_cycles as f64
    };
    (fraction * (measured - idle_uj)).round().max(0.0) as u64
}
