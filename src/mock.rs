//! # Mock Generator
//!
//! Synthetic three-phase measurement sets for running without hardware.
//!
//! Values are random but electrically consistent within a set:
//!
//! - `P = V·I·cosφ / 1000` (kW)
//! - `Q = P·tan(acos(cosφ))` (kVAR)
//! - `S = √(P² + Q²)` (kVA)
//!
//! Totals are sums of the rounded phase values. Energy counters are
//! independent draws on every call, not running totals.

use rand::Rng;
use tracing::debug;

use crate::codec::round_to;
use crate::measurement::Measurement;
use crate::registers::RegisterDescriptor;

const PHASES: [&str; 3] = ["L1", "L2", "L3"];
const PHASES_LN: [&str; 3] = ["L1-N", "L2-N", "L3-N"];
const PHASES_LL: [&str; 3] = ["L1-L2", "L2-L3", "L3-L1"];

/// Uniform draw in `[min, max)` rounded to `places` decimals.
fn uniform<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64, places: u32) -> f64 {
    round_to(rng.gen_range(min..max), places)
}

/// Nominal voltage with ±5% variation and ±1 V noise.
fn voltage<R: Rng + ?Sized>(rng: &mut R, nominal: f64) -> f64 {
    let variation = uniform(rng, -0.05, 0.05, 2);
    let noise = uniform(rng, -1.0, 1.0, 2);
    round_to(nominal * (1.0 + variation) + noise, 2)
}

/// Generator of physically-consistent measurement sets.
#[derive(Debug, Clone)]
pub struct MockGenerator {
    /// Phase-to-neutral nominal voltage
    pub nominal_ln: f64,
    /// Phase-to-phase nominal voltage
    pub nominal_ll: f64,
    /// Base load per phase (A)
    pub base_currents: [f64; 3],
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self {
            nominal_ln: 230.0,
            nominal_ll: 400.0,
            base_currents: [25.0, 22.0, 28.0],
        }
    }
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a full set using the thread-local RNG.
    pub fn generate(&self, location: &str) -> Vec<Measurement> {
        self.generate_with(&mut rand::thread_rng(), location)
    }

    /// Generate a full set from the given RNG.
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R, location: &str) -> Vec<Measurement> {
        let mut out = Vec::with_capacity(32);

        let mut v_ln = [0.0; 3];
        for v in v_ln.iter_mut() {
            *v = voltage(rng, self.nominal_ln);
        }
        for (phase, v) in PHASES_LN.iter().zip(&v_ln) {
            out.push(Measurement::new("voltage", Some(*v), "V", Some(*phase)));
        }
        for phase in PHASES_LL {
            let v = voltage(rng, self.nominal_ll);
            out.push(Measurement::new("voltage", Some(v), "V", Some(phase)));
        }

        let mut currents = [0.0; 3];
        for (current, base) in currents.iter_mut().zip(self.base_currents) {
            let load = uniform(rng, 0.5, 1.5, 2);
            let noise = uniform(rng, -0.5, 0.5, 2);
            *current = round_to(base * load + noise, 2);
        }
        for (phase, i) in PHASES.iter().zip(&currents) {
            out.push(Measurement::new("current", Some(*i), "A", Some(*phase)));
        }
        let neutral = uniform(rng, 0.0, 2.0, 2);
        out.push(Measurement::new("current", Some(neutral), "A", Some("N")));

        let mut pf = [0.0; 3];
        for cos_phi in pf.iter_mut() {
            *cos_phi = uniform(rng, 0.85, 0.99, 3);
        }
        for (phase, cos_phi) in PHASES.iter().zip(&pf) {
            out.push(Measurement::new("power_factor", Some(*cos_phi), "", Some(*phase)));
        }
        let pf_total = round_to(pf.iter().sum::<f64>() / 3.0, 3);
        out.push(Measurement::new("power_factor", Some(pf_total), "", Some("total")));

        let active: Vec<f64> = (0..3)
            .map(|i| round_to(v_ln[i] * currents[i] * pf[i] / 1000.0, 3))
            .collect();
        let reactive: Vec<f64> = (0..3)
            .map(|i| round_to(active[i] * pf[i].acos().tan(), 3))
            .collect();
        let apparent: Vec<f64> = (0..3)
            .map(|i| round_to(active[i].hypot(reactive[i]), 3))
            .collect();

        for (metric, unit, values) in [
            ("active_power", "kW", &active),
            ("reactive_power", "kVAR", &reactive),
            ("apparent_power", "kVA", &apparent),
        ] {
            for (phase, value) in PHASES.iter().zip(values.iter()) {
                out.push(Measurement::new(metric, Some(*value), unit, Some(*phase)));
            }
            let total = round_to(values.iter().sum(), 3);
            out.push(Measurement::new(metric, Some(total), unit, Some("total")));
        }

        for (metric, unit, phase, min, max) in [
            ("energy_active", "kWh", "import", 1000.0, 5000.0),
            ("energy_active", "kWh", "export", 0.0, 100.0),
            ("energy_reactive", "kVARh", "import", 100.0, 500.0),
            ("energy_reactive", "kVARh", "export", 0.0, 50.0),
            ("energy_apparent", "kVAh", "total", 1100.0, 5500.0),
        ] {
            let value = uniform(rng, min, max, 2);
            out.push(Measurement::new(metric, Some(value), unit, Some(phase)));
        }

        let frequency = uniform(rng, 49.9, 50.1, 2);
        out.push(Measurement::new("frequency", Some(frequency), "Hz", None));

        debug!(location, count = out.len(), "Generated mock measurement set");
        out
    }

    /// Simulated single-register read.
    ///
    /// Returns the matching entry of a fresh set, or a random value carrying
    /// the descriptor's metadata when the set has no such metric/phase.
    pub fn mock_read(&self, descriptor: &RegisterDescriptor) -> Measurement {
        self.mock_read_with(&mut rand::thread_rng(), descriptor)
    }

    pub fn mock_read_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        descriptor: &RegisterDescriptor,
    ) -> Measurement {
        match self
            .generate_with(rng, "mock-read")
            .into_iter()
            .find(|m| m.matches(descriptor))
        {
            Some(m) => m,
            None => {
                let value = uniform(rng, 0.0, 100.0, 2);
                Measurement::from_descriptor(descriptor, Some(value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterCatalog;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn find(set: &[Measurement], metric: &str, phase: &str) -> f64 {
        set.iter()
            .find(|m| m.metric == metric && m.phase.as_deref() == Some(phase))
            .and_then(|m| m.value)
            .unwrap_or_else(|| panic!("missing {metric}/{phase}"))
    }

    #[test]
    fn test_shape_matches_catalog() {
        let set = MockGenerator::new().generate("sala-sport");
        let catalog = RegisterCatalog::pxr();
        assert_eq!(set.len(), catalog.len());
        for descriptor in catalog.iter() {
            assert!(
                set.iter().any(|m| m.matches(descriptor)),
                "no mock value for {}",
                descriptor.key
            );
        }
        assert!(set.iter().all(|m| m.value.is_some()));
    }

    #[test]
    fn test_output_order() {
        let set = MockGenerator::new().generate("sala-sport");
        let metrics: Vec<&str> = set.iter().map(|m| m.metric.as_str()).collect();
        assert_eq!(metrics[0], "voltage");
        assert_eq!(metrics[6], "current");
        assert_eq!(metrics[10], "power_factor");
        assert_eq!(metrics[14], "active_power");
        assert_eq!(metrics[31], "frequency");
        assert_eq!(set[31].phase, None);
    }

    #[test]
    fn test_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        let generator = MockGenerator::new();
        for _ in 0..200 {
            let set = generator.generate_with(&mut rng, "sala-sport");
            for phase in PHASES_LN {
                let v = find(&set, "voltage", phase);
                assert!((217.5..=242.5).contains(&v), "{v}");
            }
            for phase in PHASES_LL {
                let v = find(&set, "voltage", phase);
                assert!((379.0..=421.0).contains(&v), "{v}");
            }
            for phase in PHASES {
                let pf = find(&set, "power_factor", phase);
                assert!((0.85..=0.99).contains(&pf), "{pf}");
            }
            let n = find(&set, "current", "N");
            assert!((0.0..=2.0).contains(&n));
            let f = set[31].value.unwrap();
            assert!((49.9..=50.1).contains(&f));
        }
    }

    #[test]
    fn test_power_triangle_per_phase() {
        let mut rng = StdRng::seed_from_u64(42);
        let generator = MockGenerator::new();
        for _ in 0..500 {
            let set = generator.generate_with(&mut rng, "sala-sport");
            for phase in PHASES {
                let p = find(&set, "active_power", phase);
                let q = find(&set, "reactive_power", phase);
                let s = find(&set, "apparent_power", phase);
                assert!((s - (p * p + q * q).sqrt()).abs() < 1e-2, "{phase}: {p} {q} {s}");
            }
        }
    }

    #[test]
    fn test_power_totals() {
        let mut rng = StdRng::seed_from_u64(3);
        let generator = MockGenerator::new();
        for _ in 0..500 {
            let set = generator.generate_with(&mut rng, "sala-sport");
            for metric in ["active_power", "reactive_power", "apparent_power"] {
                let sum: f64 = PHASES.iter().map(|p| find(&set, metric, p)).sum();
                assert!((find(&set, metric, "total") - sum).abs() < 1e-6);
            }

            // Phase vectors with different angles do not add up in magnitude,
            // so the summed S bounds the magnitude of the summed P/Q from above.
            let p = find(&set, "active_power", "total");
            let q = find(&set, "reactive_power", "total");
            let s = find(&set, "apparent_power", "total");
            assert!(s >= (p * p + q * q).sqrt() - 1e-2, "{p} {q} {s}");
        }
    }

    #[test]
    fn test_power_factor_total_is_mean() {
        let set = MockGenerator::new().generate("sala-sport");
        let mean = PHASES.iter().map(|p| find(&set, "power_factor", p)).sum::<f64>() / 3.0;
        assert!((find(&set, "power_factor", "total") - mean).abs() < 1e-3);
    }

    #[test]
    fn test_mock_read_matches_descriptor() {
        let catalog = RegisterCatalog::pxr();
        let generator = MockGenerator::new();
        let descriptor = catalog.lookup("REACTIVE_POWER_L2").unwrap();
        let m = generator.mock_read(descriptor);
        assert!(m.matches(descriptor));
        assert_eq!(m.unit, "kVAR");
    }

    #[test]
    fn test_mock_read_unknown_quantity() {
        let descriptor = RegisterDescriptor::int16("THD_L1", 405001, "%", "thd", Some("L1"));
        let m = MockGenerator::new().mock_read(&descriptor);
        assert_eq!(m.metric, "thd");
        let v = m.value.unwrap();
        assert!((0.0..=100.0).contains(&v));
    }
}
