//! Seeding and reproducibility capability reporting.
//!
//! The controller is constructed already seeded, so the seed is applied
//! exactly once and before any random stream can be drawn. Random streams are
//! derived from `(seed, stream, step)` rather than carried as mutable state:
//! a run resumed at step `k + 1` draws the same numbers an uninterrupted run
//! would.

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendClass {
    Cpu,
    Accelerated,
}

impl BackendClass {
    /// Absolute tolerance for a tracked scalar when bit-exactness is not guaranteed.
    pub fn tolerance(self) -> f64 {
        match self {
            Self::Cpu => 1e-6,
            Self::Accelerated => 1e-4,
        }
    }
}

/// The numeric backend a run executes on. Provided by the integrating
/// training stack.
pub trait NumericBackend: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> String;

    fn class(&self) -> BackendClass;

    /// Whether repeated runs with identical inputs produce bit-identical outputs.
    fn supports_strict(&self) -> bool;
}

/// Plain `f64` arithmetic on the host CPU, evaluated in program order.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl NumericBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu-f64"
    }

    fn version(&self) -> String {
        env!("DIFFUSION_CORE_RUSTC_VERSION").to_string()
    }

    fn class(&self) -> BackendClass {
        BackendClass::Cpu
    }

    fn supports_strict(&self) -> bool {
        true
    }
}

/// Serializable snapshot of a backend, recorded in provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub version: String,
    pub class: BackendClass,
    pub strict: bool,
}

impl BackendInfo {
    pub fn of(backend: &dyn NumericBackend) -> Self {
        Self {
            name: backend.name().to_string(),
            version: backend.version(),
            class: backend.class(),
            strict: backend.supports_strict(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    Exact,
    Absolute(f64),
}

impl Tolerance {
    pub fn matches(self, a: f64, b: f64) -> bool {
        match self {
            Self::Exact => a.to_bits() == b.to_bits(),
            Self::Absolute(tol) => (a - b).abs() <= tol,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeterminismController {
    seed: u64,
    backend: BackendInfo,
    strict_requested: bool,
}

impl DeterminismController {
    pub fn seeded(seed: u64, backend: &dyn NumericBackend, strict_requested: bool) -> Self {
        let backend = BackendInfo::of(backend);
        if strict_requested && !backend.strict {
            warn!(
                backend = %backend.name,
                "strict determinism requested but not supported; falling back to tolerance {}",
                backend.class.tolerance()
            );
        }
        info!(seed, backend = %backend.name, strict = backend.strict, "seeded run");
        Self { seed, backend, strict_requested }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn backend(&self) -> &BackendInfo {
        &self.backend
    }

    pub fn strict_requested(&self) -> bool {
        self.strict_requested
    }

    /// Whether the active backend guarantees bit-exact reproducibility.
    pub fn is_strict(&self) -> bool {
        self.backend.strict
    }

    /// Reason a caller must skip exact-equality assertions, if any.
    pub fn strict_unsupported_reason(&self) -> Option<String> {
        (!self.is_strict()).then(|| {
            format!(
                "backend `{}` ({:?}) does not guarantee bit-exact reproducibility; compare within {}",
                self.backend.name,
                self.backend.class,
                self.backend.class.tolerance()
            )
        })
    }

    pub fn tolerance(&self) -> Tolerance {
        if self.is_strict() { Tolerance::Exact } else { Tolerance::Absolute(self.backend.class.tolerance()) }
    }

    /// Independent random stream for `stream` at `step`.
    pub fn rng_for(&self, stream: &str, step: u64) -> StdRng {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(stream.as_bytes());
        hasher.update([0u8]);
        hasher.update(step.to_le_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hasher.finalize());
        StdRng::from_seed(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    struct FakeAccelerator;

    impl NumericBackend for FakeAccelerator {
        fn name(&self) -> &str {
            "fake-gpu"
        }

        fn version(&self) -> String {
            "0.0.1".to_string()
        }

        fn class(&self) -> BackendClass {
            BackendClass::Accelerated
        }

        fn supports_strict(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_cpu_backend_is_strict() {
        let ctl = DeterminismController::seeded(7, &CpuBackend, true);
        assert!(ctl.is_strict());
        assert_eq!(ctl.tolerance(), Tolerance::Exact);
        assert!(ctl.strict_unsupported_reason().is_none());
    }

    #[test]
    fn test_accelerated_backend_reports_reason_and_tolerance() {
        let ctl = DeterminismController::seeded(7, &FakeAccelerator, true);
        assert!(!ctl.is_strict());
        assert_eq!(ctl.tolerance(), Tolerance::Absolute(1e-4));
        let reason = ctl.strict_unsupported_reason().unwrap();
        assert!(reason.contains("fake-gpu"));
    }

    #[test]
    fn test_streams_are_reproducible_and_distinct() {
        let a = DeterminismController::seeded(42, &CpuBackend, false);
        let b = DeterminismController::seeded(42, &CpuBackend, false);
        let x: f64 = a.rng_for("noise", 3).gen_range(0.0..1.0);
        let y: f64 = b.rng_for("noise", 3).gen_range(0.0..1.0);
        let z: f64 = a.rng_for("noise", 4).gen_range(0.0..1.0);
        assert_eq!(x.to_bits(), y.to_bits());
        assert_ne!(x.to_bits(), z.to_bits());
    }

    #[test]
    fn test_tolerance_matches() {
        assert!(Tolerance::Absolute(1e-6).matches(1.0, 1.0 + 5e-7));
        assert!(!Tolerance::Absolute(1e-6).matches(1.0, 1.0 + 5e-6));
        assert!(!Tolerance::Exact.matches(1.0, 1.0 + f64::EPSILON));
    }
}
