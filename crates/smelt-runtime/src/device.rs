//! Device targets, numeric precision, and the fixed quantization scheme.

use serde::{Deserialize, Serialize};

/// Where a model's weights are placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Device {
    Cpu,
    /// An accelerator device, named the way the runtime names it
    /// (e.g. "cuda", "cuda:1", "mps").
    Accelerator {
        name: String,
    },
}

impl Device {
    /// Parses a configured device string; "cpu" (or empty) maps to CPU.
    #[must_use]
    pub fn from_config(name: &str) -> Self {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("cpu") {
            Self::Cpu
        } else {
            Self::Accelerator { name: name.to_string() }
        }
    }

    #[must_use]
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Self::Accelerator { .. })
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator { name } => write!(f, "{name}"),
        }
    }
}

/// Numeric precision for loaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// 16-bit float, used on accelerators.
    Half,
    /// bfloat16, used on CPU where half floats are slow or unsupported.
    BFloat16,
}

/// Quantization scheme identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantScheme {
    Nf4,
}

/// Reduced-precision weight representation applied at load time.
///
/// There is exactly one supported configuration: 4-bit NF4 with double
/// quantization and half-precision compute. Runs must be reproducible, so
/// this is fixed rather than configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantization {
    pub bits: u8,
    pub scheme: QuantScheme,
    pub double_quant: bool,
    pub compute: Precision,
}

impl Quantization {
    /// The fixed 4-bit load configuration.
    #[must_use]
    pub fn four_bit() -> Self {
        Self { bits: 4, scheme: QuantScheme::Nf4, double_quant: true, compute: Precision::Half }
    }
}

/// The caller's device policy, derived from configuration plus a probe of
/// the host.
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    /// The configured device target.
    pub preferred: Device,
    /// Whether an accelerator is actually present.
    pub accelerator_available: bool,
    /// Whether quantized loads are enabled at all (adapter-training policy).
    pub quantization_enabled: bool,
}

impl DevicePolicy {
    /// True when the policy resolves to running on an accelerator.
    #[must_use]
    pub fn accelerated(&self) -> bool {
        self.accelerator_available && self.preferred.is_accelerator()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_config() {
        assert_eq!(Device::from_config("cpu"), Device::Cpu);
        assert_eq!(Device::from_config(""), Device::Cpu);
        assert_eq!(Device::from_config("CUDA"), Device::Accelerator { name: "CUDA".to_string() });
        assert!(Device::from_config("cuda:1").is_accelerator());
    }

    #[test]
    fn test_four_bit_is_fixed() {
        let q = Quantization::four_bit();
        assert_eq!(q.bits, 4);
        assert_eq!(q.scheme, QuantScheme::Nf4);
        assert!(q.double_quant);
        assert_eq!(q.compute, Precision::Half);
    }

    #[test]
    fn test_policy_accelerated_requires_probe_and_preference() {
        let policy = DevicePolicy {
            preferred: Device::from_config("cuda"),
            accelerator_available: false,
            quantization_enabled: true,
        };
        assert!(!policy.accelerated());

        let policy = DevicePolicy { accelerator_available: true, ..policy };
        assert!(policy.accelerated());

        let policy = DevicePolicy { preferred: Device::Cpu, ..policy };
        assert!(!policy.accelerated());
    }
}
