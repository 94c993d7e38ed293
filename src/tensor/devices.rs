//! Device placement tags

use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use crate::error::{TandemError, TandemResult};

/// Placement of a tensor.
///
/// Kernels execute on the host; the device is carried with every tensor so
/// that operands placed on different devices are rejected instead of being
/// silently mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl Device {
    /// Check if device is GPU-based
    pub const fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda(_) | Device::Metal(_))
    }

    /// Fail unless both devices are the same
    pub fn ensure_same(&self, other: &Device, operation: &str) -> TandemResult<()> {
        if self != other {
            return Err(TandemError::device_error(
                &self.to_string(),
                &format!("{} received an operand on {}", operation, other),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
            Device::Metal(id) => write!(f, "metal:{}", id),
        }
    }
}

impl FromStr for Device {
    type Err = TandemError;

    fn from_str(s: &str) -> TandemResult<Self> {
        let normalized = s.trim().to_lowercase();
        let (kind, index) = match normalized.split_once(':') {
            Some((kind, index)) => {
                let index = index
                    .parse::<usize>()
                    .map_err(|_| TandemError::device_error(s, "device index must be a non-negative integer"))?;
                (kind.to_string(), index)
            }
            None => (normalized.clone(), 0),
        };

        match kind.as_str() {
            "cpu" if !normalized.contains(':') => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(index)),
            "metal" | "mps" => Ok(Device::Metal(index)),
            _ => Err(TandemError::device_error(s, "expected cpu, cuda[:n] or metal[:n]")),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = TandemError;

    fn try_from(value: String) -> TandemResult<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_features() {
        assert!(Device::Cuda(0).is_gpu());
        assert!(!Device::Cpu.is_gpu());
        assert_eq!(Device::Cuda(0).to_string(), "cuda:0");
        assert_eq!(Device::default(), Device::Cpu);
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(" CUDA ".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("mps".parse::<Device>().unwrap(), Device::Metal(0));
        assert!("cpu:1".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_serde() {
        let json = serde_json::to_string(&Device::Cuda(1)).unwrap();
        assert_eq!(json, "\"cuda:1\"");
        let device: Device = serde_json::from_str("\"metal:0\"").unwrap();
        assert_eq!(device, Device::Metal(0));
    }

    #[test]
    fn test_ensure_same() {
        assert!(Device::Cpu.ensure_same(&Device::Cpu, "add").is_ok());
        let err = Device::Cpu.ensure_same(&Device::Cuda(0), "add").unwrap_err();
        assert!(matches!(err, TandemError::DeviceError(_)));
    }
}
