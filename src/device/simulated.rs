use super::{DeviceError, DeviceKind, IrDevice};
use async_trait::async_trait;
use tracing::debug;

/// Stand-in selected with `device_type = "test"`.
///
/// Needs no network and reports a constant temperature, which is enough to
/// exercise the broker side of the bridge without hardware.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    temperature: f32,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self { temperature: 23.5 }
    }
}

#[async_trait]
impl IrDevice for SimulatedDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Test
    }

    fn host(&self) -> String {
        "test".to_string()
    }

    async fn authenticate(&mut self) -> Result<(), DeviceError> {
        debug!("Simulated device needs no authentication");
        Ok(())
    }

    async fn read_temperature(&mut self) -> Result<f32, DeviceError> {
        Ok(self.temperature)
    }
}
