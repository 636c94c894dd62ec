use grass_wind::{Device, DeviceConfig, FluidError};

/// A device to test on, or `None` when the machine has no adapter.
pub fn device(config: DeviceConfig) -> Option<Device> {
    match Device::new(config) {
        Ok(device) => Some(device),
        Err(FluidError::DeviceQuery(e)) => {
            eprintln!("skipping, no device: {}", e);
            None
        }
        Err(e) => panic!("{}", e),
    }
}
