//! Bench hardware: component capabilities, state-change events and the
//! safety-checked `Device` built on top of them.

pub mod capabilities;
pub mod device;
pub mod events;

pub use capabilities::{
    OdReading, OdSensor, Pump, PumpRole, Stirrer, StirrerSpeed, TemperatureReading, Thermometer,
    Valves,
};
pub use device::{
    Device, DeviceComponents, DeviceConfig, EmergencyStopReport, PumpStatus, VialStatus,
};
pub use events::{ChannelListener, DeviceEvent, DeviceEventListener, DeviceEvents};
