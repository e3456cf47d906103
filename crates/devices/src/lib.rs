pub mod api;
pub mod commands;
pub mod device;
pub mod registry;
pub mod service;

pub use commands::{Command, CommandQueue, CommandStatus, CommandTracker};
pub use device::{Device, DeviceStatus};
pub use registry::DeviceRegistry;
pub use service::DeviceManager;
