// src/lib.rs
//
// Discovery, transports and the EE31 command protocol for E+E sensor probes.

#[macro_use]
pub mod logging;

pub mod device_manager;
pub mod ee31;
pub mod io;
pub mod settings;

pub use device_manager::{DeviceManager, ScanObserver};
pub use ee31::{CommandExecutor, CommandResponse, ResultCode};
pub use io::{
    BleScanConfig, Channel, ChannelInfo, ChannelKey, EmulationScanConfig, InterfaceType, IoError,
    ScanConfiguration, SharedChannel, UartScanConfig,
};
pub use settings::{ProbeSettings, RetryPolicy};
