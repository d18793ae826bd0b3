// src/io/serial/mod.rs
//
// Serial (UART / RS-485) transport.
//
// - `utils`: line settings and their compact string form
// - `port`: host port enumeration, open ports, shared per-port handles
// - `channel`: the per-probe channel

mod channel;
mod port;
pub(crate) mod utils;

pub use channel::UartChannel;
pub use port::{
    is_uni_adapter, PortDescriptor, PortPool, PortProvider, PortSlot, SerialLink, SystemPorts,
};
pub use utils::{ComPortSettings, Handshake, Parity, StopBits};
