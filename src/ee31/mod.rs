// src/ee31/mod.rs
//
// EE31 probe protocol: wire framing, payload conversion, the command catalog
// and the executor that runs commands over a channel.

pub mod commands;
pub mod convert;
mod executor;
pub mod frame;

pub use commands::{CommandParameter, CommandResult, ResultCode, StatusResult};
pub use convert::{BinaryConverter, ByteOrder};
pub use executor::{CommandExecutor, CommandResponse, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
pub use frame::{Frame, FrameParser, Opcode};
