// src/ee31/executor.rs
//
// Command execution over a channel: encode, frame, write, then poll the
// channel until a matching response frame arrives or the timeout elapses.

use std::time::Duration;
use tokio::time::Instant;

use super::commands::{CommandParameter, CommandResult, ResultCode};
use super::frame::{constants::BROADCAST, Frame, FrameParser};
use crate::io::SharedChannel;

/// Default receive timeout of one command
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause between channel polls while waiting for a response
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

const READ_CHUNK: usize = 256;

/// Outcome of one executed command. `result` holds default values unless
/// `code` is `Success`.
#[derive(Clone, Debug, Default)]
pub struct CommandResponse<R> {
    pub code: ResultCode,
    /// Bus address the response came from
    pub address: u8,
    /// Raw response payload
    pub raw: Vec<u8>,
    pub result: R,
}

impl<R: Default> CommandResponse<R> {
    fn failed(code: ResultCode) -> Self {
        Self {
            code,
            address: 0,
            raw: Vec::new(),
            result: R::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Runs commands against one channel
pub struct CommandExecutor {
    channel: SharedChannel,
    timeout: Duration,
    poll_interval: Duration,
}

impl CommandExecutor {
    pub fn new(channel: SharedChannel) -> Self {
        Self {
            channel,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute addressed to the channel's own bus address
    pub async fn execute<P: CommandParameter>(&self, parameter: &P) -> CommandResponse<P::Result> {
        self.execute_to(self.channel.bus_address(), parameter).await
    }

    /// Execute addressed to `address` (0 = broadcast)
    pub async fn execute_to<P: CommandParameter>(
        &self,
        address: u8,
        parameter: &P,
    ) -> CommandResponse<P::Result> {
        let id = self.channel.interface_id();
        let opcode = parameter.opcode();

        if let Err(e) = self.channel.ensure_connection().await {
            tlog!("[ee31] {}: {} not sent, channel not connected: {}", id, opcode, e);
            return CommandResponse::failed(ResultCode::NotConnected);
        }

        // Leftovers from an earlier exchange would be mistaken for the answer.
        // A line that never goes quiet gets one timeout's worth of draining.
        let mut chunk = [0u8; READ_CHUNK];
        let drain_deadline = Instant::now() + self.timeout;
        let mut discarded = 0usize;
        loop {
            if Instant::now() >= drain_deadline {
                tlog!("[ee31] {}: line still busy after discarding {} bytes", id, discarded);
                return CommandResponse::failed(ResultCode::Timeout);
            }
            match self.channel.read_bytes(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    discarded += n;
                    tlog!("[ee31] {}: discarded {} stale bytes", id, n);
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    tlog!("[ee31] {}: read failed before {}: {}", id, opcode, e);
                    return CommandResponse::failed(ResultCode::TransportError);
                }
            }
        }

        let request = Frame::new(address, opcode, parameter.to_payload());
        let bytes = match request.encode() {
            Ok(b) => b,
            Err(e) => {
                tlog!("[ee31] {}: cannot encode {}: {}", id, opcode, e);
                return CommandResponse::failed(ResultCode::InvalidResult);
            }
        };

        tlog!("[ee31] {} -> {}", id, hex::encode_upper(&bytes));
        if let Err(e) = self.channel.write_bytes(&bytes).await {
            tlog!("[ee31] {}: write of {} failed: {}", id, opcode, e);
            return CommandResponse::failed(ResultCode::TransportError);
        }

        let deadline = Instant::now() + self.timeout;
        let mut parser = FrameParser::new();

        loop {
            if Instant::now() >= deadline {
                return CommandResponse::failed(ResultCode::Timeout);
            }
            let n = match self.channel.read_bytes(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    tlog!("[ee31] {}: read of {} response failed: {}", id, opcode, e);
                    return CommandResponse::failed(ResultCode::TransportError);
                }
            };

            if n > 0 {
                tlog!("[ee31] {} <- {}", id, hex::encode_upper(&chunk[..n]));
                for frame in parser.feed(&chunk[..n]) {
                    if let Some(response) = Self::match_response(address, parameter, frame) {
                        return response;
                    }
                }
                // keep reading while bytes flow, the loop head enforces the deadline
                tokio::task::yield_now().await;
                continue;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Interpret `frame` if it answers the outstanding request
    fn match_response<P: CommandParameter>(
        address: u8,
        parameter: &P,
        frame: Frame,
    ) -> Option<CommandResponse<P::Result>> {
        if frame.base_opcode() != parameter.opcode().code() {
            return None;
        }
        if address != BROADCAST && frame.address != address {
            return None;
        }

        if frame.is_nak() {
            let reason = frame.payload.first().copied().unwrap_or(0);
            return Some(CommandResponse {
                code: ResultCode::Rejected(reason),
                address: frame.address,
                raw: frame.payload,
                result: P::Result::default(),
            });
        }

        if !parameter.matches_response(&frame.payload) {
            return None;
        }

        let (code, result) = P::Result::interpret(&frame.payload);
        Some(CommandResponse {
            code,
            address: frame.address,
            raw: frame.payload,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ee31::commands::{
        DiscoveryParameter, OutputGetParameter, OutputIndex, ProbeIdentityGetParameter,
    };
    use crate::ee31::frame::Opcode;
    use crate::io::emulation::{EmulatedDeviceSettings, EmulationChannel};
    use crate::io::{BleScanConfig, Channel, InterfaceType, IoError, ScanConfiguration};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Line that never goes quiet: every read yields one 0xAA byte. With
    /// `quiet_until_write` set it only starts after the first write.
    struct NoisyLine {
        quiet_until_write: bool,
        written: AtomicBool,
    }

    impl NoisyLine {
        fn new(quiet_until_write: bool) -> SharedChannel {
            Arc::new(Self {
                quiet_until_write,
                written: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Channel for NoisyLine {
        fn interface_type(&self) -> InterfaceType {
            InterfaceType::Ble
        }
        fn interface_id(&self) -> String {
            "noisy".to_string()
        }
        fn model(&self) -> String {
            String::new()
        }
        fn set_model(&self, _model: &str) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn bytes_to_read(&self) -> usize {
            1
        }
        fn scan_configuration(&self) -> ScanConfiguration {
            ScanConfiguration::Ble(BleScanConfig::default())
        }
        fn used_configurations(&self) -> Vec<ScanConfiguration> {
            vec![self.scan_configuration()]
        }
        async fn set_scan_configuration(&self, _config: ScanConfiguration) -> Result<(), IoError> {
            Ok(())
        }
        async fn ensure_connection(&self) -> Result<(), IoError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), IoError> {
            Ok(())
        }
        async fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, IoError> {
            if self.quiet_until_write && !self.written.load(Ordering::SeqCst) {
                return Ok(0);
            }
            buf[0] = 0xAA;
            Ok(1)
        }
        async fn write_bytes(&self, _data: &[u8]) -> Result<(), IoError> {
            self.written.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn channel(address: u8) -> SharedChannel {
        let settings = EmulatedDeviceSettings::new(address, "EE210");
        Arc::new(EmulationChannel::new(settings))
    }

    #[tokio::test]
    async fn test_identity_round_trip_over_emulation() {
        let exec = CommandExecutor::new(channel(12));
        let resp = exec.execute(&ProbeIdentityGetParameter).await;
        assert_eq!(resp.code, ResultCode::Success);
        assert_eq!(resp.address, 12);
        assert_eq!(resp.result.identity.bus_address, 12);
        assert_eq!(resp.raw.len(), 24);
    }

    #[tokio::test]
    async fn test_wrong_address_times_out() {
        let exec = CommandExecutor::new(channel(12)).with_timeout(Duration::from_millis(30));
        let resp = exec.execute_to(13, &ProbeIdentityGetParameter).await;
        assert_eq!(resp.code, ResultCode::Timeout);
        assert!(resp.raw.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_surfaces_reason() {
        let exec = CommandExecutor::new(channel(3));
        // only outputs 1 and 2 exist
        struct BadOutput;
        impl CommandParameter for BadOutput {
            type Result = crate::ee31::commands::OutputResult;
            fn opcode(&self) -> Opcode {
                Opcode::OutputGet
            }
            fn encode(&self, out: &mut Vec<u8>) {
                out.push(9);
            }
        }
        let resp = exec.execute(&BadOutput).await;
        assert!(matches!(resp.code, ResultCode::Rejected(_)));

        let resp = exec.execute(&OutputGetParameter { output: OutputIndex::Two }).await;
        assert_eq!(resp.code, ResultCode::Success);
        assert_eq!(resp.result.range.output, OutputIndex::Two);
    }

    #[tokio::test]
    async fn test_broadcast_discovery_accepts_any_address() {
        let exec = CommandExecutor::new(channel(42));
        let resp = exec.execute_to(BROADCAST, &DiscoveryParameter::broadcast(0x5555)).await;
        assert_eq!(resp.code, ResultCode::Success);
        assert_eq!(resp.address, 42);
        assert_eq!(resp.result.session_id, 0x5555);
        assert_eq!(resp.result.devices.len(), 1);
        assert_eq!(resp.result.devices[0].model, "EE210");
    }

    #[tokio::test]
    async fn test_garbage_after_request_still_times_out() {
        let timeout = Duration::from_millis(50);
        let exec = CommandExecutor::new(NoisyLine::new(true)).with_timeout(timeout);
        let started = std::time::Instant::now();
        let resp = exec.execute(&ProbeIdentityGetParameter).await;
        assert_eq!(resp.code, ResultCode::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_line_that_never_drains_times_out() {
        let timeout = Duration::from_millis(50);
        let exec = CommandExecutor::new(NoisyLine::new(false)).with_timeout(timeout);
        let started = std::time::Instant::now();
        let resp = exec.execute(&ProbeIdentityGetParameter).await;
        assert_eq!(resp.code, ResultCode::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
