// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TIS/FIFO command/response state machine at locality 0.
//!
//! The FIFO interface shares the TIS register layout, so one transport
//! serves both. Data moves through `DataFifo` in bursts whose size the
//! chip advertises in the unaligned 16-bit `BurstCount` field. The chip
//! is returned to Ready on every exit path via a drop guard.

use tracing::{error, warn};

use crate::constants::{TpmSt, TPM_RESPONSE_HEADER_SIZE};
use crate::error::TpmError;
use crate::mmio::{MmioMapper, Timer};
use crate::Result;

const TIS_STATUS: u64 = 0x18;
const TIS_BURST_COUNT: u64 = 0x19;
const TIS_DATA_FIFO: u64 = 0x24;

const STS_EXPECT: u8 = 0x08;
const STS_DATA: u8 = 0x10;
const STS_GO: u8 = 0x20;
const STS_READY: u8 = 0x40;
const STS_VALID: u8 = 0x80;
/// Lives in the upper byte of the 32-bit status view; writes of 0 to it
/// are ignored, so it is never cleared by software.
const STS_CANCEL: u32 = 0x0100_0000;

const POLL_INTERVAL_US: u32 = 30;

const TIS_TIMEOUT_B: u32 = 2_000_000;
const TIS_TIMEOUT_C: u32 = 750_000;
const TIS_TIMEOUT_D: u32 = 750_000;
const TIS_TIMEOUT_MAX: u32 = 90_000_000;

pub struct TisTransport<'a> {
    mmio: &'a dyn MmioMapper,
    timer: &'a dyn Timer,
    base: u64,
}

/// Writes `STS_READY` when dropped, releasing the chip on every exit
/// path out of [`TisTransport::submit`].
struct ReadyGuard<'a> {
    mmio: &'a dyn MmioMapper,
    status: u64,
}

impl Drop for ReadyGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mmio.write8(self.status, STS_READY);
    }
}

impl<'a> TisTransport<'a> {
    pub fn new(mmio: &'a dyn MmioMapper, timer: &'a dyn Timer, base: u64) -> Self {
        Self { mmio, timer, base }
    }

    /// Submit one command and drain its response into `resp`, returning
    /// the response length the chip declared.
    pub fn submit(&self, cmd: &[u8], resp: &mut [u8]) -> Result<usize> {
        if cmd.is_empty() {
            return Err(TpmError::InvalidParameter);
        }
        if resp.len() < TPM_RESPONSE_HEADER_SIZE {
            return Err(TpmError::BufferTooSmall);
        }

        let _release = ReadyGuard {
            mmio: self.mmio,
            status: self.base + TIS_STATUS,
        };
        self.run(cmd, resp)
    }

    fn run(&self, cmd: &[u8], resp: &mut [u8]) -> Result<usize> {
        let status = self.base + TIS_STATUS;
        let fifo = self.base + TIS_DATA_FIFO;

        // Prepare: request Ready and wait for it to read back.
        self.mmio.write8(status, STS_READY)?;
        match self.wait_register_bits(status, STS_READY, 0, TIS_TIMEOUT_B) {
            Ok(()) => {}
            Err(TpmError::Timeout) => {
                error!("chip is not ready for a command");
                return Err(TpmError::DeviceBusy);
            }
            Err(e) => return Err(e),
        }

        // Feed the command through the FIFO at the advertised pace.
        let mut written = 0;
        while written < cmd.len() {
            let burst = match self.read_burst_count() {
                Ok(b) => b as usize,
                Err(TpmError::Timeout) => return Err(TpmError::DeviceBusy),
                Err(e) => return Err(e),
            };
            let chunk = burst.min(cmd.len() - written);
            for &byte in &cmd[written..written + chunk] {
                self.mmio.write8(fifo, byte)?;
            }
            written += chunk;
        }

        // The chip acknowledges a complete frame by dropping Expect.
        match self.wait_register_bits(status, STS_VALID, STS_EXPECT, TIS_TIMEOUT_C) {
            Ok(()) => {}
            Err(TpmError::Timeout) => {
                error!("chip still expects data after the full command");
                return Err(TpmError::BufferTooSmall);
            }
            Err(e) => return Err(e),
        }

        // Execute. This can take minutes for key generation.
        self.mmio.write8(status, STS_GO)?;
        match self.wait_register_bits(status, STS_VALID | STS_DATA, 0, TIS_TIMEOUT_MAX) {
            Ok(()) => {}
            Err(TpmError::Timeout) => {
                warn!("timed out waiting for the response, cancelling");
                self.mmio.write32(status, STS_CANCEL)?;
                match self.wait_register_bits(status, STS_VALID | STS_DATA, 0, TIS_TIMEOUT_B) {
                    Ok(()) => {}
                    Err(TpmError::Timeout) => return Err(TpmError::DeviceBusy),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        // Drain and validate the response header before trusting its
        // declared size.
        let mut filled = 0;
        let mut burst = 0usize;
        while filled < TPM_RESPONSE_HEADER_SIZE {
            burst = match self.read_burst_count() {
                Ok(b) => b as usize,
                Err(TpmError::Timeout) => return Err(TpmError::DeviceBusy),
                Err(e) => return Err(e),
            };
            while burst > 0 && filled < TPM_RESPONSE_HEADER_SIZE {
                resp[filled] = self.mmio.read8(fifo)?;
                filled += 1;
                burst -= 1;
            }
        }

        let tag = u16::from_be_bytes([resp[0], resp[1]]);
        if tag == TpmSt::RspCommand.to_u16() {
            error!("chip answered with the TPM 1.2 response tag");
            return Err(TpmError::Unsupported);
        }

        let out_size = u32::from_be_bytes([resp[2], resp[3], resp[4], resp[5]]) as usize;
        if resp.len() < out_size {
            return Err(TpmError::BufferTooSmall);
        }

        // Remaining bytes, reusing whatever is left of the last burst.
        while filled < out_size {
            while burst > 0 && filled < out_size {
                resp[filled] = self.mmio.read8(fifo)?;
                filled += 1;
                burst -= 1;
            }
            if filled == out_size {
                break;
            }
            burst = match self.read_burst_count() {
                Ok(b) => b as usize,
                Err(TpmError::Timeout) => return Err(TpmError::DeviceBusy),
                Err(e) => return Err(e),
            };
        }
        Ok(out_size)
    }

    /// The burst count is 16 bits wide but not 2-byte aligned, so it is
    /// assembled from two 1-byte reads. Zero for the whole window means
    /// the chip stalled.
    fn read_burst_count(&self) -> Result<u16> {
        let mut waited = 0;
        loop {
            let lo = self.mmio.read8(self.base + TIS_BURST_COUNT)?;
            let hi = self.mmio.read8(self.base + TIS_BURST_COUNT + 1)?;
            let burst = u16::from_le_bytes([lo, hi]);
            if burst != 0 {
                return Ok(burst);
            }
            self.timer.stall_us(POLL_INTERVAL_US);
            waited += POLL_INTERVAL_US;
            if waited >= TIS_TIMEOUT_D {
                return Err(TpmError::Timeout);
            }
        }
    }

    /// Poll the 8-bit status register until `(value & set) == set` and
    /// `(value & clear) == 0`, in 30 µs steps.
    fn wait_register_bits(&self, reg: u64, set: u8, clear: u8, timeout_us: u32) -> Result<()> {
        let mut waited = 0;
        while waited < timeout_us {
            let value = self.mmio.read8(reg)?;
            if value & set == set && value & clear == 0 {
                return Ok(());
            }
            self.timer.stall_us(POLL_INTERVAL_US);
            waited += POLL_INTERVAL_US;
        }
        Err(TpmError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{NullTimer, TisMock};

    const BASE: u64 = 0xFED4_0000;

    fn reply(len: usize) -> Vec<u8> {
        let mut resp = vec![0u8; len];
        resp[..2].copy_from_slice(&0x8001u16.to_be_bytes());
        resp[2..6].copy_from_slice(&(len as u32).to_be_bytes());
        resp
    }

    #[test]
    fn happy_path_streams_both_directions() {
        let mock = TisMock::new(BASE);
        mock.set_burst(8);
        mock.set_response(reply(32));

        let tis = TisTransport::new(&mock, &NullTimer, BASE);
        let mut out = [0u8; 64];
        let cmd = [0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x01, 0x73];
        let n = tis.submit(&cmd, &mut out).unwrap();

        assert_eq!(n, 32);
        assert_eq!(&out[..n], reply(32).as_slice());
        assert_eq!(mock.command_bytes(), cmd);
        assert!(mock.ready_written_last());
    }

    #[test]
    fn no_response_data_reports_busy_after_cancel() {
        let mock = TisMock::new(BASE);
        mock.set_burst(8);
        mock.set_produce_data(false);

        let tis = TisTransport::new(&mock, &NullTimer, BASE);
        let mut out = [0u8; 64];
        assert_eq!(tis.submit(&[0u8; 10], &mut out), Err(TpmError::DeviceBusy));

        // The cancel request goes through the 32-bit status view and the
        // chip is still released on the way out.
        assert!(mock.cancel_written());
        assert!(mock.ready_written_last());
    }

    #[test]
    fn unacknowledged_frame_reports_buffer_too_small() {
        let mock = TisMock::new(BASE);
        mock.set_burst(8);
        mock.set_expect_clears(false);

        let tis = TisTransport::new(&mock, &NullTimer, BASE);
        let mut out = [0u8; 64];
        assert_eq!(
            tis.submit(&[0u8; 10], &mut out),
            Err(TpmError::BufferTooSmall)
        );
        assert!(mock.ready_written_last());
    }

    #[test]
    fn stalled_burst_count_reports_busy() {
        let mock = TisMock::new(BASE);
        mock.set_burst(0);

        let tis = TisTransport::new(&mock, &NullTimer, BASE);
        let mut out = [0u8; 64];
        assert_eq!(tis.submit(&[0u8; 10], &mut out), Err(TpmError::DeviceBusy));
        assert!(mock.ready_written_last());
    }

    #[test]
    fn oversized_response_reports_buffer_too_small() {
        let mock = TisMock::new(BASE);
        mock.set_burst(8);
        mock.set_response(reply(512));

        let tis = TisTransport::new(&mock, &NullTimer, BASE);
        let mut out = [0u8; 64];
        assert_eq!(
            tis.submit(&[0u8; 10], &mut out),
            Err(TpmError::BufferTooSmall)
        );
        assert!(mock.ready_written_last());
    }

    #[test]
    fn response_paced_by_small_bursts() {
        let mock = TisMock::new(BASE);
        mock.set_burst(3);
        mock.set_response(reply(25));

        let tis = TisTransport::new(&mock, &NullTimer, BASE);
        let mut out = [0u8; 64];
        let n = tis.submit(&[0u8; 10], &mut out).unwrap();
        assert_eq!(n, 25);
        assert_eq!(&out[..n], reply(25).as_slice());
    }
}
