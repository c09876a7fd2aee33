// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! CRB command/response state machine at locality 0.
//!
//! The Command Response Buffer protocol stages the whole command in the
//! shared data buffer, kicks execution through `CtrlStart`, and drains
//! the response from the same window. The chip is returned to Idle on
//! every exit path via a drop guard.

use tracing::{debug, error, warn};

use crate::constants::{TpmSt, TPM_RESPONSE_HEADER_SIZE};
use crate::error::TpmError;
use crate::mmio::{MmioMapper, Timer};
use crate::Result;

const CRB_CTRL_STATUS: u64 = 0x10;
const CRB_CTRL_REQUEST: u64 = 0x14;
const CRB_CTRL_CANCEL: u64 = 0x18;
const CRB_CTRL_START: u64 = 0x1C;
const CRB_COMMAND_SIZE: u64 = 0x38;
const CRB_COMMAND_ADDR_LOW: u64 = 0x3C;
const CRB_COMMAND_ADDR_HIGH: u64 = 0x40;
const CRB_RESPONSE_SIZE: u64 = 0x44;
const CRB_RESPONSE_ADDR: u64 = 0x48;
const CRB_DATA_BUFFER: u64 = 0x80;

/// Shared data buffer capacity: one 4 KiB window minus the registers.
pub const CRB_DATA_BUFFER_SIZE: usize = 3968;

const REQUEST_COMMAND_READY: u32 = 1 << 0;
const REQUEST_GO_IDLE: u32 = 1 << 1;
const STATUS_TPM_IDLE: u32 = 1 << 1;
const START_INVOKE: u32 = 1 << 0;
const CANCEL_INVOKE: u32 = 1 << 0;

const POLL_INTERVAL_US: u32 = 30;

const PTP_TIMEOUT_B: u32 = 2_000_000;
const PTP_TIMEOUT_C: u32 = 200_000;
const PTP_TIMEOUT_MAX: u32 = 90_000_000;

/// Idle/Ready handshake attempts, per the TCG PC Client device driver
/// design principles.
const RETRY_CNT_MAX: u32 = 3;

pub struct CrbTransport<'a> {
    mmio: &'a dyn MmioMapper,
    timer: &'a dyn Timer,
    base: u64,
    idle_bypass: u8,
}

/// Writes `goIdle` when dropped, so the chip is released on every exit
/// path out of [`CrbTransport::submit`].
struct GoIdleGuard<'a> {
    mmio: &'a dyn MmioMapper,
    request: u64,
}

impl Drop for GoIdleGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mmio.write32(self.request, REQUEST_GO_IDLE);
    }
}

impl<'a> CrbTransport<'a> {
    pub fn new(mmio: &'a dyn MmioMapper, timer: &'a dyn Timer, base: u64, idle_bypass: u8) -> Self {
        Self {
            mmio,
            timer,
            base,
            idle_bypass,
        }
    }

    /// Submit one command and drain its response into `resp`, returning
    /// the response length the chip declared.
    pub fn submit(&self, cmd: &[u8], resp: &mut [u8]) -> Result<usize> {
        if cmd.is_empty() || cmd.len() > CRB_DATA_BUFFER_SIZE {
            return Err(TpmError::InvalidParameter);
        }
        if resp.len() < TPM_RESPONSE_HEADER_SIZE {
            return Err(TpmError::BufferTooSmall);
        }

        let _release = GoIdleGuard {
            mmio: self.mmio,
            request: self.base + CRB_CTRL_REQUEST,
        };
        self.run(cmd, resp)
    }

    fn run(&self, cmd: &[u8], resp: &mut [u8]) -> Result<usize> {
        self.enter_ready()?;

        // Stage the command and point both directions at the shared
        // data buffer.
        let buffer = self.base + CRB_DATA_BUFFER;
        for (i, byte) in cmd.iter().enumerate() {
            self.mmio.write8(buffer + i as u64, *byte)?;
        }
        self.mmio
            .write32(self.base + CRB_COMMAND_ADDR_HIGH, (buffer >> 32) as u32)?;
        self.mmio
            .write32(self.base + CRB_COMMAND_ADDR_LOW, buffer as u32)?;
        self.mmio
            .write32(self.base + CRB_COMMAND_SIZE, CRB_DATA_BUFFER_SIZE as u32)?;
        self.mmio.write64(self.base + CRB_RESPONSE_ADDR, buffer)?;
        self.mmio
            .write32(self.base + CRB_RESPONSE_SIZE, CRB_DATA_BUFFER_SIZE as u32)?;

        // Execution completes when the chip clears Start. Key
        // generation can hold it set for a long time.
        self.mmio.write32(self.base + CRB_CTRL_START, START_INVOKE)?;
        match self.wait_register_bits(self.base + CRB_CTRL_START, 0, START_INVOKE, PTP_TIMEOUT_MAX)
        {
            Ok(()) => {}
            Err(TpmError::Timeout) => {
                warn!("command execution timed out, cancelling");
                self.mmio.write32(self.base + CRB_CTRL_CANCEL, CANCEL_INVOKE)?;
                let cancelled = self.wait_register_bits(
                    self.base + CRB_CTRL_START,
                    0,
                    START_INVOKE,
                    PTP_TIMEOUT_B,
                );
                self.mmio.write32(self.base + CRB_CTRL_CANCEL, 0)?;
                match cancelled {
                    Ok(()) => {}
                    Err(TpmError::Timeout) => return Err(TpmError::DeviceBusy),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        // Drain and validate the response header before trusting its
        // declared size.
        let mut header = [0u8; TPM_RESPONSE_HEADER_SIZE];
        for (i, byte) in header.iter_mut().enumerate() {
            *byte = self.mmio.read8(buffer + i as u64)?;
        }

        let tag = u16::from_be_bytes([header[0], header[1]]);
        if tag == TpmSt::RspCommand.to_u16() {
            error!("chip answered with the TPM 1.2 response tag");
            return Err(TpmError::Unsupported);
        }

        let out_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if out_size > CRB_DATA_BUFFER_SIZE {
            error!(out_size, "declared response exceeds the data buffer");
            return Err(TpmError::DeviceBusy);
        }
        if resp.len() < out_size {
            debug!(
                out_size,
                capacity = resp.len(),
                "response does not fit the caller's buffer"
            );
            return Err(TpmError::BufferTooSmall);
        }

        resp[..TPM_RESPONSE_HEADER_SIZE].copy_from_slice(&header);
        for i in TPM_RESPONSE_HEADER_SIZE..out_size {
            resp[i] = self.mmio.read8(buffer + i as u64)?;
        }
        Ok(out_size)
    }

    /// Drive the chip into Ready, forcing Idle between attempts. Bounded
    /// by `RETRY_CNT_MAX`; exhaustion surfaces as `DeviceBusy`.
    fn enter_ready(&self) -> Result<()> {
        for attempt in 0..RETRY_CNT_MAX {
            match self.try_enter_ready() {
                Ok(()) => return Ok(()),
                Err(TpmError::Timeout) => {
                    debug!(attempt, "ready handshake timed out, forcing idle");
                    self.mmio
                        .write32(self.base + CRB_CTRL_REQUEST, REQUEST_GO_IDLE)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(TpmError::DeviceBusy)
    }

    fn try_enter_ready(&self) -> Result<()> {
        // Enforce Idle first unless the interface advertises bypass.
        if self.idle_bypass == 0 {
            let status = self.mmio.read32(self.base + CRB_CTRL_STATUS)?;
            if status & STATUS_TPM_IDLE == 0 {
                self.wait_register_bits(
                    self.base + CRB_CTRL_STATUS,
                    STATUS_TPM_IDLE,
                    0,
                    PTP_TIMEOUT_C,
                )?;
            }
        }

        // Ready is reached once the chip clears cmdReady and leaves
        // Idle.
        self.mmio
            .write32(self.base + CRB_CTRL_REQUEST, REQUEST_COMMAND_READY)?;
        self.wait_register_bits(
            self.base + CRB_CTRL_REQUEST,
            0,
            REQUEST_COMMAND_READY,
            PTP_TIMEOUT_C,
        )?;
        self.wait_register_bits(self.base + CRB_CTRL_STATUS, 0, STATUS_TPM_IDLE, PTP_TIMEOUT_C)
    }

    /// Poll a 32-bit register until `(value & set) == set` and
    /// `(value & clear) == 0`, in 30 µs steps.
    fn wait_register_bits(&self, reg: u64, set: u32, clear: u32, timeout_us: u32) -> Result<()> {
        let mut waited = 0;
        while waited < timeout_us {
            let value = self.mmio.read32(reg)?;
            if value & set == set && value & clear == 0 {
                return Ok(());
            }
            self.timer.stall_us(POLL_INTERVAL_US);
            waited += POLL_INTERVAL_US;
        }
        Err(TpmError::Timeout)
    }
}
