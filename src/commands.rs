// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command-level TPM operations.
//!
//! [`TpmSession`] owns the discovery result and the platform
//! capabilities, serializes command submission (the chip processes one
//! command at a time), and dispatches each command to whichever
//! transport the chip exposes.

use std::sync::Mutex;

use tracing::{debug, error};

use crate::acpi::FirmwareTableSource;
use crate::constants::*;
use crate::crb::CrbTransport;
use crate::error::TpmError;
use crate::marshal::{CommandBuffer, ResponseBuffer};
use crate::mmio::{MmioMapper, Timer};
use crate::ptp::{self, PtpInfo, PtpInterface};
use crate::tis::TisTransport;
use crate::types::{decode_read_public, ReadPublicResult};
use crate::Result;

/// Builder for TPM2 command frames: big-endian header with a deferred
/// size field, then handles and parameters.
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    /// Start a sessionless command.
    pub fn new(command_code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(64);
        buf.put_u16(TpmSt::NoSessions.to_u16());
        buf.put_u32(0); // patched by finalize
        buf.put_u32(command_code.to_u32());
        Self { buf }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_bytes(bytes);
    }

    /// Patch the size field and return the frame.
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// The 14-byte `TPM2_ReadPublic` command frame.
pub fn encode_read_public(object_handle: u32) -> Vec<u8> {
    let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
    cmd.add_handle(object_handle);
    cmd.finalize()
}

/// Session against one discovered TPM.
pub struct TpmSession<'a> {
    mmio: &'a dyn MmioMapper,
    timer: &'a dyn Timer,
    info: PtpInfo,
    // The chip handles one command at a time; this orders concurrent
    // submissions on a shared session.
    cmd_lock: Mutex<()>,
}

impl<'a> TpmSession<'a> {
    /// Run interface discovery and open a session on the result.
    pub fn discover(
        mmio: &'a dyn MmioMapper,
        timer: &'a dyn Timer,
        tables: &dyn FirmwareTableSource,
    ) -> Result<Self> {
        let info = ptp::discover(mmio, tables)?;
        debug!(?info, "TPM session opened");
        Ok(Self::with_interface(mmio, timer, info))
    }

    /// Open a session on an already-known interface.
    pub fn with_interface(mmio: &'a dyn MmioMapper, timer: &'a dyn Timer, info: PtpInfo) -> Self {
        Self {
            mmio,
            timer,
            info,
            cmd_lock: Mutex::new(()),
        }
    }

    pub fn info(&self) -> &PtpInfo {
        &self.info
    }

    /// Submit a raw command frame and drain the response into `resp`,
    /// returning the actual response length.
    pub fn submit(&self, cmd: &[u8], resp: &mut [u8]) -> Result<usize> {
        // A poisoned lock only means an earlier panic mid-command; the
        // guard still provides the ordering we need.
        let _serialized = self
            .cmd_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.info.interface {
            PtpInterface::None => Err(TpmError::DeviceNotConnected),
            PtpInterface::Crb => CrbTransport::new(
                self.mmio,
                self.timer,
                self.info.base,
                self.info.idle_bypass.unwrap_or(0),
            )
            .submit(cmd, resp),
            PtpInterface::Fifo | PtpInterface::Tis => {
                TisTransport::new(self.mmio, self.timer, self.info.base).submit(cmd, resp)
            }
        }
    }

    /// `TPM2_ReadPublic`: the public area, name, and qualified name of
    /// the object behind `object_handle`.
    pub fn read_public(&self, object_handle: u32) -> Result<ReadPublicResult> {
        let cmd = encode_read_public(object_handle);
        let mut resp = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let len = self.submit(&cmd, &mut resp)?;
        if len < TPM_RESPONSE_HEADER_SIZE {
            error!(len, "response shorter than a header");
            return Err(TpmError::BufferTooSmall);
        }
        let resp = &resp[..len];

        let mut header = ResponseBuffer::new(resp);
        header.skip(6)?; // tag + paramSize, validated by the transport
        let response_code = header.get_u32()?;
        match response_code {
            tpm_rc::SUCCESS => {}
            tpm_rc::SEQUENCE => {
                error!("handle {object_handle:#010x} refers to a sequence object");
                return Err(TpmError::InvalidParameter);
            }
            code => {
                error!("ReadPublic failed with response code {code:#010x}");
                return Err(TpmError::DeviceBusy);
            }
        }

        decode_read_public(resp)
    }
}
