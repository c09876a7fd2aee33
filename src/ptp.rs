// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Platform TPM Profile interface discovery.
//!
//! Two phases: locate the locality-0 register base (ACPI TPM2 table
//! preferred, hardcoded Intel PCH base as a fallback), then classify the
//! interface the chip exposes from its identification registers.

use tracing::{debug, error};

use crate::acpi::{self, FirmwareTableSource};
use crate::error::TpmError;
use crate::mmio::MmioMapper;
use crate::Result;

/// Physical layer the chip exposes at locality 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpInterface {
    /// No chip behind the register window.
    None,
    Crb,
    Fifo,
    Tis,
}

/// Discovery outcome, consumed by [`crate::TpmSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpInfo {
    /// Locality-0 register base.
    pub base: u64,
    pub interface: PtpInterface,
    /// CRB only. `0` means Idle must be enforced before each command;
    /// any other value permits bypassing it.
    pub idle_bypass: Option<u8>,
}

/// Well-known register base on Intel PCH platforms.
pub const INTEL_PCH_TPM_BASE: u64 = 0xFED4_0000;

const INTERFACE_CAPABILITY_OFFSET: u64 = 0x14;
const INTERFACE_ID_OFFSET: u64 = 0x30;

const INTERFACE_TYPE_FIFO: u32 = 0x0;
const INTERFACE_TYPE_CRB: u32 = 0x1;
const INTERFACE_TYPE_TIS: u32 = 0xF;
const INTERFACE_VERSION_FIFO: u32 = 0x0;
const INTERFACE_VERSION_CRB: u32 = 0x1;
const CAPABILITY_VERSION_PTP: u32 = 0x3;

fn interface_type(id: u32) -> u32 {
    id & 0xF
}

fn interface_version(id: u32) -> u32 {
    (id >> 4) & 0xF
}

fn cap_crb_idle_bypass(id: u32) -> u8 {
    ((id >> 9) & 1) as u8
}

fn cap_fifo(id: u32) -> bool {
    (id >> 13) & 1 != 0
}

fn cap_crb(id: u32) -> bool {
    (id >> 14) & 1 != 0
}

fn capability_version(cap: u32) -> u32 {
    (cap >> 28) & 0x7
}

/// Locate the register base and classify the interface behind it.
pub fn discover(mmio: &dyn MmioMapper, tables: &dyn FirmwareTableSource) -> Result<PtpInfo> {
    let base = locate_base(tables)?;
    classify(mmio, base)
}

fn locate_base(tables: &dyn FirmwareTableSource) -> Result<u64> {
    if let Some(base) = acpi::control_area_address(tables) {
        return Ok(base);
    }
    vendor_fallback()
}

#[cfg(target_arch = "x86_64")]
fn vendor_fallback() -> Result<u64> {
    let id = unsafe { core::arch::x86_64::__cpuid(0) };
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&id.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&id.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&id.ecx.to_le_bytes());

    if &vendor == b"GenuineIntel" {
        debug!("no usable ACPI TPM2 table, assuming Intel PCH register base");
        Ok(INTEL_PCH_TPM_BASE)
    } else {
        error!(
            vendor = %String::from_utf8_lossy(&vendor),
            "no usable ACPI TPM2 table and no known register base for this vendor"
        );
        Err(TpmError::Unsupported)
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn vendor_fallback() -> Result<u64> {
    error!("no usable ACPI TPM2 table and no fallback base on this architecture");
    Err(TpmError::DiscoveryFailed)
}

/// Classify the interface at `base` from its identification registers.
pub fn classify(mmio: &dyn MmioMapper, base: u64) -> Result<PtpInfo> {
    // A chipless window floats high.
    if mmio.read8(base)? == 0xFF {
        debug!("no TPM chip present at {base:#x}");
        return Ok(PtpInfo {
            base,
            interface: PtpInterface::None,
            idle_bypass: None,
        });
    }

    let id = mmio.read32(base + INTERFACE_ID_OFFSET)?;
    let cap = mmio.read32(base + INTERFACE_CAPABILITY_OFFSET)?;

    if interface_type(id) == INTERFACE_TYPE_CRB
        && interface_version(id) == INTERFACE_VERSION_CRB
        && cap_crb(id)
    {
        let idle_bypass = cap_crb_idle_bypass(id);
        if idle_bypass == 0xFF {
            error!("CRB idle-bypass state unreadable, check PTP awareness in BIOS");
            return Err(TpmError::DiscoveryFailed);
        }
        debug!(idle_bypass, "TPM exposes the CRB interface");
        return Ok(PtpInfo {
            base,
            interface: PtpInterface::Crb,
            idle_bypass: Some(idle_bypass),
        });
    }

    if interface_type(id) == INTERFACE_TYPE_FIFO
        && interface_version(id) == INTERFACE_VERSION_FIFO
        && cap_fifo(id)
        && capability_version(cap) == CAPABILITY_VERSION_PTP
    {
        debug!("TPM exposes the FIFO interface");
        return Ok(PtpInfo {
            base,
            interface: PtpInterface::Fifo,
            idle_bypass: None,
        });
    }

    if interface_type(id) == INTERFACE_TYPE_TIS {
        debug!("TPM exposes the legacy TIS interface");
        return Ok(PtpInfo {
            base,
            interface: PtpInterface::Tis,
            idle_bypass: None,
        });
    }

    error!("unrecognized TPM interface {id:#010x}, check that the TPM is enabled in BIOS");
    Err(TpmError::DiscoveryFailed)
}
