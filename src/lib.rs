// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Direct TPM 2.0 access over MMIO
//!
//! This crate drives a discrete TPM 2.0 chip through its locality-0
//! register interface, bypassing the operating system's TPM stack. It
//! discovers which physical layer the chip exposes (CRB, FIFO, or
//! legacy TIS), runs the corresponding register-level command protocol,
//! and speaks the big-endian TPM2 wire format.
//!
//! Platform privileges enter through three capability traits so the
//! core stays host-agnostic:
//!
//! - [`MmioMapper`] — volatile, uncached access to physical MMIO space
//! - [`Timer`] — microsecond stalls without yielding
//! - [`FirmwareTableSource`] — raw ACPI table retrieval
//!
//! ## Example
//!
#![cfg_attr(target_os = "linux", doc = "```no_run")]
#![cfg_attr(not(target_os = "linux"), doc = "```ignore")]
//! use tpm_direct::{DevMemMapper, SpinTimer, SysfsFirmwareTables, TpmSession};
//!
//! let mmio = DevMemMapper::open()?;
//! let session = TpmSession::discover(&mmio, &SpinTimer, &SysfsFirmwareTables)?;
//! let ek = session.read_public(tpm_direct::TPM_HANDLE_EK_RSA)?;
//! println!("EK type: {:?}", ek.public.object_type);
//! # Ok::<(), tpm_direct::TpmError>(())
//! ```

mod acpi;
mod commands;
mod constants;
mod crb;
mod error;
mod marshal;
mod mmio;
#[cfg(test)]
mod mock;
mod ptp;
mod tis;
mod types;

pub type Result<T> = core::result::Result<T, TpmError>;

pub use acpi::FirmwareTableSource;
#[cfg(target_os = "linux")]
pub use acpi::SysfsFirmwareTables;
pub use commands::{encode_read_public, TpmCommand, TpmSession};
pub use constants::*;
pub use error::TpmError;
pub use marshal::{CommandBuffer, ResponseBuffer, Unmarshal};
#[cfg(target_os = "linux")]
pub use mmio::DevMemMapper;
pub use mmio::{IdentityMapper, MmioMapper, SpinTimer, Timer};
pub use ptp::{discover, PtpInfo, PtpInterface, INTEL_PCH_TPM_BASE};
pub use types::{
    decode_read_public, EccParms, EccScheme, KdfScheme, KeyedHashScheme, PublicId, PublicParms,
    ReadPublicResult, RsaParms, RsaScheme, SymDef, TpmtPublic,
};
