// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy surfaced by the driver core.

use thiserror::Error;

/// Errors produced by discovery, the transports, and the wire codec.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TpmError {
    /// ACPI TPM2 table unusable, BIOS not PTP-aware, or the
    /// identification registers describe no known interface.
    #[error("TPM interface discovery failed")]
    DiscoveryFailed,

    /// Refused vendor fallback, legacy response tag, or an unknown
    /// public-area variant.
    #[error("operation not supported")]
    Unsupported,

    /// Discovery found no chip behind the register window.
    #[error("TPM device not connected")]
    DeviceNotConnected,

    /// A transport timeout that was recovered by releasing the device,
    /// or a response whose structure sizes disagree with each other.
    #[error("TPM device busy")]
    DeviceBusy,

    /// The caller's response buffer cannot hold the reply.
    #[error("response buffer too small")]
    BufferTooSmall,

    /// Bad argument, or the object handle refers to a sequence object.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The platform refused to map the MMIO range.
    #[error("MMIO mapping failed")]
    MapFailed,

    /// A register poll expired. Internal: the transports translate this
    /// into `DeviceBusy` or `BufferTooSmall` before returning.
    #[error("timed out waiting for the TPM")]
    Timeout,
}
