// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! ACPI TPM2 table access.
//!
//! The firmware's `TPM2` table carries the physical address of the TPM
//! control area. Retrieval of raw tables is a platform capability; this
//! module only parses.

use tracing::{debug, warn};

/// Platform capability for retrieving raw firmware tables.
pub trait FirmwareTableSource {
    /// The raw ACPI table with the given signature, header included, or
    /// `None` if the firmware does not publish one.
    fn acpi_table(&self, signature: &[u8; 4]) -> Option<Vec<u8>>;
}

pub const TPM2_TABLE_SIGNATURE: [u8; 4] = *b"TPM2";

// Standard ACPI header (36 bytes) + PlatformClass(2) + Reserved(2),
// then the 64-bit control area address.
const CONTROL_AREA_OFFSET: usize = 40;
const TPM2_TABLE_MIN_LEN: usize = CONTROL_AREA_OFFSET + 8 + 4;

/// Physical address of the TPM control area from the ACPI TPM2 table,
/// or `None` when the table is missing or unusable.
pub(crate) fn control_area_address(tables: &dyn FirmwareTableSource) -> Option<u64> {
    let table = tables.acpi_table(&TPM2_TABLE_SIGNATURE)?;
    if table.len() < TPM2_TABLE_MIN_LEN {
        warn!(len = table.len(), "TPM2 ACPI table truncated");
        return None;
    }
    if table[..4] != TPM2_TABLE_SIGNATURE {
        warn!("firmware returned a table with the wrong signature");
        return None;
    }

    let mut addr = [0u8; 8];
    addr.copy_from_slice(&table[CONTROL_AREA_OFFSET..CONTROL_AREA_OFFSET + 8]);
    let addr = u64::from_le_bytes(addr);
    if addr == 0 {
        warn!("TPM2 ACPI table has no control area address");
        return None;
    }
    debug!("TPM2 control area from ACPI: {addr:#x}");
    Some(addr)
}

/// Table source backed by `/sys/firmware/acpi/tables`.
#[cfg(target_os = "linux")]
pub struct SysfsFirmwareTables;

#[cfg(target_os = "linux")]
impl FirmwareTableSource for SysfsFirmwareTables {
    fn acpi_table(&self, signature: &[u8; 4]) -> Option<Vec<u8>> {
        let name = std::str::from_utf8(signature).ok()?;
        std::fs::read(format!("/sys/firmware/acpi/tables/{name}")).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTables(Option<Vec<u8>>);

    impl FirmwareTableSource for FakeTables {
        fn acpi_table(&self, signature: &[u8; 4]) -> Option<Vec<u8>> {
            assert_eq!(signature, &TPM2_TABLE_SIGNATURE);
            self.0.clone()
        }
    }

    fn tpm2_table(control_area: u64) -> Vec<u8> {
        let mut table = vec![0u8; TPM2_TABLE_MIN_LEN];
        table[..4].copy_from_slice(b"TPM2");
        table[CONTROL_AREA_OFFSET..CONTROL_AREA_OFFSET + 8]
            .copy_from_slice(&control_area.to_le_bytes());
        table
    }

    #[test]
    fn parses_control_area() {
        let tables = FakeTables(Some(tpm2_table(0xFED4_0000)));
        assert_eq!(control_area_address(&tables), Some(0xFED4_0000));
    }

    #[test]
    fn missing_table() {
        assert_eq!(control_area_address(&FakeTables(None)), None);
    }

    #[test]
    fn truncated_table() {
        let tables = FakeTables(Some(b"TPM2".to_vec()));
        assert_eq!(control_area_address(&tables), None);
    }

    #[test]
    fn zero_address_is_unusable() {
        let tables = FakeTables(Some(tpm2_table(0)));
        assert_eq!(control_area_address(&tables), None);
    }
}
