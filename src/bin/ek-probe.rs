// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Endorsement key probe
//!
//! Talks to the TPM directly over MMIO (no kernel TPM stack involved),
//! reads the public area of the RSA endorsement key at its reserved
//! persistent handle, and dumps the modulus. Requires root for
//! `/dev/mem`.

#[cfg(target_os = "linux")]
fn main() -> std::process::ExitCode {
    use tpm_direct::{
        DevMemMapper, PublicId, SpinTimer, SysfsFirmwareTables, TpmSession, TPM_HANDLE_EK_RSA,
    };
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mmio = match DevMemMapper::open() {
        Ok(mmio) => mmio,
        Err(e) => {
            eprintln!("✗ cannot open /dev/mem (are you root?): {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let session = match TpmSession::discover(&mmio, &SpinTimer, &SysfsFirmwareTables) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("✗ TPM discovery failed: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let info = session.info();
    println!(
        "TPM interface: {:?} at {:#x} (idle bypass: {:?})",
        info.interface, info.base, info.idle_bypass
    );

    match session.read_public(TPM_HANDLE_EK_RSA) {
        Ok(result) => {
            println!("✓ ReadPublic({TPM_HANDLE_EK_RSA:#010x}) succeeded");
            println!("  type:       {:?}", result.public.object_type);
            println!("  name:       {}", hex::encode(&result.name));
            match &result.public.unique {
                PublicId::Rsa(modulus) => {
                    println!("  modulus ({} bytes):", modulus.len());
                    println!("  {}", hex::encode(modulus));
                }
                other => println!("  unique: {other:?}"),
            }
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ ReadPublic failed: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("ek-probe requires Linux (/dev/mem and sysfs ACPI tables)");
}
