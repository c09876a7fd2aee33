// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 constants and command codes.

/// TPM 2.0 structure tags (TPM_ST)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    /// TPM 1.2 response tag; must never appear in a TPM2 response.
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// TPM 2.0 command codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    ReadPublic = 0x00000173,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 response codes (TPM_RC)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x0000_0000;
    /// The handle references a hash or HMAC sequence object.
    pub const SEQUENCE: u32 = 0x0000_0103;
}

/// TPM 2.0 algorithm identifiers (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    Mgf1 = 0x0007,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    Sm3_256 = 0x0012,
    Sm4 = 0x0013,
    RsaSsa = 0x0014,
    RsaEs = 0x0015,
    RsaPss = 0x0016,
    Oaep = 0x0017,
    EcDsa = 0x0018,
    EcDh = 0x0019,
    EcDaa = 0x001A,
    EcSchnorr = 0x001C,
    Kdf1Sp800_56a = 0x0020,
    Kdf2 = 0x0021,
    Kdf1Sp800_108 = 0x0022,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(TpmAlgId::Rsa),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0005 => Some(TpmAlgId::Hmac),
            0x0006 => Some(TpmAlgId::Aes),
            0x0007 => Some(TpmAlgId::Mgf1),
            0x0008 => Some(TpmAlgId::KeyedHash),
            0x000A => Some(TpmAlgId::Xor),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0010 => Some(TpmAlgId::Null),
            0x0012 => Some(TpmAlgId::Sm3_256),
            0x0013 => Some(TpmAlgId::Sm4),
            0x0014 => Some(TpmAlgId::RsaSsa),
            0x0015 => Some(TpmAlgId::RsaEs),
            0x0016 => Some(TpmAlgId::RsaPss),
            0x0017 => Some(TpmAlgId::Oaep),
            0x0018 => Some(TpmAlgId::EcDsa),
            0x0019 => Some(TpmAlgId::EcDh),
            0x001A => Some(TpmAlgId::EcDaa),
            0x001C => Some(TpmAlgId::EcSchnorr),
            0x0020 => Some(TpmAlgId::Kdf1Sp800_56a),
            0x0021 => Some(TpmAlgId::Kdf2),
            0x0022 => Some(TpmAlgId::Kdf1Sp800_108),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0025 => Some(TpmAlgId::SymCipher),
            0x0043 => Some(TpmAlgId::Cfb),
            _ => None,
        }
    }
}

/// RSA endorsement key persistent handle, per the TCG EK Credential
/// Profile provisioning guidance.
pub const TPM_HANDLE_EK_RSA: u32 = 0x8101_0001;

/// tag(2) + paramSize(4) + responseCode(4)
pub const TPM_RESPONSE_HEADER_SIZE: usize = 10;

/// Largest command or response this driver will stage.
pub const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Largest digest in TPMU_HA (SHA-512).
pub const MAX_DIGEST_BYTES: usize = 64;

/// Largest RSA modulus (4096-bit keys).
pub const MAX_RSA_KEY_BYTES: usize = 512;

/// Largest ECC coordinate.
pub const MAX_ECC_KEY_BYTES: usize = 128;

/// Largest TPM2B_NAME payload: algorithm id plus the largest digest.
pub const MAX_NAME_BYTES: usize = 2 + MAX_DIGEST_BYTES;
