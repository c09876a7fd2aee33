// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 response structures.
//!
//! `TPMT_PUBLIC` is a nested tagged union keyed by the object type; the
//! representation here is a sum type whose variants carry only the
//! fields that exist on the wire for that type. Every length field is
//! checked against its documented maximum before anything is copied,
//! and the envelope must account for every byte it declares.

use tracing::error;

use crate::constants::*;
use crate::error::TpmError;
use crate::marshal::{ResponseBuffer, Unmarshal};
use crate::Result;

/// Decoded reply of `TPM2_ReadPublic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPublicResult {
    pub public: TpmtPublic,
    /// TPM2B_NAME payload.
    pub name: Vec<u8>,
    /// TPM2B_NAME payload.
    pub qualified_name: Vec<u8>,
}

/// TPMT_PUBLIC public area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub object_type: TpmAlgId,
    /// Raw TPM_ALG_ID of the name algorithm; not interpreted here.
    pub name_alg: u16,
    pub object_attributes: u32,
    pub auth_policy: Vec<u8>,
    pub parameters: PublicParms,
    pub unique: PublicId,
}

/// TPMU_PUBLIC_PARMS, keyed by the object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicParms {
    KeyedHash(KeyedHashScheme),
    SymCipher(SymDef),
    Rsa(RsaParms),
    Ecc(EccParms),
}

/// TPMT_KEYEDHASH_SCHEME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyedHashScheme {
    Hmac { hash_alg: u16 },
    Xor { hash_alg: u16, kdf: u16 },
}

/// TPMT_SYM_DEF_OBJECT. `Xor` only occurs inside symmetric-cipher
/// objects, never in the symmetric block of an RSA or ECC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymDef {
    Null,
    Aes { key_bits: u16, mode: u16 },
    Sm4 { key_bits: u16, mode: u16 },
    Xor { key_bits: u16 },
}

/// TPMT_RSA_SCHEME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaScheme {
    Null,
    RsaSsa { hash_alg: u16 },
    RsaPss { hash_alg: u16 },
    Oaep { hash_alg: u16 },
    RsaEs,
}

/// TPMS_RSA_PARMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsaParms {
    pub symmetric: SymDef,
    pub scheme: RsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

/// TPMT_ECC_SCHEME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccScheme {
    Null,
    EcDsa { hash_alg: u16 },
    EcDaa { hash_alg: u16 },
    EcSchnorr { hash_alg: u16 },
    EcDh,
}

/// TPMT_KDF_SCHEME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfScheme {
    Null,
    Mgf1 { hash_alg: u16 },
    Kdf1Sp800_108 { hash_alg: u16 },
    Kdf1Sp800_56a { hash_alg: u16 },
    Kdf2 { hash_alg: u16 },
}

/// TPMS_ECC_PARMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccParms {
    pub symmetric: SymDef,
    pub scheme: EccScheme,
    pub curve_id: u16,
    pub kdf: KdfScheme,
}

/// TPMU_PUBLIC_ID, keyed by the object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicId {
    KeyedHash(Vec<u8>),
    Sym(Vec<u8>),
    /// RSA modulus.
    Rsa(Vec<u8>),
    Ecc { x: Vec<u8>, y: Vec<u8> },
}

fn unsupported(context: &str, value: u16) -> TpmError {
    error!("unsupported {context}: {value:#06x}");
    TpmError::Unsupported
}

fn decode_sym_def(buf: &mut ResponseBuffer, allow_xor: bool) -> Result<SymDef> {
    let algorithm = buf.get_u16()?;
    match TpmAlgId::from_u16(algorithm) {
        Some(TpmAlgId::Aes) => Ok(SymDef::Aes {
            key_bits: buf.get_u16()?,
            mode: buf.get_u16()?,
        }),
        Some(TpmAlgId::Sm4) => Ok(SymDef::Sm4 {
            key_bits: buf.get_u16()?,
            mode: buf.get_u16()?,
        }),
        Some(TpmAlgId::Xor) if allow_xor => Ok(SymDef::Xor {
            key_bits: buf.get_u16()?,
        }),
        Some(TpmAlgId::Null) => Ok(SymDef::Null),
        _ => Err(unsupported("symmetric algorithm", algorithm)),
    }
}

impl Unmarshal for KeyedHashScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = buf.get_u16()?;
        match TpmAlgId::from_u16(scheme) {
            Some(TpmAlgId::Hmac) => Ok(KeyedHashScheme::Hmac {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::Xor) => Ok(KeyedHashScheme::Xor {
                hash_alg: buf.get_u16()?,
                kdf: buf.get_u16()?,
            }),
            _ => Err(unsupported("keyedhash scheme", scheme)),
        }
    }
}

impl Unmarshal for RsaScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = buf.get_u16()?;
        match TpmAlgId::from_u16(scheme) {
            Some(TpmAlgId::RsaSsa) => Ok(RsaScheme::RsaSsa {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::RsaPss) => Ok(RsaScheme::RsaPss {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::Oaep) => Ok(RsaScheme::Oaep {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::RsaEs) => Ok(RsaScheme::RsaEs),
            Some(TpmAlgId::Null) => Ok(RsaScheme::Null),
            _ => Err(unsupported("RSA scheme", scheme)),
        }
    }
}

impl Unmarshal for RsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = decode_sym_def(buf, false)?;
        let scheme = RsaScheme::unmarshal(buf)?;
        let key_bits = buf.get_u16()?;
        // The exponent occupies 32 bits on the wire.
        let exponent = buf.get_u32()?;
        Ok(Self {
            symmetric,
            scheme,
            key_bits,
            exponent,
        })
    }
}

impl Unmarshal for EccScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = buf.get_u16()?;
        match TpmAlgId::from_u16(scheme) {
            Some(TpmAlgId::EcDsa) => Ok(EccScheme::EcDsa {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::EcDaa) => Ok(EccScheme::EcDaa {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::EcSchnorr) => Ok(EccScheme::EcSchnorr {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::EcDh) => Ok(EccScheme::EcDh),
            Some(TpmAlgId::Null) => Ok(EccScheme::Null),
            _ => Err(unsupported("ECC scheme", scheme)),
        }
    }
}

impl Unmarshal for KdfScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = buf.get_u16()?;
        match TpmAlgId::from_u16(scheme) {
            Some(TpmAlgId::Mgf1) => Ok(KdfScheme::Mgf1 {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::Kdf1Sp800_108) => Ok(KdfScheme::Kdf1Sp800_108 {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::Kdf1Sp800_56a) => Ok(KdfScheme::Kdf1Sp800_56a {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::Kdf2) => Ok(KdfScheme::Kdf2 {
                hash_alg: buf.get_u16()?,
            }),
            Some(TpmAlgId::Null) => Ok(KdfScheme::Null),
            _ => Err(unsupported("KDF scheme", scheme)),
        }
    }
}

impl Unmarshal for EccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = decode_sym_def(buf, false)?;
        let scheme = EccScheme::unmarshal(buf)?;
        let curve_id = buf.get_u16()?;
        let kdf = KdfScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_raw = buf.get_u16()?;
        let object_type = match TpmAlgId::from_u16(type_raw) {
            Some(
                t @ (TpmAlgId::KeyedHash | TpmAlgId::SymCipher | TpmAlgId::Rsa | TpmAlgId::Ecc),
            ) => t,
            _ => return Err(unsupported("public area type", type_raw)),
        };

        let name_alg = buf.get_u16()?;
        let object_attributes = buf.get_u32()?;
        let auth_policy = buf.get_tpm2b(MAX_DIGEST_BYTES)?;

        let parameters = match object_type {
            TpmAlgId::KeyedHash => PublicParms::KeyedHash(KeyedHashScheme::unmarshal(buf)?),
            TpmAlgId::SymCipher => PublicParms::SymCipher(decode_sym_def(buf, true)?),
            TpmAlgId::Rsa => PublicParms::Rsa(RsaParms::unmarshal(buf)?),
            _ => PublicParms::Ecc(EccParms::unmarshal(buf)?),
        };

        let unique = match object_type {
            TpmAlgId::KeyedHash => PublicId::KeyedHash(buf.get_tpm2b(MAX_DIGEST_BYTES)?),
            TpmAlgId::SymCipher => PublicId::Sym(buf.get_tpm2b(MAX_DIGEST_BYTES)?),
            TpmAlgId::Rsa => PublicId::Rsa(buf.get_tpm2b(MAX_RSA_KEY_BYTES)?),
            _ => PublicId::Ecc {
                x: buf.get_tpm2b(MAX_ECC_KEY_BYTES)?,
                y: buf.get_tpm2b(MAX_ECC_KEY_BYTES)?,
            },
        };

        Ok(Self {
            object_type,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// Decode a complete, successful `TPM2_ReadPublic` response.
///
/// Layout: `header(10) | TPM2B_PUBLIC | TPM2B_NAME | TPM2B_NAME`, where
/// the declared sizes must add up to the received length exactly.
pub fn decode_read_public(resp: &[u8]) -> Result<ReadPublicResult> {
    if resp.len() < TPM_RESPONSE_HEADER_SIZE {
        return Err(TpmError::BufferTooSmall);
    }

    let mut buf = ResponseBuffer::new(resp);
    // The session already triaged tag and response code.
    buf.skip(TPM_RESPONSE_HEADER_SIZE)?;

    let out_public_size = buf.get_u16()? as usize;
    let public_bytes = buf.get_bytes(out_public_size)?;
    let mut public_buf = ResponseBuffer::new(public_bytes);
    let public = TpmtPublic::unmarshal(&mut public_buf)?;
    if public_buf.remaining() != 0 {
        error!(
            trailing = public_buf.remaining(),
            "public area shorter than its declared size"
        );
        return Err(TpmError::DeviceBusy);
    }

    let name = buf.get_tpm2b(MAX_NAME_BYTES)?;
    let qualified_name = buf.get_tpm2b(MAX_NAME_BYTES)?;

    if buf.remaining() != 0 {
        error!(
            trailing = buf.remaining(),
            "response longer than its declared structures"
        );
        return Err(TpmError::DeviceBusy);
    }

    Ok(ReadPublicResult {
        public,
        name,
        qualified_name,
    })
}
