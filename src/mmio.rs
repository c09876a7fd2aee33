// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! MMIO and stall capabilities.
//!
//! All register traffic goes through [`MmioMapper`], which maps a
//! physical range uncached, performs exactly one volatile access of the
//! requested width, and unmaps before returning. A mapping is never held
//! across a return, so a command transaction is a long sequence of
//! short-lived mappings rather than one long-lived one.

use crate::error::TpmError;
use crate::Result;

/// Volatile, uncached access to physical MMIO space.
///
/// `read`/`write` accept buffers of exactly 1, 2, 4, or 8 bytes; the
/// implementation must perform a single volatile access of that width at
/// a naturally aligned address, with acquire/release ordering relative
/// to the caller. Any other length is `InvalidParameter`.
pub trait MmioMapper {
    fn read(&self, phys: u64, out: &mut [u8]) -> Result<()>;
    fn write(&self, phys: u64, data: &[u8]) -> Result<()>;

    fn read8(&self, phys: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(phys, &mut b)?;
        Ok(b[0])
    }

    fn read16(&self, phys: u64) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(phys, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read32(&self, phys: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(phys, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read64(&self, phys: u64) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(phys, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write8(&self, phys: u64, v: u8) -> Result<()> {
        self.write(phys, &[v])
    }

    fn write16(&self, phys: u64, v: u16) -> Result<()> {
        self.write(phys, &v.to_le_bytes())
    }

    fn write32(&self, phys: u64, v: u32) -> Result<()> {
        self.write(phys, &v.to_le_bytes())
    }

    fn write64(&self, phys: u64, v: u64) -> Result<()> {
        self.write(phys, &v.to_le_bytes())
    }
}

/// Microsecond stall without yielding.
///
/// Transport polling runs in contexts where blocking sleeps are
/// forbidden, so waits are busy spins bounded by the per-step timeouts.
pub trait Timer {
    /// Busy-wait at least `us` microseconds.
    fn stall_us(&self, us: u32);
}

/// [`Timer`] backed by a monotonic clock and a spin hint.
pub struct SpinTimer;

impl Timer for SpinTimer {
    fn stall_us(&self, us: u32) {
        let deadline =
            std::time::Instant::now() + std::time::Duration::from_micros(u64::from(us));
        while std::time::Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Mapper for environments where the MMIO window is already mapped 1:1
/// (kernel identity map, or an emulated window in tests).
pub struct IdentityMapper;

impl IdentityMapper {
    /// # Safety
    ///
    /// The caller must guarantee that every physical address handed to
    /// this mapper is also a valid, uncached virtual address for the
    /// lifetime of the mapper.
    pub const unsafe fn new() -> Self {
        Self
    }
}

impl MmioMapper for IdentityMapper {
    fn read(&self, phys: u64, out: &mut [u8]) -> Result<()> {
        unsafe {
            match out.len() {
                1 => out[0] = core::ptr::read_volatile(phys as *const u8),
                2 => out.copy_from_slice(
                    &core::ptr::read_volatile(phys as *const u16).to_le_bytes(),
                ),
                4 => out.copy_from_slice(
                    &core::ptr::read_volatile(phys as *const u32).to_le_bytes(),
                ),
                8 => out.copy_from_slice(
                    &core::ptr::read_volatile(phys as *const u64).to_le_bytes(),
                ),
                _ => return Err(TpmError::InvalidParameter),
            }
        }
        Ok(())
    }

    fn write(&self, phys: u64, data: &[u8]) -> Result<()> {
        unsafe {
            match data.len() {
                1 => core::ptr::write_volatile(phys as *mut u8, data[0]),
                2 => core::ptr::write_volatile(
                    phys as *mut u16,
                    u16::from_le_bytes([data[0], data[1]]),
                ),
                4 => core::ptr::write_volatile(
                    phys as *mut u32,
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                ),
                8 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(data);
                    core::ptr::write_volatile(phys as *mut u64, u64::from_le_bytes(b));
                }
                _ => return Err(TpmError::InvalidParameter),
            }
        }
        Ok(())
    }
}

/// Mapper over `/dev/mem`: each access maps the containing page with
/// `O_SYNC` semantics, touches the register once, and unmaps.
#[cfg(target_os = "linux")]
pub struct DevMemMapper {
    file: std::fs::File,
    page_size: u64,
}

#[cfg(target_os = "linux")]
impl DevMemMapper {
    pub fn open() -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .map_err(|e| {
                tracing::error!("failed to open /dev/mem: {e}");
                TpmError::MapFailed
            })?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        Ok(Self { file, page_size })
    }

    fn with_mapping<R>(
        &self,
        phys: u64,
        len: usize,
        access: impl FnOnce(*mut u8) -> R,
    ) -> Result<R> {
        use std::os::unix::io::AsRawFd;

        let page_base = phys & !(self.page_size - 1);
        let offset = (phys - page_base) as usize;
        let map_len = offset + len;

        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                page_base as libc::off_t,
            )
        };
        if mapping == libc::MAP_FAILED {
            tracing::error!("mmap of /dev/mem failed for {phys:#x}");
            return Err(TpmError::MapFailed);
        }

        let result = access(unsafe { (mapping as *mut u8).add(offset) });

        unsafe {
            libc::munmap(mapping, map_len);
        }
        Ok(result)
    }
}

#[cfg(target_os = "linux")]
impl MmioMapper for DevMemMapper {
    fn read(&self, phys: u64, out: &mut [u8]) -> Result<()> {
        match out.len() {
            1 | 2 | 4 | 8 => {}
            _ => return Err(TpmError::InvalidParameter),
        }
        let len = out.len();
        self.with_mapping(phys, len, |ptr| unsafe {
            match len {
                1 => out[0] = core::ptr::read_volatile(ptr),
                2 => out.copy_from_slice(
                    &core::ptr::read_volatile(ptr as *const u16).to_le_bytes(),
                ),
                4 => out.copy_from_slice(
                    &core::ptr::read_volatile(ptr as *const u32).to_le_bytes(),
                ),
                _ => out.copy_from_slice(
                    &core::ptr::read_volatile(ptr as *const u64).to_le_bytes(),
                ),
            }
        })
    }

    fn write(&self, phys: u64, data: &[u8]) -> Result<()> {
        match data.len() {
            1 | 2 | 4 | 8 => {}
            _ => return Err(TpmError::InvalidParameter),
        }
        let len = data.len();
        self.with_mapping(phys, len, |ptr| unsafe {
            match len {
                1 => core::ptr::write_volatile(ptr, data[0]),
                2 => core::ptr::write_volatile(
                    ptr as *mut u16,
                    u16::from_le_bytes([data[0], data[1]]),
                ),
                4 => core::ptr::write_volatile(
                    ptr as *mut u32,
                    u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                ),
                _ => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(data);
                    core::ptr::write_volatile(ptr as *mut u64, u64::from_le_bytes(b));
                }
            }
        })
    }
}
