// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Register-level chip doubles for transport and session tests.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::mmio::{MmioMapper, Timer};
use crate::Result;

/// Timer that does not actually stall, so timeout paths run at full
/// speed in tests.
pub struct NullTimer;

impl Timer for NullTimer {
    fn stall_us(&self, _us: u32) {}
}

/// Plain byte-addressable register window for discovery tests.
pub struct FlatMmio {
    bytes: RefCell<HashMap<u64, u8>>,
}

impl FlatMmio {
    pub fn new() -> Self {
        Self {
            bytes: RefCell::new(HashMap::new()),
        }
    }

    pub fn set8(&self, phys: u64, v: u8) {
        self.bytes.borrow_mut().insert(phys, v);
    }

    pub fn set32(&self, phys: u64, v: u32) {
        for (i, b) in v.to_le_bytes().iter().enumerate() {
            self.bytes.borrow_mut().insert(phys + i as u64, *b);
        }
    }
}

impl MmioMapper for FlatMmio {
    fn read(&self, phys: u64, out: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.borrow();
        for (i, b) in out.iter_mut().enumerate() {
            *b = bytes.get(&(phys + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&self, phys: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.borrow_mut();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(phys + i as u64, *b);
        }
        Ok(())
    }
}

// Offsets shared with the transports under test.
const CTRL_STATUS: u64 = 0x10;
const CTRL_REQUEST: u64 = 0x14;
const CTRL_CANCEL: u64 = 0x18;
const CTRL_START: u64 = 0x1C;
const DATA_BUFFER: u64 = 0x80;

const REQUEST_COMMAND_READY: u32 = 1 << 0;
const REQUEST_GO_IDLE: u32 = 1 << 1;
const STATUS_TPM_IDLE: u32 = 1 << 1;

struct CrbState {
    idle: bool,
    request: u32,
    start: u32,
    data: Vec<u8>,
    /// Snapshot of the data buffer at the moment Start was invoked.
    command: Vec<u8>,
    response: Vec<u8>,
    ready_responds: bool,
    complete_on_start: bool,
    complete_on_cancel: bool,
    writes: Vec<(u64, u64)>,
}

/// CRB chip double: answers the idle/ready handshake, captures the
/// staged command, and places a canned response on Start (or on Cancel,
/// when scripted that way).
pub struct CrbMock {
    base: u64,
    state: RefCell<CrbState>,
}

impl CrbMock {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            state: RefCell::new(CrbState {
                idle: true,
                request: 0,
                start: 0,
                data: vec![0u8; 4096],
                command: Vec::new(),
                response: Vec::new(),
                ready_responds: true,
                complete_on_start: true,
                complete_on_cancel: false,
                writes: Vec::new(),
            }),
        }
    }

    pub fn set_response(&self, response: Vec<u8>) {
        self.state.borrow_mut().response = response;
    }

    pub fn set_ready_responds(&self, v: bool) {
        self.state.borrow_mut().ready_responds = v;
    }

    pub fn set_complete_on_start(&self, v: bool) {
        self.state.borrow_mut().complete_on_start = v;
    }

    pub fn set_complete_on_cancel(&self, v: bool) {
        self.state.borrow_mut().complete_on_cancel = v;
    }

    /// First `n` bytes the transport staged before invoking Start.
    pub fn command_bytes(&self, n: usize) -> Vec<u8> {
        self.state.borrow().command[..n].to_vec()
    }

    /// Number of register writes of `value` observed at `offset`.
    pub fn register_writes(&self, offset: u64, value: u32) -> usize {
        self.state
            .borrow()
            .writes
            .iter()
            .filter(|(o, v)| *o == offset && *v == u64::from(value))
            .count()
    }

    /// Whether the last write to `CtrlRequest` was `goIdle`.
    pub fn went_idle_last(&self) -> bool {
        self.state
            .borrow()
            .writes
            .iter()
            .rev()
            .find(|(o, _)| *o == CTRL_REQUEST)
            .map(|(_, v)| *v == u64::from(REQUEST_GO_IDLE))
            .unwrap_or(false)
    }

    fn complete(state: &mut CrbState) {
        let response = state.response.clone();
        state.data[..response.len()].copy_from_slice(&response);
        state.start = 0;
    }
}

impl MmioMapper for CrbMock {
    fn read(&self, phys: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state.borrow();
        let offset = phys - self.base;
        if offset >= DATA_BUFFER {
            let start = (offset - DATA_BUFFER) as usize;
            out.copy_from_slice(&state.data[start..start + out.len()]);
            return Ok(());
        }
        let value: u32 = match offset {
            CTRL_STATUS => {
                if state.idle {
                    STATUS_TPM_IDLE
                } else {
                    0
                }
            }
            CTRL_REQUEST => state.request,
            CTRL_START => state.start,
            _ => 0,
        };
        for (i, b) in out.iter_mut().enumerate() {
            *b = value.to_le_bytes().get(i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&self, phys: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let offset = phys - self.base;

        if offset >= DATA_BUFFER {
            let start = (offset - DATA_BUFFER) as usize;
            state.data[start..start + data.len()].copy_from_slice(data);
            return Ok(());
        }

        let mut raw = [0u8; 8];
        raw[..data.len()].copy_from_slice(data);
        let value = u64::from_le_bytes(raw);
        state.writes.push((offset, value));

        match offset {
            CTRL_REQUEST => {
                if value == u64::from(REQUEST_COMMAND_READY) {
                    if state.ready_responds {
                        state.request = 0;
                        state.idle = false;
                    } else {
                        state.request |= REQUEST_COMMAND_READY;
                    }
                } else if value == u64::from(REQUEST_GO_IDLE) {
                    state.request = 0;
                    state.idle = true;
                }
            }
            CTRL_START => {
                if value == 1 {
                    state.command = state.data.clone();
                    if state.complete_on_start {
                        Self::complete(&mut state);
                    } else {
                        state.start = 1;
                    }
                }
            }
            CTRL_CANCEL => {
                if value == 1 && state.complete_on_cancel {
                    Self::complete(&mut state);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

const TIS_STATUS: u64 = 0x18;
const TIS_BURST_COUNT: u64 = 0x19;
const TIS_DATA_FIFO: u64 = 0x24;

const STS_EXPECT: u8 = 0x08;
const STS_DATA: u8 = 0x10;
const STS_GO: u8 = 0x20;
const STS_READY: u8 = 0x40;
const STS_VALID: u8 = 0x80;
const STS_CANCEL: u32 = 0x0100_0000;

struct TisState {
    ready: bool,
    data_ready: bool,
    burst: u16,
    expect_clears: bool,
    produce_data: bool,
    response: Vec<u8>,
    resp_pos: usize,
    command: Vec<u8>,
    cancel_written: bool,
    writes: Vec<(u64, usize, u64)>, // (offset, width, value)
}

/// TIS chip double: streams the FIFO in both directions at a scripted
/// burst pace and models the status handshakes.
pub struct TisMock {
    base: u64,
    state: RefCell<TisState>,
}

impl TisMock {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            state: RefCell::new(TisState {
                ready: false,
                data_ready: false,
                burst: 0,
                expect_clears: true,
                produce_data: true,
                response: Vec::new(),
                resp_pos: 0,
                command: Vec::new(),
                cancel_written: false,
                writes: Vec::new(),
            }),
        }
    }

    pub fn set_burst(&self, burst: u16) {
        self.state.borrow_mut().burst = burst;
    }

    pub fn set_response(&self, response: Vec<u8>) {
        self.state.borrow_mut().response = response;
    }

    pub fn set_produce_data(&self, v: bool) {
        self.state.borrow_mut().produce_data = v;
    }

    pub fn set_expect_clears(&self, v: bool) {
        self.state.borrow_mut().expect_clears = v;
    }

    pub fn command_bytes(&self) -> Vec<u8> {
        self.state.borrow().command.clone()
    }

    pub fn cancel_written(&self) -> bool {
        self.state.borrow().cancel_written
    }

    /// Whether the last byte-wide status write was `STS_READY`.
    pub fn ready_written_last(&self) -> bool {
        self.state
            .borrow()
            .writes
            .iter()
            .rev()
            .find(|(o, width, _)| *o == TIS_STATUS && *width == 1)
            .map(|(_, _, v)| *v == u64::from(STS_READY))
            .unwrap_or(false)
    }

    fn status(state: &TisState) -> u8 {
        let mut sts = STS_VALID;
        if state.ready {
            sts |= STS_READY;
        }
        if !state.expect_clears {
            sts |= STS_EXPECT;
        }
        if state.data_ready {
            sts |= STS_DATA;
        }
        sts
    }
}

impl MmioMapper for TisMock {
    fn read(&self, phys: u64, out: &mut [u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let offset = phys - self.base;
        match offset {
            TIS_STATUS => out[0] = Self::status(&state),
            TIS_BURST_COUNT => out[0] = state.burst.to_le_bytes()[0],
            o if o == TIS_BURST_COUNT + 1 => out[0] = state.burst.to_le_bytes()[1],
            TIS_DATA_FIFO => {
                out[0] = state.response.get(state.resp_pos).copied().unwrap_or(0);
                state.resp_pos += 1;
            }
            _ => out.fill(0),
        }
        Ok(())
    }

    fn write(&self, phys: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let offset = phys - self.base;

        let mut raw = [0u8; 8];
        raw[..data.len()].copy_from_slice(data);
        let value = u64::from_le_bytes(raw);
        state.writes.push((offset, data.len(), value));

        match offset {
            TIS_STATUS if data.len() == 1 => {
                let v = data[0];
                if v == STS_READY {
                    state.ready = true;
                }
                if v == STS_GO && state.produce_data {
                    state.data_ready = true;
                }
            }
            TIS_STATUS => {
                if value & u64::from(STS_CANCEL) != 0 {
                    state.cancel_written = true;
                }
            }
            TIS_DATA_FIFO => state.command.push(data[0]),
            _ => {}
        }
        Ok(())
    }
}
