// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-stream state and the transfer engine.
//!
//! The register bank in `lib.rs` parses software's writes into the
//! [`Stream`] structs here; everything that actually moves data lives in
//! the [`DmaState`] methods. The split matters for ordering: a transfer
//! can be triggered from a register write (enable edge) or from a request
//! pin, and both paths funnel through [`DmaState::select_transfer`].

use std::sync::Arc;

use emu_api::{MachineContext, OutputLine};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::STREAM_COUNT;

/// Transfer direction, as encoded in CR.DIR.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Direction {
    PeripheralToMemory = 0,
    MemoryToPeripheral = 1,
    MemoryToMemory = 2,
}

/// Transfer item width, as encoded in CR.PSIZE/CR.MSIZE.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum TransferSize {
    Byte = 0,
    HalfWord = 1,
    Word = 2,
}

impl TransferSize {
    pub fn bytes(self) -> u32 {
        match self {
            TransferSize::Byte => 1,
            TransferSize::HalfWord => 2,
            TransferSize::Word => 4,
        }
    }
}

/// One of the eight independent transfer contexts.
#[derive(Copy, Clone, Debug)]
pub struct Stream {
    pub enabled: bool,
    pub request_pending: bool,
    pub dir: Direction,
    pub psize: TransferSize,
    pub msize: TransferSize,
    pub pinc: bool,
    pub minc: bool,
    pub circular: bool,
    pub tcie: bool,
    pub par: u32,
    pub m0ar: u32,
    pub m1ar: u32,
    /// Number of data items left, in units of the peripheral size.
    pub ndt: u16,
    /// Snapshot of NDT taken at the enable edge; restores NDT in circular
    /// mode.
    pub latch: u16,
    pub finished: bool,
}

impl Stream {
    pub fn new() -> Self {
        Self {
            enabled: false,
            request_pending: false,
            dir: Direction::PeripheralToMemory,
            psize: TransferSize::Byte,
            msize: TransferSize::Byte,
            pinc: false,
            minc: false,
            circular: false,
            tcie: false,
            par: 0,
            m0ar: 0,
            m1ar: 0,
            ndt: 0,
            latch: 0,
            finished: false,
        }
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the register callbacks operate on: the streams, the owning
/// machine's bus and scheduler, and the per-stream IRQ lines.
pub struct DmaState {
    pub name: &'static str,
    pub streams: [Stream; STREAM_COUNT],
    pub ctx: MachineContext,
    pub irqs: [Arc<OutputLine>; STREAM_COUNT],
}

impl DmaState {
    /// Drives a stream's peripheral request input. The pending latch
    /// follows the pin level; a rising edge on an enabled stream
    /// dispatches a transfer.
    pub fn set_request(&mut self, index: usize, level: bool) {
        let rising = level && !self.streams[index].request_pending;
        self.streams[index].request_pending = level;
        if !rising {
            return;
        }
        if self.streams[index].enabled {
            self.select_transfer(index);
        } else {
            log::debug!(
                "{}: request pulse on disabled stream {index} ignored",
                self.name
            );
        }
    }

    /// Software wrote CR.EN. Edges are detected against the live stream
    /// state because EN clears itself on completion, independent of what
    /// the register still holds.
    pub fn write_enable(&mut self, index: usize, enable: bool) {
        let was = self.streams[index].enabled;
        if enable && !was {
            {
                let s = &mut self.streams[index];
                s.enabled = true;
                s.latch = s.ndt;
            }
            // Memory-to-memory streams have no request pin to wait for
            // once a request is already pending: they burst on enable.
            let s = self.streams[index];
            if s.dir == Direction::MemoryToMemory && s.request_pending {
                self.select_transfer(index);
            }
        } else if !enable && was {
            // Disabling cancels future transfers; completed copies and
            // the finished/IRQ state stay as they are.
            self.streams[index].enabled = false;
        }
    }

    pub fn write_ndt(&mut self, index: usize, value: u16) {
        if self.streams[index].enabled {
            log::warn!(
                "{}: stream {index}: NDTR write while enabled ignored",
                self.name
            );
            return;
        }
        self.streams[index].ndt = value;
    }

    pub fn write_address(&mut self, index: usize, reg: AddressReg, value: u32) {
        if self.streams[index].enabled {
            log::warn!(
                "{}: stream {index}: {reg:?} write while enabled ignored",
                self.name
            );
            return;
        }
        let s = &mut self.streams[index];
        match reg {
            AddressReg::Par => s.par = value,
            AddressReg::M0ar => s.m0ar = value,
            AddressReg::M1ar => s.m1ar = value,
        }
    }

    pub fn set_direction(&mut self, index: usize, bits: u32) {
        self.streams[index].dir = Direction::from_u32(bits).unwrap_or_else(|| {
            log::warn!(
                "{}: stream {index}: reserved DIR encoding {bits}, treating as peripheral-to-memory",
                self.name
            );
            Direction::PeripheralToMemory
        });
    }

    pub fn set_size(&mut self, index: usize, memory_side: bool, bits: u32) {
        let size = TransferSize::from_u32(bits).unwrap_or_else(|| {
            log::warn!(
                "{}: stream {index}: reserved size encoding {bits}, treating as one byte",
                self.name
            );
            TransferSize::Byte
        });
        if memory_side {
            self.streams[index].msize = size;
        } else {
            self.streams[index].psize = size;
        }
    }

    /// Dispatches one transfer for a stream whose request fired:
    /// memory-to-memory streams burst the whole block, everything else
    /// moves exactly one item per request.
    pub fn select_transfer(&mut self, index: usize) {
        match self.streams[index].dir {
            Direction::MemoryToMemory => self.do_memory_transfer(index),
            _ => self.do_peripheral_transfer(index),
        }
    }

    fn do_memory_transfer(&mut self, index: usize) {
        let s = self.streams[index];
        if s.ndt == 0 {
            self.abort_stream(index, "NDT is zero");
            return;
        }
        let done = u32::from(s.latch - s.ndt);
        let mut src = s.par;
        let mut dst = s.m0ar;
        if s.pinc {
            src = src.wrapping_add(done * s.psize.bytes());
        }
        if s.minc {
            dst = dst.wrapping_add(done * s.msize.bytes());
        }
        let len = u32::from(s.ndt) * s.psize.bytes();
        self.ctx.bus.copy(u64::from(src), u64::from(dst), len as usize);

        let s = &mut self.streams[index];
        if s.circular {
            s.ndt = s.latch;
        } else {
            s.ndt = 0;
            s.enabled = false;
        }
        self.complete(index);
    }

    fn do_peripheral_transfer(&mut self, index: usize) {
        let s = self.streams[index];
        if s.ndt == 0 {
            self.abort_stream(index, "NDT is zero");
            return;
        }
        // alreadyTransferred is derived from the latch rather than kept
        // separately, which makes the circular reload restart the
        // addresses for free.
        let done = u32::from(s.latch - s.ndt);
        let (mut src, src_size, src_inc, mut dst, dst_size, dst_inc) = match s.dir {
            Direction::PeripheralToMemory => {
                (s.par, s.psize, s.pinc, s.m0ar, s.msize, s.minc)
            }
            Direction::MemoryToPeripheral => {
                (s.m0ar, s.msize, s.minc, s.par, s.psize, s.pinc)
            }
            // Routed to do_memory_transfer by select_transfer.
            Direction::MemoryToMemory => unreachable!(),
        };
        if src_inc {
            src = src.wrapping_add(done * src_size.bytes());
        }
        if dst_inc {
            dst = dst.wrapping_add(done * dst_size.bytes());
        }
        self.ctx
            .bus
            .copy(u64::from(src), u64::from(dst), s.psize.bytes() as usize);

        let s = &mut self.streams[index];
        s.ndt -= 1;
        if s.ndt > 0 {
            // Incomplete: wait for the next request, no IRQ.
            return;
        }
        if s.circular {
            s.ndt = s.latch;
        } else {
            s.enabled = false;
        }
        self.complete(index);
    }

    /// Marks a stream finished and, if enabled, raises its IRQ at the
    /// next synchronization point. The deferral keeps the edge out of the
    /// bus transaction that caused it.
    fn complete(&mut self, index: usize) {
        self.streams[index].finished = true;
        if self.streams[index].tcie {
            let line = self.irqs[index].clone();
            self.ctx
                .sync
                .execute_in_nearest_synced_state(Box::new(move || line.set(true)));
        }
    }

    fn abort_stream(&mut self, index: usize, why: &str) {
        log::error!(
            "{}: stream {index}: cannot create transfer request: {why}; disabling stream",
            self.name
        );
        self.streams[index].enabled = false;
    }

    /// Clears a stream's finished flag and de-asserts its IRQ line.
    pub fn clear_finished(&mut self, index: usize) {
        self.streams[index].finished = false;
        self.irqs[index].set(false);
    }

    pub fn reset(&mut self) {
        for index in 0..STREAM_COUNT {
            self.streams[index] = Stream::new();
            self.irqs[index].set(false);
        }
    }
}

/// The four per-stream address/count registers that are locked while the
/// stream is enabled.
#[derive(Copy, Clone, Debug)]
pub enum AddressReg {
    Par,
    M0ar,
    M1ar,
}
