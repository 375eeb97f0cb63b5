// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulated STM32-style multi-stream DMA controller.
//!
//! Eight independent streams share a 1 KiB register region: a four-word
//! interrupt block (status low/high, clear low/high) followed by one
//! 0x18-byte block per stream (CR, NDTR, PAR, M0AR, M1AR, FCR). The
//! software contract worth calling out:
//!
//! - NDTR and the address registers are locked while the stream is
//!   enabled; writes are ignored and logged.
//! - A rising edge on CR.EN latches NDT. The latch restores NDT when a
//!   circular stream wraps.
//! - Peripheral-to/from-memory streams move exactly one peripheral-sized
//!   item per request-pin pulse; memory-to-memory streams burst the whole
//!   block on enable, gated on a pending request.
//! - The finished bits sit at the hardware's non-contiguous positions
//!   (5/11/21/27 within each status half) and are write-1-to-clear;
//!   clearing also de-asserts the stream's IRQ line.
//! - IRQ edges are raised at the next synchronization point, never inside
//!   the access that completed the transfer.
//!
//! Concurrency: one mutex covers the register bank, the stream state and
//! the finished bits. Request pins lock it too, so pulses from other
//! emulated components serialize against bus accesses. Bus copies are
//! issued while the lock is held -- transfers target memory, not this
//! controller's own registers.

mod stream;

pub use stream::{Direction, Stream, TransferSize};

use std::sync::{Arc, Mutex, Weak};

use emu_api::{IrqSink, MachineContext, MmioPeripheral, OutputLine};
use regbank::{Access, Field, Register, RegisterBank};
use stream::{AddressReg, DmaState};

pub const STREAM_COUNT: usize = 8;

/// Register map.
const LISR: u64 = 0x00;
const HISR: u64 = 0x04;
const LIFCR: u64 = 0x08;
const HIFCR: u64 = 0x0C;
const STREAM_BASE: u64 = 0x10;
const STREAM_STRIDE: u64 = 0x18;

/// Bit position of a stream's transfer-complete flag within its status
/// half. The hardware interleaves other event flags, hence the gaps.
const TCIF_BIT: [u32; 4] = [5, 11, 21, 27];

const TCIF_NAMES: [&str; 8] = [
    "TCIF0", "TCIF1", "TCIF2", "TCIF3", "TCIF4", "TCIF5", "TCIF6", "TCIF7",
];
const CTCIF_NAMES: [&str; 8] = [
    "CTCIF0", "CTCIF1", "CTCIF2", "CTCIF3", "CTCIF4", "CTCIF5", "CTCIF6", "CTCIF7",
];
const CR_NAMES: [&str; 8] = [
    "S0CR", "S1CR", "S2CR", "S3CR", "S4CR", "S5CR", "S6CR", "S7CR",
];
const NDTR_NAMES: [&str; 8] = [
    "S0NDTR", "S1NDTR", "S2NDTR", "S3NDTR", "S4NDTR", "S5NDTR", "S6NDTR", "S7NDTR",
];
const PAR_NAMES: [&str; 8] = [
    "S0PAR", "S1PAR", "S2PAR", "S3PAR", "S4PAR", "S5PAR", "S6PAR", "S7PAR",
];
const M0AR_NAMES: [&str; 8] = [
    "S0M0AR", "S1M0AR", "S2M0AR", "S3M0AR", "S4M0AR", "S5M0AR", "S6M0AR", "S7M0AR",
];
const M1AR_NAMES: [&str; 8] = [
    "S0M1AR", "S1M1AR", "S2M1AR", "S3M1AR", "S4M1AR", "S5M1AR", "S6M1AR", "S7M1AR",
];
const FCR_NAMES: [&str; 8] = [
    "S0FCR", "S1FCR", "S2FCR", "S3FCR", "S4FCR", "S5FCR", "S6FCR", "S7FCR",
];
const IRQ_NAMES: [&str; 8] = [
    "dma-stream0-irq",
    "dma-stream1-irq",
    "dma-stream2-irq",
    "dma-stream3-irq",
    "dma-stream4-irq",
    "dma-stream5-irq",
    "dma-stream6-irq",
    "dma-stream7-irq",
];

struct Inner {
    bank: RegisterBank<DmaState>,
    st: DmaState,
}

/// The DMA controller model.
pub struct StmDma {
    inner: Arc<Mutex<Inner>>,
    irqs: [Arc<OutputLine>; STREAM_COUNT],
}

impl StmDma {
    pub fn new(name: &'static str, ctx: MachineContext) -> Self {
        let irqs: [Arc<OutputLine>; STREAM_COUNT] =
            std::array::from_fn(|s| Arc::new(OutputLine::new(IRQ_NAMES[s])));
        let st = DmaState {
            name,
            streams: std::array::from_fn(|_| Stream::new()),
            ctx,
            irqs: irqs.clone(),
        };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                bank: build_bank(name),
                st,
            })),
            irqs,
        }
    }

    /// The stream's outgoing transfer-complete IRQ line.
    pub fn irq_line(&self, stream: usize) -> Arc<OutputLine> {
        self.irqs[stream].clone()
    }

    /// Drives a stream's peripheral request input directly.
    pub fn set_request(&self, stream: usize, level: bool) {
        if stream >= STREAM_COUNT {
            log::warn!("dma: request for nonexistent stream {stream}");
            return;
        }
        self.inner.lock().unwrap().st.set_request(stream, level);
    }

    /// A sink view of a stream's request input, for wiring a peripheral's
    /// DMA request output line straight into the controller.
    pub fn request_pin(&self, stream: usize) -> Arc<dyn IrqSink> {
        Arc::new(RequestPin {
            inner: Arc::downgrade(&self.inner),
            stream,
        })
    }
}

struct RequestPin {
    inner: Weak<Mutex<Inner>>,
    stream: usize,
}

impl IrqSink for RequestPin {
    fn set_level(&self, level: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().unwrap().st.set_request(self.stream, level);
        }
    }
}

impl MmioPeripheral for StmDma {
    fn read_u32(&self, offset: u64) -> u32 {
        let mut guard = self.inner.lock().unwrap();
        let Inner { bank, st } = &mut *guard;
        bank.read(st, offset)
    }

    fn write_u32(&self, offset: u64, value: u32) {
        let mut guard = self.inner.lock().unwrap();
        let Inner { bank, st } = &mut *guard;
        bank.write(st, offset, value);
    }

    fn reset(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.bank.reset();
        guard.st.reset();
    }

    fn size(&self) -> u64 {
        0x400
    }
}

fn build_bank(name: &'static str) -> RegisterBank<DmaState> {
    let mut bank = RegisterBank::new(name);

    for (reg_offset, first) in [(LISR, 0), (HISR, 4)] {
        let mut reg = Register::new(reg_offset, if first == 0 { "LISR" } else { "HISR" });
        for i in 0..4 {
            let s = first + i;
            reg = reg.field(
                Field::flag(TCIF_NAMES[s], TCIF_BIT[i])
                    .access(Access::Read)
                    .on_read(move |st: &mut DmaState| st.streams[s].finished as u32),
            );
        }
        bank = bank.register(reg);
    }

    for (reg_offset, first) in [(LIFCR, 0), (HIFCR, 4)] {
        let mut reg = Register::new(reg_offset, if first == 0 { "LIFCR" } else { "HIFCR" });
        for i in 0..4 {
            let s = first + i;
            reg = reg.field(
                Field::flag(CTCIF_NAMES[s], TCIF_BIT[i])
                    .access(Access::Write)
                    .on_write(move |st: &mut DmaState, _old, new| {
                        if new == 1 {
                            st.clear_finished(s);
                        }
                    }),
            );
        }
        bank = bank.register(reg);
    }

    for s in 0..STREAM_COUNT {
        let base = STREAM_BASE + STREAM_STRIDE * s as u64;

        // EN is declared last so its edge handler observes the direction,
        // sizes and flags written in the same access.
        bank = bank.register(
            Register::new(base, CR_NAMES[s])
                .field(
                    Field::flag("TCIE", 4)
                        .on_write(move |st: &mut DmaState, _, new| st.streams[s].tcie = new != 0),
                )
                .field(
                    Field::enumerated("DIR", 6, 2)
                        .on_write(move |st: &mut DmaState, _, new| st.set_direction(s, new)),
                )
                .field(
                    Field::flag("CIRC", 8)
                        .on_write(move |st: &mut DmaState, _, new| {
                            st.streams[s].circular = new != 0
                        }),
                )
                .field(
                    Field::flag("PINC", 9)
                        .on_write(move |st: &mut DmaState, _, new| st.streams[s].pinc = new != 0),
                )
                .field(
                    Field::flag("MINC", 10)
                        .on_write(move |st: &mut DmaState, _, new| st.streams[s].minc = new != 0),
                )
                .field(
                    Field::enumerated("PSIZE", 11, 2)
                        .on_write(move |st: &mut DmaState, _, new| st.set_size(s, false, new)),
                )
                .field(
                    Field::enumerated("MSIZE", 13, 2)
                        .on_write(move |st: &mut DmaState, _, new| st.set_size(s, true, new)),
                )
                .field(
                    Field::flag("EN", 0)
                        .on_read(move |st: &mut DmaState| st.streams[s].enabled as u32)
                        .on_write(move |st: &mut DmaState, _, new| st.write_enable(s, new != 0)),
                ),
        );

        bank = bank.register(
            Register::new(base + 0x04, NDTR_NAMES[s]).field(
                Field::value("NDT", 0, 16)
                    .on_read(move |st: &mut DmaState| u32::from(st.streams[s].ndt))
                    .on_write(move |st: &mut DmaState, _, new| st.write_ndt(s, new as u16)),
            ),
        );

        bank = bank.register(
            Register::new(base + 0x08, PAR_NAMES[s]).field(
                Field::value("PA", 0, 32)
                    .on_read(move |st: &mut DmaState| st.streams[s].par)
                    .on_write(move |st: &mut DmaState, _, new| {
                        st.write_address(s, AddressReg::Par, new)
                    }),
            ),
        );

        bank = bank.register(
            Register::new(base + 0x0C, M0AR_NAMES[s]).field(
                Field::value("M0A", 0, 32)
                    .on_read(move |st: &mut DmaState| st.streams[s].m0ar)
                    .on_write(move |st: &mut DmaState, _, new| {
                        st.write_address(s, AddressReg::M0ar, new)
                    }),
            ),
        );

        bank = bank.register(
            Register::new(base + 0x10, M1AR_NAMES[s]).field(
                Field::value("M1A", 0, 32)
                    .on_read(move |st: &mut DmaState| st.streams[s].m1ar)
                    .on_write(move |st: &mut DmaState, _, new| {
                        st.write_address(s, AddressReg::M1ar, new)
                    }),
            ),
        );

        // FIFO control is register-visible only: no FIFO is modeled, but
        // software can park its configuration here. FS is the hardware's
        // read-only fill status, frozen at its reset encoding.
        bank = bank.register(
            Register::new(base + 0x14, FCR_NAMES[s])
                .field(Field::value("FTH", 0, 2).reset(1))
                .field(Field::flag("DMDIS", 2))
                .field(Field::value("FS", 3, 3).access(Access::Read).reset(4))
                .field(Field::flag("FEIE", 7)),
        );
    }

    bank
}
