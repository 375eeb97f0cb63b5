// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces between emulated peripheral models and the machine that owns
//! them.
//!
//! The peripheral models in this workspace (DMA, I2C) are deliberately
//! ignorant of the machine they are plugged into: the bus fabric, the
//! virtual-time source and the interrupt controller are all external
//! collaborators. This crate defines the seams those collaborators are
//! reached through:
//!
//! - [`SystemBus`] -- byte-level access to the machine's address space plus
//!   the memory-copy engine DMA transfers are issued against.
//! - [`SyncScheduler`] -- deferral of work (IRQ edges, slave-batch
//!   transfers) to the next virtual-time synchronization point, so that it
//!   never executes inside the register access that caused it.
//! - [`IrqSink`] / [`OutputLine`] -- level-based GPIO-style lines.
//! - [`MmioPeripheral`] -- the 32-bit register plane, with default
//!   widening of byte and half-word accesses.
//!
//! Everything a peripheral needs from its machine travels in a
//! [`MachineContext`]; there is no process-wide state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Access to the owning machine's address space.
///
/// Implementations must tolerate out-of-range accesses: the register plane
/// never propagates errors, so a bad DMA address is logged by the bus and
/// reads back as zero rather than failing the emulated access.
pub trait SystemBus: Send + Sync {
    /// Reads `dest.len()` bytes starting at `addr`.
    fn read(&self, addr: u64, dest: &mut [u8]);

    /// Writes `src` starting at `addr`.
    fn write(&self, addr: u64, src: &[u8]);

    /// The memory-copy engine: moves `len` bytes from `src` to `dst`.
    ///
    /// The default implementation stages through a buffer, which gives
    /// overlapping ranges memmove semantics. Fabrics with a real copy
    /// engine can override it.
    fn copy(&self, src: u64, dst: u64, len: usize) {
        let mut staging = vec![0u8; len];
        self.read(src, &mut staging);
        self.write(dst, &staging);
    }
}

/// A deferred unit of work.
pub type SyncJob = Box<dyn FnOnce() + Send>;

/// Deferral of work to the next virtual-time synchronization point.
///
/// Peripheral models must not raise IRQ edges or call into other devices
/// from inside the register access that triggered them; doing so would
/// deliver interrupts re-entrantly, in the middle of the originating bus
/// transaction. Anything with that shape is queued here instead and runs
/// when the machine next reaches a synced state.
///
/// Jobs are required to run *outside* any register access. An
/// implementation must therefore never execute a job inline from within
/// `execute_in_nearest_synced_state` -- the queued jobs take locks that the
/// caller may still hold.
pub trait SyncScheduler: Send + Sync {
    fn execute_in_nearest_synced_state(&self, job: SyncJob);
}

/// The queue-backed [`SyncScheduler`].
///
/// Machine glue drains it with [`SyncQueue::run`] at every synchronization
/// point. A job scheduled while `run` is draining lands in the *next*
/// batch, which keeps "nearest synced state" meaningful even for jobs that
/// reschedule themselves.
#[derive(Default)]
pub struct SyncQueue {
    jobs: Mutex<VecDeque<SyncJob>>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every job that was pending when the call was made, returning
    /// how many ran.
    pub fn run(&self) -> usize {
        let batch: Vec<SyncJob> = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.drain(..).collect()
        };
        let count = batch.len();
        for job in batch {
            job();
        }
        count
    }

    /// Number of jobs waiting for the next synchronization point.
    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

impl SyncScheduler for SyncQueue {
    fn execute_in_nearest_synced_state(&self, job: SyncJob) {
        self.jobs.lock().unwrap().push_back(job);
    }
}

/// Receiving end of a GPIO-style line: an interrupt controller input, a
/// DMA request pin, or a test probe.
pub trait IrqSink: Send + Sync {
    fn set_level(&self, level: bool);
}

/// An outgoing level-based line owned by a peripheral.
///
/// The line remembers its level and forwards *changes* to the connected
/// sink, so receivers observe clean transitions; connecting a sink
/// propagates the current level to it. An unconnected line just tracks its
/// level, which keeps peripherals usable before the machine is fully wired.
pub struct OutputLine {
    name: &'static str,
    level: AtomicBool,
    sink: Mutex<Option<Arc<dyn IrqSink>>>,
}

impl OutputLine {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            level: AtomicBool::new(false),
            sink: Mutex::new(None),
        }
    }

    /// Connects `sink` and propagates the line's current level to it.
    pub fn connect(&self, sink: Arc<dyn IrqSink>) {
        sink.set_level(self.level.load(Ordering::SeqCst));
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Drives the line. Repeated sets to the same level are not forwarded.
    pub fn set(&self, level: bool) {
        let prev = self.level.swap(level, Ordering::SeqCst);
        if prev == level {
            return;
        }
        if let Some(sink) = &*self.sink.lock().unwrap() {
            sink.set_level(level);
        }
    }

    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputLine")
            .field("name", &self.name)
            .field("level", &self.level())
            .finish()
    }
}

/// An [`IrqSink`] that records what was driven into it. This is what
/// machine glue and tests hang off peripheral output lines when they only
/// need to observe.
#[derive(Default)]
pub struct LineProbe {
    level: AtomicBool,
    rises: AtomicUsize,
}

impl LineProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    /// Number of low-to-high transitions observed.
    pub fn rises(&self) -> usize {
        self.rises.load(Ordering::SeqCst)
    }
}

impl IrqSink for LineProbe {
    fn set_level(&self, level: bool) {
        let prev = self.level.swap(level, Ordering::SeqCst);
        if level && !prev {
            self.rises.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A memory-mapped peripheral's register plane.
///
/// Registers are 32 bits wide at word-aligned offsets. The default
/// byte/half-word methods implement the standard widening: sub-word reads
/// project out of the aligned word, sub-word writes read-modify-write it.
/// Peripherals whose registers are read-sensitive (the I2C data register,
/// for one) override the write paths to avoid the hidden read.
pub trait MmioPeripheral: Send + Sync {
    fn read_u32(&self, offset: u64) -> u32;

    fn write_u32(&self, offset: u64, value: u32);

    /// Restores every register to its declared reset value.
    fn reset(&self);

    /// Size of the mapped region in bytes.
    fn size(&self) -> u64;

    fn read_u8(&self, offset: u64) -> u8 {
        let word = self.read_u32(offset & !3);
        (word >> ((offset & 3) * 8)) as u8
    }

    fn read_u16(&self, offset: u64) -> u16 {
        let word = self.read_u32(offset & !3);
        (word >> ((offset & 2) * 8)) as u16
    }

    fn write_u8(&self, offset: u64, value: u8) {
        let aligned = offset & !3;
        let shift = (offset & 3) * 8;
        let word = self.read_u32(aligned);
        let word = (word & !(0xFF << shift)) | (u32::from(value) << shift);
        self.write_u32(aligned, word);
    }

    fn write_u16(&self, offset: u64, value: u16) {
        let aligned = offset & !3;
        let shift = (offset & 2) * 8;
        let word = self.read_u32(aligned);
        let word = (word & !(0xFFFF << shift)) | (u32::from(value) << shift);
        self.write_u32(aligned, word);
    }
}

/// Flat RAM, mapped at a base address.
///
/// Backs memory-to-memory DMA and tests; a full machine would put its bus
/// fabric here instead. Accesses that fall outside the array are logged
/// and read back as zero.
pub struct Ram {
    base: u64,
    cells: Mutex<Vec<u8>>,
}

impl Ram {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            cells: Mutex::new(vec![0; size]),
        }
    }

    /// Copies `data` into RAM starting at absolute address `addr`.
    pub fn load(&self, addr: u64, data: &[u8]) {
        self.write(addr, data);
    }

    /// Returns `len` bytes starting at absolute address `addr`.
    pub fn snapshot(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.read(addr, &mut out);
        out
    }

    fn offset_of(&self, addr: u64, len: usize, cells: &[u8]) -> Option<usize> {
        let off = addr.checked_sub(self.base)? as usize;
        if off.checked_add(len)? <= cells.len() {
            Some(off)
        } else {
            None
        }
    }
}

impl SystemBus for Ram {
    fn read(&self, addr: u64, dest: &mut [u8]) {
        let cells = self.cells.lock().unwrap();
        match self.offset_of(addr, dest.len(), &cells) {
            Some(off) => dest.copy_from_slice(&cells[off..off + dest.len()]),
            None => {
                log::warn!(
                    "ram: read of {} bytes at {:#010x} out of range",
                    dest.len(),
                    addr
                );
                dest.fill(0);
            }
        }
    }

    fn write(&self, addr: u64, src: &[u8]) {
        let mut cells = self.cells.lock().unwrap();
        match self.offset_of(addr, src.len(), &cells) {
            Some(off) => cells[off..off + src.len()].copy_from_slice(src),
            None => log::warn!(
                "ram: write of {} bytes at {:#010x} out of range, dropped",
                src.len(),
                addr
            ),
        }
    }
}

/// The handles a peripheral needs from the machine that owns it.
#[derive(Clone)]
pub struct MachineContext {
    pub bus: Arc<dyn SystemBus>,
    pub sync: Arc<dyn SyncScheduler>,
}

impl MachineContext {
    pub fn new(bus: Arc<dyn SystemBus>, sync: Arc<dyn SyncScheduler>) -> Self {
        Self { bus, sync }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_line_forwards_changes_only() {
        let line = OutputLine::new("test");
        let probe = Arc::new(LineProbe::new());
        line.connect(probe.clone());

        line.set(true);
        line.set(true);
        line.set(false);
        line.set(true);

        assert_eq!(probe.rises(), 2);
        assert!(probe.level());
    }

    #[test]
    fn output_line_propagates_level_on_connect() {
        let line = OutputLine::new("test");
        line.set(true);

        let probe = Arc::new(LineProbe::new());
        line.connect(probe.clone());
        assert!(probe.level());
        assert_eq!(probe.rises(), 1);
    }

    #[test]
    fn sync_queue_defers_jobs_scheduled_during_run() {
        let queue = Arc::new(SyncQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let q2 = queue.clone();
        let h2 = hits.clone();
        queue.execute_in_nearest_synced_state(Box::new(move || {
            h2.fetch_add(1, Ordering::SeqCst);
            let h3 = h2.clone();
            q2.execute_in_nearest_synced_state(Box::new(move || {
                h3.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(queue.run(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.run(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ram_round_trip_and_copy() {
        let ram = Ram::new(0x2000_0000, 64);
        ram.load(0x2000_0000, &[1, 2, 3, 4]);
        ram.copy(0x2000_0000, 0x2000_0010, 4);
        assert_eq!(ram.snapshot(0x2000_0010, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn ram_out_of_range_reads_zero() {
        let ram = Ram::new(0x2000_0000, 16);
        let mut buf = [0xAA; 4];
        ram.read(0x2000_0010, &mut buf);
        assert_eq!(buf, [0; 4]);
        // A write below the base must not wrap around.
        ram.write(0x1FFF_FFFF, &[0xEE]);
        assert_eq!(ram.snapshot(0x2000_0000, 1), vec![0]);
    }

    struct WordReg {
        word: Mutex<u32>,
    }

    impl MmioPeripheral for WordReg {
        fn read_u32(&self, _offset: u64) -> u32 {
            *self.word.lock().unwrap()
        }
        fn write_u32(&self, _offset: u64, value: u32) {
            *self.word.lock().unwrap() = value;
        }
        fn reset(&self) {
            *self.word.lock().unwrap() = 0;
        }
        fn size(&self) -> u64 {
            4
        }
    }

    #[test]
    fn default_widening() {
        let reg = WordReg {
            word: Mutex::new(0x1122_3344),
        };
        assert_eq!(reg.read_u8(0), 0x44);
        assert_eq!(reg.read_u8(3), 0x11);
        assert_eq!(reg.read_u16(2), 0x1122);

        reg.write_u8(1, 0xAB);
        assert_eq!(reg.read_u32(0), 0x1122_AB44);
        reg.write_u16(2, 0xCDEF);
        assert_eq!(reg.read_u32(0), 0xCDEF_AB44);
    }
}
