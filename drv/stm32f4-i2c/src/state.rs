// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller's observable state machine.
//!
//! One private [`Phase`] enum drives everything software can see: the
//! SR1/SR2 status flags are pure derivations of the phase, the transfer
//! direction and the queue occupancy, computed at read time. That keeps
//! the wire contract testable on its own -- there is no shadow copy of a
//! flag to fall out of sync.
//!
//! Two operations deliberately do *not* run inside the triggering register
//! access: pulling a batch from the addressed device (scheduled when SR2's
//! read enters the data phase, and again whenever the receive queue
//! drains) and flushing queued transmit bytes to the device. Both are
//! `SyncScheduler` jobs that re-enter the controller through a weak
//! handle, so a controller dropped with jobs in flight is simply skipped.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use emu_api::{OutputLine, SyncScheduler};

use crate::target::{I2cTarget, TargetAbort};
use crate::Inner;

/// Where the controller is in a transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// START issued; DR expects the address byte.
    AwaitingAddress,
    /// Address acknowledged; software must read SR1...
    AwaitingSr1Read,
    /// ...and then SR2 to clear ADDR and enter the data phase.
    AwaitingSr2Read,
    /// Write transaction: DR writes queue bytes for the device.
    AwaitingData,
    /// Read transaction: DR reads drain the receive queue.
    ReceivingData,
}

/// Transfer direction, from the R/W bit of the address byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Write,
    Read,
}

/// The controller's four outgoing lines.
pub struct Lines {
    pub event: Arc<OutputLine>,
    pub error: Arc<OutputLine>,
    pub dma_tx: Arc<OutputLine>,
    pub dma_rx: Arc<OutputLine>,
}

pub struct I2cState {
    pub name: &'static str,
    pub phase: Phase,
    pub direction: TransferDirection,
    pub selected: Option<u8>,
    pub targets: BTreeMap<u8, Box<dyn I2cTarget>>,
    pub tx: VecDeque<u8>,
    pub rx: VecDeque<u8>,
    /// Acknowledge failure: sticky until software writes it to zero.
    pub af: bool,

    // Control state mirrored out of CR2 writes; ACK and LAST stay plain
    // register storage, since per-byte acknowledge timing is not modeled.
    pub itevten: bool,
    pub itbufen: bool,
    pub iterren: bool,
    pub dmaen: bool,

    /// Set by a SWRST write; the wrapper resets the register bank once
    /// the access completes.
    pub swrst_pending: bool,

    pub lines: Lines,
    pub sync: Arc<dyn SyncScheduler>,
    /// Back-reference for deferred jobs; populated right after
    /// construction.
    pub shared: Weak<Mutex<Inner>>,
}

impl I2cState {
    // Derived status flags. Per the reference manual's read-order
    // contract, ADDR holds through the SR1 read and clears after SR2.

    pub fn sb(&self) -> bool {
        self.phase == Phase::AwaitingAddress
    }

    pub fn addr_flag(&self) -> bool {
        matches!(self.phase, Phase::AwaitingSr1Read | Phase::AwaitingSr2Read)
    }

    pub fn rxne(&self) -> bool {
        self.phase == Phase::ReceivingData && !self.rx.is_empty()
    }

    pub fn txe(&self) -> bool {
        (self.phase == Phase::AwaitingData && self.tx.is_empty())
            || (self.direction == TransferDirection::Write && self.addr_flag())
    }

    pub fn btf(&self) -> bool {
        match self.phase {
            Phase::AwaitingData | Phase::ReceivingData => match self.direction {
                TransferDirection::Read => self.rxne(),
                TransferDirection::Write => self.txe(),
            },
            _ => false,
        }
    }

    pub fn busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn msl(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn tra(&self) -> bool {
        self.busy() && self.direction == TransferDirection::Write
    }

    /// Recomputes the four output lines. Every state or queue mutation
    /// ends here; the lines are levels, so redundant recomputes are free.
    pub fn recompute_lines(&self) {
        let event = self.itevten
            && (self.sb()
                || self.addr_flag()
                || self.btf()
                || (self.itbufen && (self.txe() || self.rxne())));
        self.lines.event.set(event);
        self.lines.error.set(self.iterren && self.af);
        self.lines
            .dma_rx
            .set(self.dmaen && self.rxne() && self.phase == Phase::ReceivingData);
        self.lines
            .dma_tx
            .set(self.dmaen && self.txe() && self.phase == Phase::AwaitingData);
    }

    // Register-write entry points.

    pub fn on_start(&mut self) {
        match self.phase {
            Phase::Idle => self.phase = Phase::AwaitingAddress,
            Phase::AwaitingAddress => {}
            _ => {
                // Repeated start: the batch in flight is committed before
                // the new address phase begins.
                self.flush_tx();
                self.finish_with_target();
                self.tx.clear();
                self.rx.clear();
                self.phase = Phase::AwaitingAddress;
            }
        }
        self.recompute_lines();
    }

    pub fn on_stop(&mut self) {
        if self.phase != Phase::Idle {
            self.flush_tx();
            self.finish_with_target();
        }
        self.phase = Phase::Idle;
        self.selected = None;
        self.tx.clear();
        self.rx.clear();
        self.recompute_lines();
    }

    pub fn on_swrst(&mut self) {
        self.phase = Phase::Idle;
        self.direction = TransferDirection::Write;
        self.selected = None;
        self.tx.clear();
        self.rx.clear();
        self.af = false;
        self.itevten = false;
        self.itbufen = false;
        self.iterren = false;
        self.dmaen = false;
        self.swrst_pending = true;
        self.recompute_lines();
    }

    pub fn write_dr(&mut self, value: u32) {
        let byte = value as u8;
        match self.phase {
            Phase::AwaitingAddress => {
                let addr = byte >> 1;
                self.direction = if (byte & 1) != 0 {
                    TransferDirection::Read
                } else {
                    TransferDirection::Write
                };
                if self.targets.contains_key(&addr) {
                    self.selected = Some(addr);
                    self.phase = Phase::AwaitingSr1Read;
                } else {
                    log::warn!(
                        "{}: no device at address {addr:#04x}, acknowledge failure",
                        self.name
                    );
                    self.af = true;
                    self.selected = None;
                    self.phase = Phase::Idle;
                }
            }
            Phase::AwaitingData => {
                self.tx.push_back(byte);
                self.schedule(|st| {
                    st.flush_tx();
                    st.recompute_lines();
                });
            }
            _ => log::warn!(
                "{}: DR write of {byte:#04x} in unsupported state {:?}",
                self.name,
                self.phase
            ),
        }
        self.recompute_lines();
    }

    pub fn read_dr(&mut self) -> u32 {
        if self.phase != Phase::ReceivingData {
            log::warn!(
                "{}: DR read in state {:?} returns 0",
                self.name,
                self.phase
            );
            return 0;
        }
        let byte = self.rx.pop_front().unwrap_or_else(|| {
            log::warn!("{}: DR read with empty receive queue", self.name);
            0
        });
        if self.rx.is_empty() {
            // Drained: ask the device for the next batch at the next sync
            // point.
            self.schedule(I2cState::pull_from_target);
        }
        self.recompute_lines();
        u32::from(byte)
    }

    /// Any read of SR1 moves the address phase along.
    pub fn sr1_read_transition(&mut self) {
        if self.phase == Phase::AwaitingSr1Read {
            self.phase = Phase::AwaitingSr2Read;
            self.recompute_lines();
        }
    }

    /// Any read of SR2 after SR1 enters the data phase. For reads the
    /// first device batch is pulled here -- scheduled, not inline.
    pub fn sr2_read_transition(&mut self) {
        if self.phase != Phase::AwaitingSr2Read {
            return;
        }
        match self.direction {
            TransferDirection::Read => {
                self.phase = Phase::ReceivingData;
                self.schedule(I2cState::pull_from_target);
            }
            TransferDirection::Write => self.phase = Phase::AwaitingData,
        }
        self.recompute_lines();
    }

    pub fn clear_af(&mut self) {
        self.af = false;
        self.recompute_lines();
    }

    // Device traffic.

    pub fn pull_from_target(&mut self) {
        // The transaction may have ended before the sync point arrived.
        if self.phase != Phase::ReceivingData {
            return;
        }
        let Some(addr) = self.selected else { return };
        if let Some(target) = self.targets.get_mut(&addr) {
            match target.read() {
                Ok(batch) => self.rx.extend(batch),
                Err(abort) => self.abort_transaction(addr, abort),
            }
        }
        self.recompute_lines();
    }

    fn flush_tx(&mut self) {
        if self.tx.is_empty() {
            return;
        }
        let Some(addr) = self.selected else { return };
        let batch: Vec<u8> = self.tx.drain(..).collect();
        if let Some(target) = self.targets.get_mut(&addr) {
            if let Err(abort) = target.write(&batch) {
                self.abort_transaction(addr, abort);
            }
        }
    }

    fn finish_with_target(&mut self) {
        let Some(addr) = self.selected else { return };
        if let Some(target) = self.targets.get_mut(&addr) {
            if let Err(abort) = target.finish_transmission() {
                self.abort_transaction(addr, abort);
            }
        }
    }

    fn abort_transaction(&mut self, addr: u8, abort: TargetAbort) {
        log::error!(
            "{}: device {addr:#04x} aborted the transaction: {abort}",
            self.name
        );
        self.phase = Phase::Idle;
        self.selected = None;
        self.tx.clear();
        self.rx.clear();
        self.af = true;
        self.recompute_lines();
    }

    fn schedule(&self, f: impl FnOnce(&mut I2cState) + Send + 'static) {
        let shared = self.shared.clone();
        self.sync
            .execute_in_nearest_synced_state(Box::new(move || {
                if let Some(inner) = shared.upgrade() {
                    f(&mut inner.lock().unwrap().st);
                }
            }));
    }
}
