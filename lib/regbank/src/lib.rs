// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A data-driven register bank for emulated peripherals.
//!
//! A peripheral's software-visible register file is described once, as a
//! table: each [`Register`] sits at a word-aligned offset and is composed
//! of disjoint bit [`Field`]s carrying a width, position, access kind,
//! reset value and optional callbacks. One generic dispatcher
//! ([`RegisterBank::read`] / [`RegisterBank::write`]) then replaces the
//! per-register `match` arms that peripheral models otherwise accumulate.
//!
//! Callbacks receive `&mut P`, the peripheral state the bank was built
//! for, so a single field definition can close over anything it needs
//! (typically a stream or channel index) while the state itself stays a
//! plain struct.
//!
//! Field semantics:
//!
//! - the *read* callback overrides the stored bits when the field is read;
//! - the *write* callback observes every write access, receiving the old
//!   and new field values;
//! - the *change* callback fires only when a write actually changed the
//!   field;
//! - [`Access::ReadToClear`] fields clear their stored bits after
//!   contributing to a read;
//! - [`Access::WriteZeroToClear`] fields can only be cleared by software
//!   (writing 1 preserves, writing 0 clears), never set;
//! - fields tagged unimplemented log traffic and otherwise behave as
//!   storage.
//!
//! Malformed tables -- overlapping fields, fields past bit 31, misaligned
//! or duplicate offsets -- are construction-time panics: a bad table is a
//! configuration error, not a runtime condition.

use std::collections::BTreeMap;

/// How software may access a field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    /// Read-only; writes are ignored.
    Read,
    /// Write-only; reads return zero (the stored value is still kept and
    /// visible through [`RegisterBank::peek`]).
    Write,
    ReadWrite,
    /// Read-only, and reading clears the stored bits.
    ReadToClear,
    /// Readable; writing 0 clears the stored bits, writing 1 leaves them.
    WriteZeroToClear,
}

pub type ReadFn<P> = Box<dyn Fn(&mut P) -> u32 + Send>;
pub type WriteFn<P> = Box<dyn Fn(&mut P, u32, u32) + Send>;
pub type HookFn<P> = Box<dyn Fn(&mut P) + Send>;

/// One bit-field of a register.
pub struct Field<P> {
    name: &'static str,
    position: u32,
    width: u32,
    access: Access,
    reset: u32,
    read: Option<ReadFn<P>>,
    write: Option<WriteFn<P>>,
    changed: Option<WriteFn<P>>,
    unimplemented: bool,
}

impl<P> Field<P> {
    fn new(name: &'static str, position: u32, width: u32) -> Self {
        assert!(width >= 1, "field {name}: zero width");
        assert!(
            position + width <= 32,
            "field {name}: bits {position}+{width} exceed the register"
        );
        Self {
            name,
            position,
            width,
            access: Access::ReadWrite,
            reset: 0,
            read: None,
            write: None,
            changed: None,
            unimplemented: false,
        }
    }

    /// A single-bit field.
    pub fn flag(name: &'static str, position: u32) -> Self {
        Self::new(name, position, 1)
    }

    /// A multi-bit numeric field.
    pub fn value(name: &'static str, position: u32, width: u32) -> Self {
        Self::new(name, position, width)
    }

    /// A multi-bit field whose raw value encodes an enumeration; the
    /// decode (and any reserved-encoding policy) lives in the callbacks.
    pub fn enumerated(name: &'static str, position: u32, width: u32) -> Self {
        Self::new(name, position, width)
    }

    /// A reserved span: reads as its reset value, ignores writes.
    pub fn reserved(position: u32, width: u32) -> Self {
        Self::new("reserved", position, width).access(Access::Read)
    }

    /// A field the hardware defines but this model does not implement.
    /// Traffic is logged at debug level; the bits behave as plain storage.
    pub fn tagged(name: &'static str, position: u32, width: u32) -> Self {
        let mut f = Self::new(name, position, width);
        f.unimplemented = true;
        f
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn reset(mut self, reset: u32) -> Self {
        assert!(
            (reset & !Self::value_mask(self.width)) == 0,
            "field {}: reset value {reset:#x} wider than the field",
            self.name
        );
        self.reset = reset;
        self
    }

    pub fn on_read(mut self, f: impl Fn(&mut P) -> u32 + Send + 'static) -> Self {
        self.read = Some(Box::new(f));
        self
    }

    pub fn on_write(mut self, f: impl Fn(&mut P, u32, u32) + Send + 'static) -> Self {
        self.write = Some(Box::new(f));
        self
    }

    pub fn on_change(mut self, f: impl Fn(&mut P, u32, u32) + Send + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    fn value_mask(width: u32) -> u32 {
        if width == 32 {
            u32::MAX
        } else {
            (1 << width) - 1
        }
    }

    fn mask(&self) -> u32 {
        Self::value_mask(self.width) << self.position
    }

    fn extract(&self, word: u32) -> u32 {
        (word >> self.position) & Self::value_mask(self.width)
    }
}

/// A 32-bit register: an offset, a name and its fields.
pub struct Register<P> {
    name: &'static str,
    offset: u64,
    fields: Vec<Field<P>>,
    after_read: Option<HookFn<P>>,
}

impl<P> Register<P> {
    pub fn new(offset: u64, name: &'static str) -> Self {
        Self {
            name,
            offset,
            fields: Vec::new(),
            after_read: None,
        }
    }

    /// Adds a field; write callbacks run in the order fields are added,
    /// which lets a table put order-sensitive fields (an enable bit that
    /// must observe its siblings) last.
    pub fn field(mut self, field: Field<P>) -> Self {
        let overlap = self
            .fields
            .iter()
            .find(|f| (f.mask() & field.mask()) != 0);
        if let Some(other) = overlap {
            panic!(
                "register {}: field {} overlaps {}",
                self.name, field.name, other.name
            );
        }
        self.fields.push(field);
        self
    }

    /// Hook run after every read of this register, once the value has
    /// been assembled. Read-sensitive hardware (status registers whose
    /// read order drives a state machine) hangs its transitions here.
    pub fn after_read(mut self, f: impl Fn(&mut P) + Send + 'static) -> Self {
        self.after_read = Some(Box::new(f));
        self
    }

    fn reset_value(&self) -> u32 {
        self.fields
            .iter()
            .fold(0, |word, f| word | (f.reset << f.position))
    }
}

struct Slot<P> {
    def: Register<P>,
    value: u32,
}

/// The register bank: a table of [`Register`]s plus their stored values,
/// with one dispatcher for reads and one for writes.
pub struct RegisterBank<P> {
    name: &'static str,
    regs: BTreeMap<u64, Slot<P>>,
}

impl<P> RegisterBank<P> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            regs: BTreeMap::new(),
        }
    }

    pub fn register(mut self, def: Register<P>) -> Self {
        assert!(
            def.offset % 4 == 0,
            "bank {}: register {} at unaligned offset {:#x}",
            self.name,
            def.name,
            def.offset
        );
        let value = def.reset_value();
        let offset = def.offset;
        let prev = self.regs.insert(offset, Slot { def, value });
        if let Some(prev) = prev {
            panic!(
                "bank {}: offset {offset:#x} defined twice ({})",
                self.name, prev.def.name
            );
        }
        self
    }

    /// Dispatches a 32-bit read. Unhandled offsets log and return zero.
    pub fn read(&mut self, owner: &mut P, offset: u64) -> u32 {
        let Some(slot) = self.regs.get_mut(&offset) else {
            log::warn!("{}: unhandled read at offset {offset:#x}", self.name);
            return 0;
        };

        let mut word = 0;
        let mut clear = 0;
        for f in &slot.def.fields {
            if f.access == Access::Write {
                continue;
            }
            let bits = match &f.read {
                Some(cb) => cb(owner) & Field::<P>::value_mask(f.width),
                None => f.extract(slot.value),
            };
            word |= bits << f.position;
            if f.access == Access::ReadToClear {
                clear |= f.mask();
            }
        }
        slot.value &= !clear;

        if let Some(hook) = &slot.def.after_read {
            hook(owner);
        }
        word
    }

    /// Dispatches a 32-bit write. Unhandled offsets log and drop the
    /// value.
    pub fn write(&mut self, owner: &mut P, offset: u64, value: u32) {
        let Some(slot) = self.regs.get_mut(&offset) else {
            log::warn!(
                "{}: unhandled write of {value:#010x} at offset {offset:#x}",
                self.name
            );
            return;
        };

        for f in &slot.def.fields {
            let old = f.extract(slot.value);
            let incoming = f.extract(value);
            let new = match f.access {
                Access::Read | Access::ReadToClear => old,
                Access::Write | Access::ReadWrite => incoming,
                Access::WriteZeroToClear => old & incoming,
            };
            if f.unimplemented && incoming != old {
                log::debug!(
                    "{}: write to unimplemented field {}.{} ({old:#x} -> {incoming:#x})",
                    self.name,
                    slot.def.name,
                    f.name
                );
            }
            slot.value = (slot.value & !f.mask()) | (new << f.position);
            if let Some(cb) = &f.write {
                cb(owner, old, new);
            }
            if old != new {
                if let Some(cb) = &f.changed {
                    cb(owner, old, new);
                }
            }
        }
    }

    /// The stored value at `offset`, without side effects. Zero for
    /// unhandled offsets.
    pub fn peek(&self, offset: u64) -> u32 {
        self.regs.get(&offset).map(|s| s.value).unwrap_or(0)
    }

    /// Restores every register's stored value to its declared reset.
    /// State held outside the bank is the peripheral's business.
    pub fn reset(&mut self) {
        for slot in self.regs.values_mut() {
            slot.value = slot.def.reset_value();
        }
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.regs.contains_key(&offset)
    }
}
