//! Building safepoint tables.
//!
//! Every call and allocation site gets one row, keyed by the return address offset, saying which
//! spill slots (and, for register-saving safepoints, which registers) hold tagged pointers. The
//! finished table is appended to the code and read back by [lsmp].

use byteorder::{LittleEndian, WriteBytesExt};
use lsmp::{
    ENTRY_SIZE, FLAG_HAS_DOUBLES, FLAG_HAS_REGISTERS, HEADER_SIZE, NO_DEOPT_INDEX,
    NUM_SAFEPOINT_REGISTERS, SAFEPOINT_TABLE_VERSION,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SafepointKind {
    Simple,
    /// All allocatable registers were pushed, so registers may hold pointers.
    WithRegisters,
    WithRegistersAndDoubles,
}

impl SafepointKind {
    pub fn has_registers(self) -> bool {
        self != Self::Simple
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeoptMode {
    NoLazyDeopt,
    LazyDeopt,
}

#[derive(Debug)]
struct Entry {
    pc: u32,
    deopt_index: u32,
    arguments: u16,
    kind: SafepointKind,
    registers: Vec<u8>,
    slots: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct SafepointTableBuilder {
    entries: Vec<Entry>,
    /// The first entry that a following lazy deoptimisation index applies to.
    last_lazy_safepoint: usize,
}

impl SafepointTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a safepoint at `pc`. `slots` are spill slot indices and `registers` x64 register
    /// codes holding pointers. A second safepoint at the same `pc` is merged into the first.
    ///
    /// # Panics
    ///
    /// If `registers` is non-empty for a [SafepointKind::Simple] safepoint, or `pc` is lower than
    /// that of an earlier safepoint.
    pub fn define_safepoint(
        &mut self,
        pc: usize,
        kind: SafepointKind,
        arguments: usize,
        mode: DeoptMode,
        slots: &[i32],
        registers: &[u8],
    ) {
        assert!(kind.has_registers() || registers.is_empty());
        let pc = u32::try_from(pc).unwrap();
        if self.entries.last().is_some_and(|e| e.pc == pc) {
            let e = self.entries.last_mut().unwrap();
            if e.kind == SafepointKind::Simple {
                e.kind = kind;
            }
        } else {
            assert!(self.entries.last().is_none_or(|e| e.pc < pc));
            self.entries.push(Entry {
                pc,
                deopt_index: NO_DEOPT_INDEX,
                arguments: u16::try_from(arguments).unwrap(),
                kind,
                registers: Vec::new(),
                slots: Vec::new(),
            });
        }
        if mode == DeoptMode::NoLazyDeopt {
            self.last_lazy_safepoint = self.entries.len();
        }
        let e = self.entries.last_mut().unwrap();
        // Incoming parameters (negative slots) are always scanned by the collector.
        for s in slots.iter().filter(|x| **x >= 0) {
            let s = u32::try_from(*s).unwrap();
            if !e.slots.contains(&s) {
                e.slots.push(s);
            }
        }
        for r in registers {
            if !e.registers.contains(r) {
                e.registers.push(*r);
            }
        }
    }

    /// Attach deoptimisation index `idx` to every safepoint since the last non-lazy one.
    pub fn record_lazy_deoptimization_index(&mut self, idx: usize) {
        let idx = u32::try_from(idx).unwrap();
        while self.last_lazy_safepoint < self.entries.len() {
            self.entries[self.last_lazy_safepoint].deopt_index = idx;
            self.last_lazy_safepoint += 1;
        }
    }

    pub fn bump_last_lazy_safepoint_index(&mut self) {
        self.last_lazy_safepoint = self.entries.len();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialise the table onto `buf` for a frame of `slot_count` spill slots.
    pub fn emit(&self, buf: &mut Vec<u8>, slot_count: usize) {
        let bits = NUM_SAFEPOINT_REGISTERS + slot_count;
        let bytes_per_entry = bits.div_ceil(8);
        buf.reserve(HEADER_SIZE + self.entries.len() * (ENTRY_SIZE + bytes_per_entry));

        // The writes below are into a `Vec` and can't fail.
        buf.push(SAFEPOINT_TABLE_VERSION);
        buf.push(0);
        buf.write_u16::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(u32::try_from(self.entries.len()).unwrap())
            .unwrap();
        buf.write_u32::<LittleEndian>(u32::try_from(bytes_per_entry).unwrap())
            .unwrap();
        for e in &self.entries {
            buf.write_u32::<LittleEndian>(e.pc).unwrap();
            buf.write_u32::<LittleEndian>(e.deopt_index).unwrap();
            buf.write_u16::<LittleEndian>(e.arguments).unwrap();
            let flags = match e.kind {
                SafepointKind::Simple => 0,
                SafepointKind::WithRegisters => FLAG_HAS_REGISTERS,
                SafepointKind::WithRegistersAndDoubles => FLAG_HAS_REGISTERS | FLAG_HAS_DOUBLES,
            };
            buf.push(flags);
            buf.push(0);
        }
        for e in &self.entries {
            let mut bitmap = vec![0u8; bytes_per_entry];
            for r in &e.registers {
                let r = usize::from(*r);
                bitmap[r / 8] |= 1 << (r % 8);
            }
            for s in &e.slots {
                let s = usize::try_from(*s).unwrap();
                assert!(s < slot_count);
                let b = NUM_SAFEPOINT_REGISTERS + s;
                bitmap[b / 8] |= 1 << (b % 8);
            }
            buf.extend(bitmap);
        }
    }
}
