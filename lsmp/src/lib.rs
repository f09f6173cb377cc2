#![allow(clippy::new_without_default)]

//! A reader for the safepoint tables that the lithium backend appends to the code objects it
//! generates. A table tells the collector, for each call or allocation site, which stack slots
//! (and, for register-saving safepoints, which registers) hold tagged pointers.
//!
//! Layout (all integers little endian):
//!
//! ```text
//! u8  version (currently 1)
//! u8  reserved
//! u16 reserved
//! u32 entry count
//! u32 bitmap bytes per entry
//! entry count * { u32 pc, u32 deopt index, u16 arguments, u8 flags, u8 reserved }
//! entry count * bitmap
//! ```
//!
//! Each bitmap starts with [NUM_SAFEPOINT_REGISTERS] register bits (indexed by the x64 register
//! code), followed by one bit per stack slot.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// The only table version this reader understands.
pub const SAFEPOINT_TABLE_VERSION: u8 = 1;
/// The number of register bits at the start of each bitmap.
pub const NUM_SAFEPOINT_REGISTERS: usize = 16;
/// Marks an entry that has no associated lazy deoptimisation.
pub const NO_DEOPT_INDEX: u32 = u32::MAX;
/// The size in bytes of a fixed-width entry record.
pub const ENTRY_SIZE: usize = 12;
/// The size in bytes of the table header.
pub const HEADER_SIZE: usize = 12;

/// Flag bit: the safepoint saved all allocatable registers.
pub const FLAG_HAS_REGISTERS: u8 = 1;
/// Flag bit: the safepoint also saved double registers.
pub const FLAG_HAS_DOUBLES: u8 = 1 << 1;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Unsupported safepoint table version {0}")]
    Version(u8),
    #[error("Safepoint table truncated at offset {0}")]
    Truncated(usize),
    #[error("Safepoint table has unknown flags {0:#x} in entry {1}")]
    Flags(u8, usize),
}

/// One row of a safepoint table.
#[derive(Debug)]
pub struct SafepointEntry {
    pub pc: u32,
    /// The lazy deoptimisation index, if any.
    pub deopt_index: Option<u32>,
    /// The number of arguments pushed at this point.
    pub arguments: u16,
    pub has_doubles: bool,
    /// `None` if this safepoint didn't save registers.
    registers: Option<Vec<u16>>,
    slots: Vec<u32>,
}

impl SafepointEntry {
    pub fn has_registers(&self) -> bool {
        self.registers.is_some()
    }

    /// Does register `code` hold a pointer? Always false for safepoints which don't save
    /// registers.
    pub fn is_pointer_register(&self, code: u16) -> bool {
        self.registers.as_ref().is_some_and(|x| x.contains(&code))
    }

    pub fn pointer_registers(&self) -> &[u16] {
        self.registers.as_deref().unwrap_or(&[])
    }

    pub fn is_pointer_slot(&self, slot: u32) -> bool {
        self.slots.contains(&slot)
    }

    /// The stack slots holding pointers, in ascending order.
    pub fn pointer_slots(&self) -> &[u32] {
        &self.slots
    }
}

pub struct SafepointTable {
    entries: Vec<SafepointEntry>,
}

impl SafepointTable {
    /// Parse the table starting at the beginning of `data`. Trailing bytes are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut stp = SafepointTableParser { data, offset: 0 };
        stp.read()
    }

    pub fn entries(&self) -> &[SafepointEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry for the call that returns to `pc`.
    pub fn find(&self, pc: u32) -> Option<&SafepointEntry> {
        self.entries.iter().find(|x| x.pc == pc)
    }
}

struct SafepointTableParser<'a> {
    data: &'a [u8],
    offset: usize,
}

impl SafepointTableParser<'_> {
    fn read(&mut self) -> Result<SafepointTable, ParseError> {
        let version = self.read_u8()?;
        if version != SAFEPOINT_TABLE_VERSION {
            return Err(ParseError::Version(version));
        }
        // Reserved
        self.read_u8()?;
        self.read_u16()?;

        let len = usize::try_from(self.read_u32()?).unwrap();
        let bytes_per_entry = usize::try_from(self.read_u32()?).unwrap();

        let mut rows = Vec::with_capacity(len);
        for i in 0..len {
            let pc = self.read_u32()?;
            let deopt_index = match self.read_u32()? {
                NO_DEOPT_INDEX => None,
                x => Some(x),
            };
            let arguments = self.read_u16()?;
            let flags = self.read_u8()?;
            if flags & !(FLAG_HAS_REGISTERS | FLAG_HAS_DOUBLES) != 0 {
                return Err(ParseError::Flags(flags, i));
            }
            self.read_u8()?;
            rows.push((pc, deopt_index, arguments, flags));
        }

        let mut entries = Vec::with_capacity(len);
        for (pc, deopt_index, arguments, flags) in rows {
            let bits = self.read_bytes(bytes_per_entry)?;
            let mut registers = Vec::new();
            let mut slots = Vec::new();
            for (byte_idx, byte) in bits.iter().enumerate() {
                for bit in 0..8 {
                    if byte & (1 << bit) == 0 {
                        continue;
                    }
                    let idx = byte_idx * 8 + bit;
                    if idx < NUM_SAFEPOINT_REGISTERS {
                        registers.push(u16::try_from(idx).unwrap());
                    } else {
                        slots.push(u32::try_from(idx - NUM_SAFEPOINT_REGISTERS).unwrap());
                    }
                }
            }
            entries.push(SafepointEntry {
                pc,
                deopt_index,
                arguments,
                has_doubles: flags & FLAG_HAS_DOUBLES != 0,
                registers: if flags & FLAG_HAS_REGISTERS != 0 {
                    Some(registers)
                } else {
                    None
                },
                slots,
            });
        }
        Ok(SafepointTable { entries })
    }

    fn read_bytes(&mut self, n: usize) -> Result<&[u8], ParseError> {
        let d = self
            .data
            .get(self.offset..self.offset + n)
            .ok_or(ParseError::Truncated(self.offset))?;
        self.offset += n;
        Ok(d)
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ParseError> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use byteorder::WriteBytesExt;

    fn header(len: u32, bytes_per_entry: u32) -> Vec<u8> {
        let mut v = vec![SAFEPOINT_TABLE_VERSION, 0, 0, 0];
        v.write_u32::<LittleEndian>(len).unwrap();
        v.write_u32::<LittleEndian>(bytes_per_entry).unwrap();
        v
    }

    fn entry(v: &mut Vec<u8>, pc: u32, deopt: u32, args: u16, flags: u8) {
        v.write_u32::<LittleEndian>(pc).unwrap();
        v.write_u32::<LittleEndian>(deopt).unwrap();
        v.write_u16::<LittleEndian>(args).unwrap();
        v.push(flags);
        v.push(0);
    }

    #[test]
    fn empty() {
        let t = SafepointTable::parse(&header(0, 3)).unwrap();
        assert!(t.is_empty());
        assert!(t.find(0).is_none());
    }

    #[test]
    fn simple_and_register_entries() {
        let mut v = header(2, 3);
        entry(&mut v, 0x10, NO_DEOPT_INDEX, 0, 0);
        entry(&mut v, 0x20, 4, 1, FLAG_HAS_REGISTERS | FLAG_HAS_DOUBLES);
        // Entry 0: slots 0 and 5.
        v.extend([0, 0, 0b0010_0001]);
        // Entry 1: registers 0 (rax) and 3 (rbx), slot 7.
        v.extend([0b0000_1001, 0, 0b1000_0000]);
        // Trailing bytes are fine.
        v.extend([0xCC, 0xCC]);

        let t = SafepointTable::parse(&v).unwrap();
        assert_eq!(t.len(), 2);

        let e0 = t.find(0x10).unwrap();
        assert_eq!(e0.deopt_index, None);
        assert!(!e0.has_registers());
        assert!(!e0.is_pointer_register(0));
        assert_eq!(e0.pointer_slots(), &[0, 5]);
        assert!(e0.is_pointer_slot(5));
        assert!(!e0.is_pointer_slot(1));

        let e1 = t.find(0x20).unwrap();
        assert_eq!(e1.deopt_index, Some(4));
        assert_eq!(e1.arguments, 1);
        assert!(e1.has_doubles);
        assert_eq!(e1.pointer_registers(), &[0, 3]);
        assert_eq!(e1.pointer_slots(), &[7]);
    }

    #[test]
    fn bad_input() {
        assert!(matches!(
            SafepointTable::parse(&[2, 0, 0, 0]),
            Err(ParseError::Version(2))
        ));
        let mut v = header(1, 3);
        entry(&mut v, 0, NO_DEOPT_INDEX, 0, 0);
        assert!(matches!(
            SafepointTable::parse(&v),
            Err(ParseError::Truncated(_))
        ));
        let mut v = header(1, 3);
        entry(&mut v, 0, NO_DEOPT_INDEX, 0, 0x80);
        v.extend([0, 0, 0]);
        assert_eq!(
            SafepointTable::parse(&v).err(),
            Some(ParseError::Flags(0x80, 0))
        );
    }
}
