//! Sequential reader over one method's instruction bytes.
//!
//! The reader trusts its input: bytecode is assumed to have passed
//! verification, and reading past the end of the code array panics.
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

/// Cursor over a method's `code` attribute. All multi-byte operands in the
/// JVM instruction stream are big-endian.
#[derive(Debug, Clone)]
pub struct BytecodeReader {
    code: Arc<[u8]>,
    pc: usize,
}

impl BytecodeReader {
    pub fn new(code: Arc<[u8]>) -> Self {
        Self { code, pc: 0 }
    }

    /// Current position, measured from the start of the method's code.
    pub const fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.pc < self.code.len()
    }

    pub fn read_u1(&mut self) -> u8 {
        let value = self.code[self.pc];
        self.pc += 1;
        value
    }

    pub fn read_s1(&mut self) -> i8 {
        self.read_u1() as i8
    }

    pub fn read_u2(&mut self) -> u16 {
        BigEndian::read_u16(&self.take(2))
    }

    pub fn read_s2(&mut self) -> i16 {
        BigEndian::read_i16(&self.take(2))
    }

    pub fn read_s4(&mut self) -> i32 {
        BigEndian::read_i32(&self.take(4))
    }

    /// Reads `count` consecutive signed 4-byte values, as laid out by the
    /// jump tables of `tableswitch` and `lookupswitch`.
    pub fn read_s4s(&mut self, count: usize) -> Vec<i32> {
        let mut values = vec![0i32; count];
        let end = self.pc + count * 4;
        BigEndian::read_i32_into(&self.code[self.pc..end], &mut values);
        self.pc = end;
        values
    }

    /// Skips the 0-3 padding bytes that follow a switch opcode so the next
    /// read starts on a 4-byte boundary relative to the start of the code.
    pub fn align4(&mut self) {
        self.pc = (self.pc + 3) & !3;
    }

    /// Moves the cursor by a signed relative offset. Branch offsets are
    /// encoded relative to the branch opcode, so callers pass
    /// `offset - instruction_length` once the operands have been consumed.
    pub fn skip(&mut self, offset: i32) {
        self.pc = (self.pc as i64 + offset as i64) as usize;
    }

    fn take(&mut self, n: usize) -> [u8; 4] {
        let mut buf = [0u8; 4];
        buf[..n].copy_from_slice(&self.code[self.pc..self.pc + n]);
        self.pc += n;
        buf
    }
}
