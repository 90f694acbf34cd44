//! Function definitions and the bytecode instruction encoding.
//!
//! Instructions are 32-bit words with the opcode in the low byte and up
//! to three operands packed into the remaining 24 bits:
//! - ABC form: three unsigned 8-bit operands
//! - AD form: one unsigned 8-bit operand plus a 16-bit operand
//! - E form: a single signed 24-bit operand (jump offsets)

use super::heap::GcRef;
use super::value::Value;

// Definition flag bits. The low 16 bits are a user tag; the section bits
// record which optional parts are present on the wire.
pub const FUNCDEF_FLAG_VARARG: i32 = 1 << 16;
pub const FUNCDEF_FLAG_HAS_NAME: i32 = 1 << 19;
pub const FUNCDEF_FLAG_HAS_SOURCE: i32 = 1 << 20;
pub const FUNCDEF_FLAG_HAS_DEFS: i32 = 1 << 21;
pub const FUNCDEF_FLAG_HAS_ENVS: i32 = 1 << 22;
pub const FUNCDEF_FLAG_HAS_SOURCEMAP: i32 = 1 << 23;

/// A half-open byte range into the source for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub start: i32,
    pub end: i32,
}

/// An immutable, shareable function definition.
///
/// Definitions are produced by the compiler and never mutated afterwards;
/// many closures may share one definition.
#[derive(Debug, Clone, Default)]
pub struct FuncDef {
    pub flags: i32,
    pub arity: i32,
    pub slot_count: i32,
    pub constants: Vec<Value>,
    pub bytecode: Vec<u32>,
    /// Lexical frame indices captured by this function.
    pub environments: Vec<i32>,
    /// Nested definitions for closures created by this function.
    pub defs: Vec<GcRef>,
    pub name: Option<GcRef>,
    pub source: Option<GcRef>,
    /// Parallel to `bytecode` when present.
    pub sourcemap: Vec<SourceMapping>,
}

impl FuncDef {
    /// The definition flags with the section bits set for every optional
    /// part that is actually present.
    pub fn section_flags(&self) -> i32 {
        let mut flags = self.flags;
        if self.name.is_some() {
            flags |= FUNCDEF_FLAG_HAS_NAME;
        }
        if self.source.is_some() {
            flags |= FUNCDEF_FLAG_HAS_SOURCE;
        }
        if !self.defs.is_empty() {
            flags |= FUNCDEF_FLAG_HAS_DEFS;
        }
        if !self.environments.is_empty() {
            flags |= FUNCDEF_FLAG_HAS_ENVS;
        }
        if !self.sourcemap.is_empty() {
            flags |= FUNCDEF_FLAG_HAS_SOURCEMAP;
        }
        flags
    }
}

/// Bytecode operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    LoadNil,
    LoadTrue,
    LoadFalse,
    LoadInt,
    LoadConst,
    Move,
    Add,
    Sub,
    Mul,
    Lt,
    Eq,
    Jump,
    JumpIf,
    JumpUnless,
    Call,
    TailCall,
    MakeClosure,
    LoadUpvalue,
    SetUpvalue,
    Yield,
    Return,
    ReturnNil,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        Some(match byte {
            0 => Opcode::LoadNil,
            1 => Opcode::LoadTrue,
            2 => Opcode::LoadFalse,
            3 => Opcode::LoadInt,
            4 => Opcode::LoadConst,
            5 => Opcode::Move,
            6 => Opcode::Add,
            7 => Opcode::Sub,
            8 => Opcode::Mul,
            9 => Opcode::Lt,
            10 => Opcode::Eq,
            11 => Opcode::Jump,
            12 => Opcode::JumpIf,
            13 => Opcode::JumpUnless,
            14 => Opcode::Call,
            15 => Opcode::TailCall,
            16 => Opcode::MakeClosure,
            17 => Opcode::LoadUpvalue,
            18 => Opcode::SetUpvalue,
            19 => Opcode::Yield,
            20 => Opcode::Return,
            21 => Opcode::ReturnNil,
            _ => return None,
        })
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::TailCall | Opcode::Return | Opcode::ReturnNil
        )
    }
}

/// Pack an ABC-form instruction.
pub fn encode_abc(op: Opcode, a: u8, b: u8, c: u8) -> u32 {
    op as u32 | (a as u32) << 8 | (b as u32) << 16 | (c as u32) << 24
}

/// Pack an AD-form instruction.
pub fn encode_ad(op: Opcode, a: u8, d: u16) -> u32 {
    op as u32 | (a as u32) << 8 | (d as u32) << 16
}

/// Pack an E-form instruction with a signed 24-bit operand.
pub fn encode_e(op: Opcode, e: i32) -> u32 {
    op as u32 | ((e as u32) & 0xFF_FFFF) << 8
}

pub fn opcode(word: u32) -> Option<Opcode> {
    Opcode::from_u8(word as u8)
}

pub fn arg_a(word: u32) -> u8 {
    (word >> 8) as u8
}

pub fn arg_b(word: u32) -> u8 {
    (word >> 16) as u8
}

pub fn arg_c(word: u32) -> u8 {
    (word >> 24) as u8
}

pub fn arg_d(word: u32) -> u16 {
    (word >> 16) as u16
}

/// The D operand, sign-extended.
pub fn arg_sd(word: u32) -> i32 {
    (word >> 16) as u16 as i16 as i32
}

/// The E operand, sign-extended from 24 bits.
pub fn arg_e(word: u32) -> i32 {
    (word as i32) >> 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abc_roundtrip() {
        let w = encode_abc(Opcode::Add, 1, 2, 3);
        assert_eq!(opcode(w), Some(Opcode::Add));
        assert_eq!(arg_a(w), 1);
        assert_eq!(arg_b(w), 2);
        assert_eq!(arg_c(w), 3);
    }

    #[test]
    fn test_ad_roundtrip() {
        let w = encode_ad(Opcode::LoadConst, 7, 0xBEEF);
        assert_eq!(opcode(w), Some(Opcode::LoadConst));
        assert_eq!(arg_a(w), 7);
        assert_eq!(arg_d(w), 0xBEEF);
    }

    #[test]
    fn test_signed_operands() {
        let w = encode_ad(Opcode::LoadInt, 0, -5i16 as u16);
        assert_eq!(arg_sd(w), -5);

        let w = encode_e(Opcode::Jump, -100);
        assert_eq!(opcode(w), Some(Opcode::Jump));
        assert_eq!(arg_e(w), -100);

        let w = encode_e(Opcode::Jump, 100);
        assert_eq!(arg_e(w), 100);
    }

    #[test]
    fn test_bad_opcode() {
        assert_eq!(opcode(0xFF), None);
    }

    #[test]
    fn test_section_flags() {
        let mut def = FuncDef::default();
        assert_eq!(def.section_flags(), 0);
        def.environments.push(0);
        def.sourcemap.push(SourceMapping { start: 0, end: 1 });
        assert_eq!(
            def.section_flags(),
            FUNCDEF_FLAG_HAS_ENVS | FUNCDEF_FLAG_HAS_SOURCEMAP
        );
    }
}
