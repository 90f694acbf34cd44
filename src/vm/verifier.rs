//! Bytecode verifier.
//!
//! Checks a decoded or freshly compiled function definition before it is
//! released to execution:
//! - every word carries a known opcode
//! - slot operands stay below the declared slot count
//! - constant, nested-definition and environment indices are in range
//! - jump targets land on instruction boundaries inside the body
//! - the body is non-empty and cannot fall off the end

use thiserror::Error;

use super::bytecode::{
    arg_a, arg_b, arg_c, arg_d, arg_e, arg_sd, opcode, FuncDef, Opcode,
};

/// Largest allowed slot count for a single function.
pub const MAX_SLOTS: i32 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("empty bytecode")]
    EmptyCode,
    #[error("bad header: arity {arity}, slot count {slot_count}")]
    BadHeader { arity: i32, slot_count: i32 },
    #[error("unknown opcode in word {word:#010x} at pc={pc}")]
    BadOpcode { pc: usize, word: u32 },
    #[error("slot {slot} out of range at pc={pc} (slot count {max})")]
    BadSlot { pc: usize, slot: u32, max: i32 },
    #[error("constant index {index} out of range at pc={pc} (count {count})")]
    BadConstant { pc: usize, index: usize, count: usize },
    #[error("definition index {index} out of range at pc={pc} (count {count})")]
    BadDefIndex { pc: usize, index: usize, count: usize },
    #[error("environment index {index} out of range at pc={pc} (count {count})")]
    BadEnvIndex { pc: usize, index: usize, count: usize },
    #[error("jump target {target} out of range at pc={pc}")]
    BadJumpTarget { pc: usize, target: i64 },
    #[error("control can fall off the end of the bytecode")]
    MissingTerminator,
    #[error("source map length {actual} does not match bytecode length {expected}")]
    SourceMapLength { expected: usize, actual: usize },
}

/// Verify a function definition.
pub fn verify(def: &FuncDef) -> Result<(), VerifyError> {
    if def.arity < 0 || def.slot_count < 0 || def.slot_count > MAX_SLOTS || def.arity > def.slot_count
    {
        return Err(VerifyError::BadHeader {
            arity: def.arity,
            slot_count: def.slot_count,
        });
    }
    if def.bytecode.is_empty() {
        return Err(VerifyError::EmptyCode);
    }
    if !def.sourcemap.is_empty() && def.sourcemap.len() != def.bytecode.len() {
        return Err(VerifyError::SourceMapLength {
            expected: def.bytecode.len(),
            actual: def.sourcemap.len(),
        });
    }

    let len = def.bytecode.len();
    for (pc, &word) in def.bytecode.iter().enumerate() {
        let op = opcode(word).ok_or(VerifyError::BadOpcode { pc, word })?;
        match op {
            Opcode::LoadNil | Opcode::LoadTrue | Opcode::LoadFalse | Opcode::Yield
            | Opcode::Return | Opcode::TailCall => {
                check_slot(def, pc, arg_a(word))?;
            }
            Opcode::ReturnNil => {}
            Opcode::LoadInt => {
                check_slot(def, pc, arg_a(word))?;
            }
            Opcode::LoadConst => {
                check_slot(def, pc, arg_a(word))?;
                let index = arg_d(word) as usize;
                if index >= def.constants.len() {
                    return Err(VerifyError::BadConstant {
                        pc,
                        index,
                        count: def.constants.len(),
                    });
                }
            }
            Opcode::Move => {
                check_slot(def, pc, arg_a(word))?;
                let src = arg_d(word);
                if (src as i32) >= def.slot_count {
                    return Err(VerifyError::BadSlot {
                        pc,
                        slot: src as u32,
                        max: def.slot_count,
                    });
                }
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Lt | Opcode::Eq => {
                check_slot(def, pc, arg_a(word))?;
                check_slot(def, pc, arg_b(word))?;
                check_slot(def, pc, arg_c(word))?;
            }
            Opcode::Jump => {
                check_target(pc, len, pc as i64 + arg_e(word) as i64)?;
            }
            Opcode::JumpIf | Opcode::JumpUnless => {
                check_slot(def, pc, arg_a(word))?;
                check_target(pc, len, pc as i64 + arg_sd(word) as i64)?;
            }
            Opcode::Call => {
                check_slot(def, pc, arg_a(word))?;
                check_slot(def, pc, arg_b(word))?;
            }
            Opcode::MakeClosure => {
                check_slot(def, pc, arg_a(word))?;
                let index = arg_d(word) as usize;
                if index >= def.defs.len() {
                    return Err(VerifyError::BadDefIndex {
                        pc,
                        index,
                        count: def.defs.len(),
                    });
                }
            }
            Opcode::LoadUpvalue | Opcode::SetUpvalue => {
                check_slot(def, pc, arg_a(word))?;
                let index = arg_b(word) as usize;
                if index >= def.environments.len() {
                    return Err(VerifyError::BadEnvIndex {
                        pc,
                        index,
                        count: def.environments.len(),
                    });
                }
                // The C operand indexes into the environment at runtime
                // and cannot be checked statically.
            }
        }
    }

    let last = def.bytecode[len - 1];
    match opcode(last) {
        Some(op) if op.is_terminator() => Ok(()),
        _ => Err(VerifyError::MissingTerminator),
    }
}

fn check_slot(def: &FuncDef, pc: usize, slot: u8) -> Result<(), VerifyError> {
    if (slot as i32) >= def.slot_count {
        return Err(VerifyError::BadSlot {
            pc,
            slot: slot as u32,
            max: def.slot_count,
        });
    }
    Ok(())
}

fn check_target(pc: usize, len: usize, target: i64) -> Result<(), VerifyError> {
    if target < 0 || target >= len as i64 {
        return Err(VerifyError::BadJumpTarget { pc, target });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::{encode_abc, encode_ad, encode_e};
    use crate::vm::value::Value;

    fn def_with(slot_count: i32, code: Vec<u32>) -> FuncDef {
        FuncDef {
            slot_count,
            bytecode: code,
            ..FuncDef::default()
        }
    }

    #[test]
    fn test_minimal_function() {
        let def = def_with(1, vec![encode_abc(Opcode::Return, 0, 0, 0)]);
        assert!(verify(&def).is_ok());
    }

    #[test]
    fn test_empty_rejected() {
        let def = def_with(0, vec![]);
        assert_eq!(verify(&def), Err(VerifyError::EmptyCode));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let def = def_with(1, vec![0xFF, encode_abc(Opcode::ReturnNil, 0, 0, 0)]);
        assert!(matches!(verify(&def), Err(VerifyError::BadOpcode { pc: 0, .. })));
    }

    #[test]
    fn test_slot_out_of_range() {
        let def = def_with(
            2,
            vec![
                encode_abc(Opcode::Add, 0, 1, 2),
                encode_abc(Opcode::ReturnNil, 0, 0, 0),
            ],
        );
        assert!(matches!(verify(&def), Err(VerifyError::BadSlot { pc: 0, slot: 2, .. })));
    }

    #[test]
    fn test_constant_index_checked() {
        let mut def = def_with(
            1,
            vec![
                encode_ad(Opcode::LoadConst, 0, 3),
                encode_abc(Opcode::Return, 0, 0, 0),
            ],
        );
        assert!(matches!(verify(&def), Err(VerifyError::BadConstant { .. })));
        def.constants = vec![Value::Nil; 4];
        assert!(verify(&def).is_ok());
    }

    #[test]
    fn test_jump_bounds() {
        let ok = def_with(
            1,
            vec![
                encode_e(Opcode::Jump, 1),
                encode_abc(Opcode::ReturnNil, 0, 0, 0),
            ],
        );
        assert!(verify(&ok).is_ok());

        let bad = def_with(
            1,
            vec![
                encode_e(Opcode::Jump, 5),
                encode_abc(Opcode::ReturnNil, 0, 0, 0),
            ],
        );
        assert!(matches!(verify(&bad), Err(VerifyError::BadJumpTarget { .. })));

        let backward = def_with(
            1,
            vec![
                encode_abc(Opcode::LoadNil, 0, 0, 0),
                encode_e(Opcode::Jump, -1),
            ],
        );
        assert!(verify(&backward).is_ok());
    }

    #[test]
    fn test_fallthrough_rejected() {
        let def = def_with(1, vec![encode_abc(Opcode::LoadNil, 0, 0, 0)]);
        assert_eq!(verify(&def), Err(VerifyError::MissingTerminator));
    }

    #[test]
    fn test_bad_header() {
        let mut def = def_with(1, vec![encode_abc(Opcode::ReturnNil, 0, 0, 0)]);
        def.arity = 2;
        assert!(matches!(verify(&def), Err(VerifyError::BadHeader { .. })));
    }

    #[test]
    fn test_env_index_checked() {
        let mut def = def_with(
            1,
            vec![
                encode_abc(Opcode::LoadUpvalue, 0, 0, 0),
                encode_abc(Opcode::Return, 0, 0, 0),
            ],
        );
        assert!(matches!(verify(&def), Err(VerifyError::BadEnvIndex { .. })));
        def.environments = vec![0];
        assert!(verify(&def).is_ok());
    }
}
