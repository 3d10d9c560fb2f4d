// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! Userspace execution of classic BPF programs, with the semantics of the in-kernel filter:
//! a single accumulator, an index register, 32-bit big-endian loads from the frame, and
//! forward-only jumps. A load that reaches past the end of the frame terminates the program
//! with a drop, exactly as the kernel does.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::cbpf;
use crate::cbpf::SockFilter;

/// Execution failures. These are programming errors in the filter, not properties of the
/// frame; a well-formed compiler output never triggers them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    /// The opcode at this index is not part of the supported classic BPF subset.
    #[error("unknown opcode {code:#x} (insn #{insn})")]
    UnknownOpcode {
        /// The raw operation code.
        code: u16,
        /// Index of the offending instruction.
        insn: usize,
    },
    /// Execution ran off the end of the program without hitting a return.
    #[error("program ended without a return instruction")]
    MissingReturn,
}

/// Run a classic BPF program over one frame. Returns the program's return constant:
/// [`cbpf::RET_KEEP`] for an accepted frame, `0` for a dropped one.
///
/// # Examples
///
/// ```
/// use pcapfilter::cbpf::{self, Instruction};
/// use pcapfilter::interpreter::execute_program;
///
/// let prog = cbpf::assemble(&[Instruction::RetConstant { val: cbpf::RET_KEEP }]);
/// assert_eq!(execute_program(&prog, &[0u8; 14]).unwrap(), cbpf::RET_KEEP);
/// ```
pub fn execute_program(prog: &[SockFilter], frame: &[u8]) -> Result<u32, ExecuteError> {
    let mut acc: u32 = 0;
    let mut index: u32 = 0;
    let mut pc: usize = 0;

    while pc < prog.len() {
        let insn = prog[pc];
        let class = insn.code & 0x07;
        match class {
            cbpf::BPF_LD => {
                let mode = insn.code & 0xe0;
                let size = insn.code & 0x18;
                let off = match mode {
                    cbpf::BPF_ABS => u64::from(insn.k),
                    cbpf::BPF_IND => u64::from(index) + u64::from(insn.k),
                    cbpf::BPF_LEN => {
                        acc = frame.len() as u32;
                        pc += 1;
                        continue;
                    }
                    cbpf::BPF_IMM => {
                        acc = insn.k;
                        pc += 1;
                        continue;
                    }
                    _ => {
                        return Err(ExecuteError::UnknownOpcode {
                            code: insn.code,
                            insn: pc,
                        })
                    }
                };
                acc = match load(frame, off, size) {
                    Some(value) => value,
                    None => return Ok(0),
                };
            }
            cbpf::BPF_LDX => {
                let mode = insn.code & 0xe0;
                match mode {
                    cbpf::BPF_MSH => {
                        let byte = match load(frame, u64::from(insn.k), cbpf::BPF_B) {
                            Some(value) => value,
                            None => return Ok(0),
                        };
                        index = 4 * (byte & 0x0f);
                    }
                    cbpf::BPF_IMM => index = insn.k,
                    cbpf::BPF_LEN => index = frame.len() as u32,
                    _ => {
                        return Err(ExecuteError::UnknownOpcode {
                            code: insn.code,
                            insn: pc,
                        })
                    }
                }
            }
            cbpf::BPF_ALU => {
                let op = insn.code & 0xf0;
                let operand = if insn.code & cbpf::BPF_X != 0 {
                    index
                } else {
                    insn.k
                };
                acc = match op {
                    cbpf::BPF_ADD => acc.wrapping_add(operand),
                    cbpf::BPF_SUB => acc.wrapping_sub(operand),
                    cbpf::BPF_MUL => acc.wrapping_mul(operand),
                    cbpf::BPF_DIV => {
                        if operand == 0 {
                            return Ok(0);
                        }
                        acc / operand
                    }
                    cbpf::BPF_AND => acc & operand,
                    cbpf::BPF_OR => acc | operand,
                    cbpf::BPF_LSH => acc.wrapping_shl(operand),
                    cbpf::BPF_RSH => acc.wrapping_shr(operand),
                    cbpf::BPF_NEG => (acc as i32).wrapping_neg() as u32,
                    _ => {
                        return Err(ExecuteError::UnknownOpcode {
                            code: insn.code,
                            insn: pc,
                        })
                    }
                };
            }
            cbpf::BPF_JMP => {
                let op = insn.code & 0xf0;
                if op == cbpf::BPF_JA {
                    pc += 1 + insn.k as usize;
                    continue;
                }
                let taken = match op {
                    cbpf::BPF_JEQ => acc == insn.k,
                    cbpf::BPF_JGT => acc > insn.k,
                    cbpf::BPF_JGE => acc >= insn.k,
                    cbpf::BPF_JSET => acc & insn.k != 0,
                    _ => {
                        return Err(ExecuteError::UnknownOpcode {
                            code: insn.code,
                            insn: pc,
                        })
                    }
                };
                let skip = if taken { insn.jt } else { insn.jf };
                pc += 1 + usize::from(skip);
                continue;
            }
            cbpf::BPF_RET => return Ok(insn.k),
            _ => {
                return Err(ExecuteError::UnknownOpcode {
                    code: insn.code,
                    insn: pc,
                })
            }
        }
        pc += 1;
    }
    Err(ExecuteError::MissingReturn)
}

/// Big-endian frame load; `None` when any requested byte lies past the end of the frame.
fn load(frame: &[u8], off: u64, size: u16) -> Option<u32> {
    let off = usize::try_from(off).ok()?;
    let width = match size {
        cbpf::BPF_W => 4,
        cbpf::BPF_H => 2,
        _ => 1,
    };
    let bytes = frame.get(off..off.checked_add(width)?)?;
    Some(match width {
        4 => BigEndian::read_u32(bytes),
        2 => u32::from(BigEndian::read_u16(bytes)),
        _ => u32::from(bytes[0]),
    })
}
