// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! Functions in this module are used to handle compiled filter programs with a higher level
//! representation, for example to disassemble an instruction stream into the human-readable
//! listing `tcpdump -d` prints. Jump targets are shown as absolute instruction indices.

use std::fmt::Write;

use crate::cbpf::{Instruction, JumpCondition, Size};

fn load_name(size: Size) -> &'static str {
    match size {
        Size::Word => "ld",
        Size::Half => "ldh",
        Size::Byte => "ldb",
    }
}

fn jump_name(cond: JumpCondition) -> &'static str {
    match cond {
        JumpCondition::Equal => "jeq",
        JumpCondition::BitsSet => "jset",
        JumpCondition::GreaterThan => "jgt",
        JumpCondition::GreaterOrEqual => "jge",
    }
}

/// Render one instruction, without its index. `pc` is needed to print jump targets as
/// absolute indices.
fn insn_str(insn: &Instruction, pc: usize) -> String {
    match *insn {
        Instruction::LoadAbsolute { off, size } => {
            format!("{:<8} [{}]", load_name(size), off)
        }
        Instruction::LoadIndirect { off, size } => {
            format!("{:<8} [x + {}]", load_name(size), off)
        }
        Instruction::LoadMemShift { off } => format!("{:<8} 4*([{}]&0xf)", "ldxb", off),
        Instruction::AluAndConstant { val } => format!("{:<8} #{:#x}", "and", val),
        Instruction::JumpIf {
            cond,
            val,
            skip_true,
            skip_false,
        } => format!(
            "{:<8} {:<16} jt {}\tjf {}",
            jump_name(cond),
            format!("#{:#x}", val),
            pc + 1 + skip_true as usize,
            pc + 1 + skip_false as usize,
        ),
        Instruction::Jump { skip } => format!("{:<8} {}", "ja", pc + 1 + skip as usize),
        Instruction::RetConstant { val } => format!("{:<8} #{}", "ret", val),
    }
}

/// Disassemble a program into a `tcpdump -d` style listing, one instruction per line.
///
/// # Examples
///
/// ```
/// use pcapfilter::cbpf::{Instruction, Size};
/// use pcapfilter::disassembler::disassemble;
///
/// let listing = disassemble(&[Instruction::LoadAbsolute { off: 12, size: Size::Half }]);
/// assert_eq!(listing, "(000) ldh      [12]\n");
/// ```
pub fn disassemble(prog: &[Instruction]) -> String {
    let mut out = String::new();
    for (pc, insn) in prog.iter().enumerate() {
        let _ = writeln!(out, "({:03}) {}", pc, insn_str(insn, pc));
    }
    out
}
