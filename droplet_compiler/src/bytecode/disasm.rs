//! Bytecode disassembly for `--disasm` output and debugging.

use super::opcode::Op;
use super::Constant;
use std::fmt::Write as _;

/// Render one function's code as an assembly-style listing, one instruction
/// per line: `offset  MNEMONIC operands`.
#[must_use]
pub fn disassemble(code: &[u8], constants: &[Constant]) -> String {
    let mut out = String::new();
    let mut ip = 0usize;

    while ip < code.len() {
        let at = ip;
        let byte = code[ip];
        ip += 1;

        let Some(op) = Op::from_u8(byte) else {
            let _ = writeln!(out, "{at:06}  .byte {byte:#04x}");
            continue;
        };

        let _ = write!(out, "{at:06}  {}", op.mnemonic());
        match op {
            Op::PushConst
            | Op::LoadGlobal
            | Op::StoreGlobal
            | Op::NewObject
            | Op::GetField
            | Op::SetField
            | Op::IsInstance => {
                let idx = read_u32(code, &mut ip);
                let _ = write!(out, " {idx}");
                if let Some(c) = constants.get(idx as usize) {
                    let _ = write!(out, "  ; {}", render_constant(c));
                }
            }
            Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue => {
                let target = read_u32(code, &mut ip);
                let _ = write!(out, " -> {target:06}");
            }
            Op::LoadLocal | Op::StoreLocal => {
                let slot = read_u8(code, &mut ip);
                let _ = write!(out, " slot {slot}");
            }
            Op::Return => {
                let count = read_u8(code, &mut ip);
                let _ = write!(out, " {count}");
            }
            Op::Call => {
                let fn_idx = read_u32(code, &mut ip);
                let argc = read_u8(code, &mut ip);
                let _ = write!(out, " fn {fn_idx}, argc {argc}");
            }
            Op::CallNative => {
                let name_idx = read_u32(code, &mut ip);
                let argc = read_u8(code, &mut ip);
                let _ = write!(out, " {name_idx}, argc {argc}");
                if let Some(c) = constants.get(name_idx as usize) {
                    let _ = write!(out, "  ; {}", render_constant(c));
                }
            }
            Op::CallFfi => {
                let lib = read_u32(code, &mut ip);
                let sym = read_u32(code, &mut ip);
                let argc = read_u8(code, &mut ip);
                let sig = read_u32(code, &mut ip);
                let _ = write!(out, " lib {lib}, sym {sym}, argc {argc}, sig {sig}");
            }
            Op::StringSubstr => {
                let start = read_u32(code, &mut ip);
                let len = read_u32(code, &mut ip);
                let _ = write!(out, " start {start}, len {len}");
            }
            _ => {}
        }
        out.push('\n');
    }
    out
}

fn render_constant(c: &Constant) -> String {
    match c {
        Constant::Int(v) => format!("int {v}"),
        Constant::Float(v) => format!("float {v}"),
        Constant::Str(s) => format!("{s:?}"),
        Constant::Nil => "nil".to_string(),
        Constant::Bool(b) => format!("bool {b}"),
    }
}

fn read_u8(code: &[u8], ip: &mut usize) -> u8 {
    let v = code.get(*ip).copied().unwrap_or(0);
    *ip += 1;
    v
}

fn read_u32(code: &[u8], ip: &mut usize) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = code.get(*ip + i).copied().unwrap_or(0);
    }
    *ip += 4;
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::DbcBuilder;

    #[test]
    fn test_disassemble_simple_function() {
        let mut builder = DbcBuilder::new();
        let k = builder.add_int(7);
        let f = builder.add_function("main");
        f.push_const(k);
        f.ret(1);

        let text = disassemble(&builder.functions[0].code, builder.constants());
        assert!(text.contains("PUSH_CONST 0  ; int 7"));
        assert!(text.contains("RETURN 1"));
    }

    #[test]
    fn test_disassemble_jump_targets() {
        let mut builder = DbcBuilder::new();
        let f = builder.add_function("f");
        f.jump(12);
        let text = disassemble(&builder.functions[0].code, builder.constants());
        assert!(text.contains("JUMP -> 000012"));
    }

    #[test]
    fn test_unknown_byte_rendered_as_raw() {
        let text = disassemble(&[0xEE], &[]);
        assert!(text.contains(".byte 0xee"));
    }
}
