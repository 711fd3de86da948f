//! Chunk disassembler.
//!
//! Renders bytecode for compiler tests and for the `trace-execution`
//! feature. One instruction per line: offset, source line (`|` when it
//! repeats), opcode name, operands, and resolved constants.

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;

/// Disassembles a whole chunk under a header.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        offset = next;
    }
    out
}

/// Disassembles the instruction at `offset`; returns the rendered line and
/// the offset of the next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:4} ", chunk.line_at(offset)));
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        text.push_str(&format!("unknown opcode {}\n", byte));
        return (text, offset + 1);
    };

    let next = match op {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Cmp
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::Inherit
        | OpCode::Init => {
            text.push_str(&format!("{}\n", op_name(op)));
            offset + 1
        }

        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => {
            let slot = chunk.code[offset + 1];
            text.push_str(&format!("{:<16} {:4}\n", op_name(op), slot));
            offset + 2
        }

        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProp
        | OpCode::SetProp
        | OpCode::GetPropStr
        | OpCode::SetPropStr
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let index = chunk.code[offset + 1] as usize;
            text.push_str(&render_constant(heap, chunk, op, index));
            offset + 2
        }

        OpCode::ConstantLong
        | OpCode::GetGlobalLong
        | OpCode::DefineGlobalLong
        | OpCode::SetGlobalLong
        | OpCode::GetPropLong
        | OpCode::SetPropLong
        | OpCode::GetSuperLong
        | OpCode::ClassLong
        | OpCode::MethodLong => {
            let index = chunk.read_u16(offset + 1) as usize;
            text.push_str(&render_constant(heap, chunk, op, index));
            offset + 3
        }

        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = chunk.read_u16(offset + 1) as usize;
            text.push_str(&format!(
                "{:<16} {:4} -> {}\n",
                op_name(op),
                offset,
                offset + 3 + jump
            ));
            offset + 3
        }
        OpCode::Loop => {
            let jump = chunk.read_u16(offset + 1) as usize;
            text.push_str(&format!(
                "{:<16} {:4} -> {}\n",
                op_name(op),
                offset,
                offset + 3 - jump
            ));
            offset + 3
        }

        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.code[offset + 1] as usize;
            let arg_count = chunk.code[offset + 2];
            text.push_str(&format!(
                "{:<16} ({} args) {:4} '{}'\n",
                op_name(op),
                arg_count,
                index,
                heap.value_to_string(chunk.constants[index])
            ));
            offset + 3
        }
        OpCode::InvokeLong | OpCode::SuperInvokeLong => {
            let index = chunk.read_u16(offset + 1) as usize;
            let arg_count = chunk.code[offset + 3];
            text.push_str(&format!(
                "{:<16} ({} args) {:4} '{}'\n",
                op_name(op),
                arg_count,
                index,
                heap.value_to_string(chunk.constants[index])
            ));
            offset + 4
        }

        OpCode::Closure | OpCode::ClosureLong => {
            let long = op == OpCode::ClosureLong;
            let mut cursor = offset + 1;
            let index = if long {
                let v = chunk.read_u16(cursor) as usize;
                cursor += 2;
                v
            } else {
                let v = chunk.code[cursor] as usize;
                cursor += 1;
                v
            };
            let value = chunk.constants[index];
            text.push_str(&format!(
                "{:<16} {:4} {}\n",
                op_name(op),
                index,
                heap.value_to_string(value)
            ));
            // One (is_local, index) pair per captured variable
            let upvalue_count = match value {
                crate::value::Value::Obj(r) => heap.function(r).upvalue_count,
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[cursor];
                let slot = chunk.code[cursor + 1];
                text.push_str(&format!(
                    "{:04}    |                     {} {}\n",
                    cursor,
                    if is_local != 0 { "local" } else { "upvalue" },
                    slot
                ));
                cursor += 2;
            }
            cursor
        }
    };

    (text, next)
}

fn render_constant(heap: &Heap, chunk: &Chunk, op: OpCode, index: usize) -> String {
    format!(
        "{:<16} {:4} '{}'\n",
        op_name(op),
        index,
        heap.value_to_string(chunk.constants[index])
    )
}

/// The conventional upper-case name of an opcode.
pub fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "OP_CONSTANT",
        OpCode::ConstantLong => "OP_CONSTANT_LONG",
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Pop => "OP_POP",
        OpCode::GetLocal => "OP_GET_LOCAL",
        OpCode::SetLocal => "OP_SET_LOCAL",
        OpCode::GetGlobal => "OP_GET_GLOBAL",
        OpCode::GetGlobalLong => "OP_GET_GLOBAL_LONG",
        OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
        OpCode::DefineGlobalLong => "OP_DEFINE_GLOBAL_LONG",
        OpCode::SetGlobal => "OP_SET_GLOBAL",
        OpCode::SetGlobalLong => "OP_SET_GLOBAL_LONG",
        OpCode::GetUpvalue => "OP_GET_UPVALUE",
        OpCode::SetUpvalue => "OP_SET_UPVALUE",
        OpCode::GetProp => "OP_GET_PROP",
        OpCode::GetPropLong => "OP_GET_PROP_LONG",
        OpCode::SetProp => "OP_SET_PROP",
        OpCode::SetPropLong => "OP_SET_PROP_LONG",
        OpCode::GetPropStr => "OP_GET_PROP_STR",
        OpCode::SetPropStr => "OP_SET_PROP_STR",
        OpCode::GetSuper => "OP_GET_SUPER",
        OpCode::GetSuperLong => "OP_GET_SUPER_LONG",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Cmp => "OP_CMP",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Print => "OP_PRINT",
        OpCode::Jump => "OP_JUMP",
        OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
        OpCode::Loop => "OP_LOOP",
        OpCode::Call => "OP_CALL",
        OpCode::Invoke => "OP_INVOKE",
        OpCode::InvokeLong => "OP_INVOKE_LONG",
        OpCode::SuperInvoke => "OP_SUPER_INVOKE",
        OpCode::SuperInvokeLong => "OP_SUPER_INVOKE_LONG",
        OpCode::Closure => "OP_CLOSURE",
        OpCode::ClosureLong => "OP_CLOSURE_LONG",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Return => "OP_RETURN",
        OpCode::Class => "OP_CLASS",
        OpCode::ClassLong => "OP_CLASS_LONG",
        OpCode::Inherit => "OP_INHERIT",
        OpCode::Method => "OP_METHOD",
        OpCode::MethodLong => "OP_METHOD_LONG",
        OpCode::Init => "OP_INIT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_disassemble_simple_chunk() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let c = chunk.add_constant(Value::Number(1.5)).unwrap() as u8;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(c, 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 2);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.starts_with("== test ==\n"));
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("'1.5'"));
        assert!(text.contains("OP_NEGATE"));
        assert!(text.contains("OP_RETURN"));
        // Repeated line renders as '|'
        assert!(text.contains("   | OP_NEGATE"));
    }

    #[test]
    fn test_disassemble_jump_targets() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::JumpIfFalse, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);

        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert_eq!(next, 3);
        assert!(text.contains("OP_JUMP_IF_FALSE"));
        assert!(text.contains("-> 5"));
    }
}
