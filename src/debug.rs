use crate::compiler::chunk::Chunk;
use crate::vm::instruction::OpCode;
use crate::vm::value::Value;

/// Collect at every allocation safepoint instead of waiting for the heap
/// growth threshold.
pub const STRESS_GC: bool = false;

/// Log collection phases and every mark/sweep decision.
pub const LOG_GC: bool = false;

/// Print the stack and the decoded instruction before each dispatch.
pub const TRACE_EXECUTION: bool = false;

/// Disassemble every chunk as it finishes compiling.
pub const LOG_COMPILED_CODE: bool = false;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        let line = chunk.line(offset);
        let line_text = if offset > 0 && chunk.line(offset - 1) == line {
            "   |".to_owned()
        } else {
            format!("{:4}", line)
        };

        let (text, size) = disassemble_instruction(chunk, offset);
        println!("{:04} {} {}", offset, line_text, text);
        offset += size;
    }
}

/// Decodes the instruction at `offset`, returning its rendering and its
/// total size in bytes including operands.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let op = OpCode::from(chunk.code[offset]);
    match op {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::CloseUpvalue
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Return
        | OpCode::Inherit => (op.name().to_owned(), 1),

        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::Class
        | OpCode::Method
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper => {
            let index = chunk.code[offset + 1] as usize;
            (
                format!("{} {} '{}'", op.name(), index, chunk.constants[index]),
                2,
            )
        }

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let operand = chunk.code[offset + 1];
            (format!("{} {}", op.name(), operand), 2)
        }

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let jump = read_short(chunk, offset + 1);
            (
                format!("{} {} -> {}", op.name(), offset, offset + 3 + jump),
                3,
            )
        }
        OpCode::Loop => {
            let jump = read_short(chunk, offset + 1);
            (
                format!("{} {} -> {}", op.name(), offset, offset + 3 - jump),
                3,
            )
        }

        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.code[offset + 1] as usize;
            let args = chunk.code[offset + 2];
            (
                format!(
                    "{} ({} args) {} '{}'",
                    op.name(),
                    args,
                    index,
                    chunk.constants[index]
                ),
                3,
            )
        }

        OpCode::Closure => {
            let index = chunk.code[offset + 1] as usize;
            let function = &chunk.constants[index];
            let upvalue_count = match function {
                Value::Object(object) => object.as_function().upvalue_count,
                _ => 0,
            };
            (
                format!("{} {} {}", op.name(), index, function),
                2 + upvalue_count * 2,
            )
        }
    }
}

fn read_short(chunk: &Chunk, offset: usize) -> usize {
    (chunk.code[offset] as usize) << 8 | chunk.code[offset + 1] as usize
}
