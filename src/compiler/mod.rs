pub mod ast;
pub mod chunk;
pub mod compiler;
pub mod parser;
mod rle;
pub mod scanner;
pub mod token;
mod util;

use thiserror::Error;

use token::Token;

/// Local slots are addressed by a single byte; slot 0 is reserved for the
/// receiver.
pub const MAX_LOCALS: usize = 256;

/// Upvalue slots are addressed by a single byte.
pub const MAX_UPVALUES: usize = 256;

/// Constant pool indices are a single byte.
pub const MAX_CONSTANTS: usize = 256;

pub type Result<T> = std::result::Result<T, CompileError>;

/// A single syntax diagnostic. The parser prints these as they are found
/// and collects them for the final result.
#[derive(Debug, Clone, Error)]
#[error("[line {}] Error{}: {}", .line, .location, .message)]
pub struct ParseError {
    pub line: u64,
    pub location: String,
    pub message: String,
}

/// Errors raised while turning source into a function. Every variant except
/// `Parse` carries the offending token for diagnostics; compilation aborts
/// on the first one and no partial function is surfaced.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Number of parse errors: {}", .0.len())]
    Parse(Vec<ParseError>),

    #[error("Local variable limit exceeded: line [{}] at '{}'", .0.line, .0.data)]
    LocalVariableLimitExceeded(Token),

    #[error("Redefined variable in same scope: line [{}] at '{}'", .0.line, .0.data)]
    RedefinedVariableInSameScope(Token),

    #[error("Chunk constant limit exceeded: line [{}] at '{}'", .0.line, .0.data)]
    ChunkConstantLimitExceeded(Token),

    #[error("Jump limit exceeded: line [{}] at '{}'", .0.line, .0.data)]
    JumpLimitExceeded(Token),

    #[error("Loop limit exceeded: line [{}] at '{}'", .0.line, .0.data)]
    LoopLimitExceeded(Token),

    #[error("Return outside function: line [{}] at '{}'", .0.line, .0.data)]
    ReturnOutsideFunction(Token),

    #[error("Upvalue variable limit exceeded: line [{}] at '{}'", .0.line, .0.data)]
    UpvalueLimitExceeded(Token),

    #[error("This outside class: line [{}] at '{}'", .0.line, .0.data)]
    ThisOutsideClass(Token),

    #[error("Return inside initializer: line [{}] at '{}'", .0.line, .0.data)]
    ReturnInsideInitializer(Token),

    #[error("Cyclic inheritance: line [{}] at '{}'", .0.line, .0.data)]
    CyclicInheritance(Token),

    #[error("Super used outside class: line [{}] at '{}'", .0.line, .0.data)]
    SuperUsedOutsideClass(Token),

    #[error("Super used in class with no super class: line [{}] at '{}'", .0.line, .0.data)]
    SuperUsedInClassWithNoSuperClass(Token),
}
