use thiserror::Error;

mod call_frame;
pub mod instruction;
pub mod value;
pub mod vm;

pub use call_frame::CallFrame;

/// Maximum call depth before execution fails with a stack overflow.
pub const MAX_FRAMES: usize = 64;

/// Capacity of the value stack; each frame can address 256 slots.
pub const MAX_STACK: usize = MAX_FRAMES * 256;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the dispatch loop. These are terminal: the VM prints
/// the message and a stack trace, then gives up on the program.
///
/// The last three variants are unreachable for chunks produced by the
/// compiler; they exist so a corrupt chunk fails instead of panicking.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,

    #[error("Operand must be a number.")]
    OperandMustBeNumber,

    #[error("Operands to + must both be numbers or strings.")]
    BadAddOperands,

    #[error("Undefined variable '{}'.", .0)]
    UndefinedVariable(String),

    #[error("Undefined property '{}'.", .0)]
    UndefinedProperty(String),

    #[error("Only instances have properties.")]
    PropertyOnNonInstance,

    #[error("Only instances have fields.")]
    FieldOnNonInstance,

    #[error("Only instances have methods.")]
    MethodOnNonInstance,

    #[error("Can only call functions and classes.")]
    NotCallable,

    #[error("Expected {} arguments but got {}.", .expected, .got)]
    ArityMismatch { expected: u8, got: u8 },

    #[error("Stack overflow.")]
    StackOverflow,

    #[error("Superclass must be a class.")]
    SuperclassNotAClass,

    #[error("Trying to access an empty stack.")]
    EmptyStack,

    #[error("Trying to access an empty list of call frames.")]
    NoCallFrame,

    #[error("Instruction pointer ran past the end of the chunk.")]
    InstructionOutOfBounds,
}
