use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("input is not a compiled unit (magic 0x{0:08X})")]
    BadMagic(u32),
    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),
    #[error("constant pool index {0} is out of range")]
    InvalidConstantIndex(u16),
    #[error("constant pool entry {index} is not a {expected}")]
    UnexpectedConstant { index: u16, expected: &'static str },
    #[error("malformed modified UTF-8 at byte {0}")]
    InvalidModifiedUtf8(usize),
    #[error("unknown constant pool tag {0}")]
    UnknownConstantTag(u8),
    #[error("constant pool is full")]
    ConstantPoolOverflow,
    #[error("unknown opcode 0x{opcode:02X} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("branch from offset {from} lands at {to}, which is not an instruction boundary")]
    InvalidBranchTarget { from: usize, to: i64 },
    #[error("bytecode ends in the middle of an instruction")]
    TruncatedCode,
    #[error("instruction `{0}` has no encoding")]
    Unencodable(String),
    #[error("method body exceeds 65535 bytes")]
    CodeTooLarge,
    #[error("invalid descriptor `{0}`")]
    InvalidDescriptor(String),
    #[error("label {0} has no position in the instruction list")]
    UnboundLabel(u32),
    #[error("container error: {0}")]
    Container(#[from] zip::result::ZipError),
    #[error("failed to load `{name}`: {source}")]
    Load {
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to write output: {0}")]
    Write(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("operand types do not match the operator: {0}")]
    TypeMismatch(String),
    #[error("operator {0} cannot be evaluated statically")]
    Unsupported(String),
}
