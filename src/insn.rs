use std::fmt;

use crate::code::Label;
use crate::mutf8::JavaString;
use crate::opcodes;

/// Kind of a local variable, return value or array slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl ValueKind {
    pub fn slots(self) -> usize {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }

    fn prefix(self) -> char {
        match self {
            ValueKind::Int => 'i',
            ValueKind::Long => 'l',
            ValueKind::Float => 'f',
            ValueKind::Double => 'd',
            ValueKind::Ref => 'a',
        }
    }
}

/// Operand kind of an arithmetic instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NumKind {
    Int,
    Long,
    Float,
    Double,
}

impl NumKind {
    pub fn slots(self) -> usize {
        match self {
            NumKind::Long | NumKind::Double => 2,
            _ => 1,
        }
    }

    fn prefix(self) -> char {
        match self {
            NumKind::Int => 'i',
            NumKind::Long => 'l',
            NumKind::Float => 'f',
            NumKind::Double => 'd',
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
}

impl MathOp {
    pub fn is_unary(self) -> bool {
        self == MathOp::Neg
    }

    /// Shifts take an int shift distance even when the value is a long
    pub fn is_shift(self) -> bool {
        matches!(self, MathOp::Shl | MathOp::Shr | MathOp::Ushr)
    }

    fn name(self) -> &'static str {
        match self {
            MathOp::Add => "add",
            MathOp::Sub => "sub",
            MathOp::Mul => "mul",
            MathOp::Div => "div",
            MathOp::Rem => "rem",
            MathOp::Neg => "neg",
            MathOp::Shl => "shl",
            MathOp::Shr => "shr",
            MathOp::Ushr => "ushr",
            MathOp::And => "and",
            MathOp::Or => "or",
            MathOp::Xor => "xor",
        }
    }
}

/// A literal pushed by a constant instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(JavaString),
    Null,
    /// A class literal
    Type(String),
    MethodType(String),
    /// Any other loadable constant (method handles, dynamic constants),
    /// kept by pool index.
    Pooled { index: u16, wide: bool },
}

impl ConstValue {
    pub fn slots(&self) -> usize {
        match self {
            ConstValue::Long(_) | ConstValue::Double(_) => 2,
            ConstValue::Pooled { wide: true, .. } => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(v) => write!(f, "int {}", v),
            ConstValue::Long(v) => write!(f, "long {}", v),
            ConstValue::Float(v) => write!(f, "float {:?}", v),
            ConstValue::Double(v) => write!(f, "double {:?}", v),
            ConstValue::Str(s) => write!(f, "{:?}", s.to_string_lossy()),
            ConstValue::Null => write!(f, "null"),
            ConstValue::Type(name) => write!(f, "class {}", name),
            ConstValue::MethodType(desc) => write!(f, "methodtype {}", desc),
            ConstValue::Pooled { index, .. } => write!(f, "#{}", index),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FieldOp {
    GetStatic,
    PutStatic,
    GetField,
    PutField,
}

impl FieldOp {
    pub fn is_static(self) -> bool {
        matches!(self, FieldOp::GetStatic | FieldOp::PutStatic)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Virtual,
    Special,
    Static,
    Interface,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeOp {
    New,
    ANewArray,
    CheckCast,
    InstanceOf,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StackOp {
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
}

/// Comparison performed by a conditional jump.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Cond {
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IcmpEq,
    IcmpNe,
    IcmpLt,
    IcmpGe,
    IcmpGt,
    IcmpLe,
    AcmpEq,
    AcmpNe,
    IfNull,
    IfNonNull,
}

impl Cond {
    /// Number of stack operands the comparison pops.
    pub fn operand_count(self) -> usize {
        match self {
            Cond::IcmpEq
            | Cond::IcmpNe
            | Cond::IcmpLt
            | Cond::IcmpGe
            | Cond::IcmpGt
            | Cond::IcmpLe
            | Cond::AcmpEq
            | Cond::AcmpNe => 2,
            _ => 1,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Cond> {
        Some(match opcode {
            opcodes::IFEQ => Cond::IfEq,
            opcodes::IFNE => Cond::IfNe,
            opcodes::IFLT => Cond::IfLt,
            opcodes::IFGE => Cond::IfGe,
            opcodes::IFGT => Cond::IfGt,
            opcodes::IFLE => Cond::IfLe,
            opcodes::IF_ICMPEQ => Cond::IcmpEq,
            opcodes::IF_ICMPNE => Cond::IcmpNe,
            opcodes::IF_ICMPLT => Cond::IcmpLt,
            opcodes::IF_ICMPGE => Cond::IcmpGe,
            opcodes::IF_ICMPGT => Cond::IcmpGt,
            opcodes::IF_ICMPLE => Cond::IcmpLe,
            opcodes::IF_ACMPEQ => Cond::AcmpEq,
            opcodes::IF_ACMPNE => Cond::AcmpNe,
            opcodes::IFNULL => Cond::IfNull,
            opcodes::IFNONNULL => Cond::IfNonNull,
            _ => return None,
        })
    }

    pub fn opcode(self) -> u8 {
        match self {
            Cond::IfEq => opcodes::IFEQ,
            Cond::IfNe => opcodes::IFNE,
            Cond::IfLt => opcodes::IFLT,
            Cond::IfGe => opcodes::IFGE,
            Cond::IfGt => opcodes::IFGT,
            Cond::IfLe => opcodes::IFLE,
            Cond::IcmpEq => opcodes::IF_ICMPEQ,
            Cond::IcmpNe => opcodes::IF_ICMPNE,
            Cond::IcmpLt => opcodes::IF_ICMPLT,
            Cond::IcmpGe => opcodes::IF_ICMPGE,
            Cond::IcmpGt => opcodes::IF_ICMPGT,
            Cond::IcmpLe => opcodes::IF_ICMPLE,
            Cond::AcmpEq => opcodes::IF_ACMPEQ,
            Cond::AcmpNe => opcodes::IF_ACMPNE,
            Cond::IfNull => opcodes::IFNULL,
            Cond::IfNonNull => opcodes::IFNONNULL,
        }
    }

    /// The opposite comparison, used when a conditional must be widened by
    /// jumping over a `goto_w`.
    pub fn invert(self) -> Cond {
        match self {
            Cond::IfEq => Cond::IfNe,
            Cond::IfNe => Cond::IfEq,
            Cond::IfLt => Cond::IfGe,
            Cond::IfGe => Cond::IfLt,
            Cond::IfGt => Cond::IfLe,
            Cond::IfLe => Cond::IfGt,
            Cond::IcmpEq => Cond::IcmpNe,
            Cond::IcmpNe => Cond::IcmpEq,
            Cond::IcmpLt => Cond::IcmpGe,
            Cond::IcmpGe => Cond::IcmpLt,
            Cond::IcmpGt => Cond::IcmpLe,
            Cond::IcmpLe => Cond::IcmpGt,
            Cond::AcmpEq => Cond::AcmpNe,
            Cond::AcmpNe => Cond::AcmpEq,
            Cond::IfNull => Cond::IfNonNull,
            Cond::IfNonNull => Cond::IfNull,
        }
    }
}

/// Method handle referenced by a bootstrap table entry or an argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodHandle {
    pub kind: u8,
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub interface: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapArg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(JavaString),
    Class(String),
    MethodType(String),
    Handle(MethodHandle),
    /// Dynamic constants and anything else not interpreted
    Other(u16),
}

/// The resolved form of an `invokedynamic` instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    /// Pool index of the `InvokeDynamic` entry, reused when re-encoding
    pub index: u16,
    pub name: String,
    pub descriptor: String,
    pub bootstrap_index: u16,
    pub bootstrap: MethodHandle,
    pub arguments: Vec<BootstrapArg>,
}

/// One node of a method's instruction list.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    /// Position marker used as a jump target; never executed
    Label(Label),
    /// Source line starting at the next real instruction
    LineNumber(u16),
    Const(ConstValue),
    Load { kind: ValueKind, slot: u16 },
    Store { kind: ValueKind, slot: u16 },
    Iinc { slot: u16, delta: i16 },
    Field { op: FieldOp, owner: String, name: String, descriptor: String },
    Invoke {
        kind: InvokeKind,
        owner: String,
        name: String,
        descriptor: String,
        interface: bool,
    },
    InvokeDynamic(Box<CallSite>),
    Type { op: TypeOp, class: String },
    NewArray(u8),
    MultiANewArray { class: String, dims: u8 },
    Jump(Label),
    Branch { cond: Cond, target: Label },
    TableSwitch { low: i32, high: i32, default: Label, targets: Vec<Label> },
    LookupSwitch { default: Label, pairs: Vec<(i32, Label)> },
    Stack(StackOp),
    Math { kind: NumKind, op: MathOp },
    Return(Option<ValueKind>),
    Throw,
    Jsr(Label),
    Ret(u16),
    /// Every remaining operand-less opcode (array access, conversions,
    /// comparisons, monitors, ...). Passes treat these as opaque.
    Simple(u8),
}

impl Insn {
    /// Labels and line markers are metadata; everything else executes.
    pub fn is_real(&self) -> bool {
        !matches!(self, Insn::Label(_) | Insn::LineNumber(_))
    }

    /// Whether execution can continue to the next node
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Insn::Jump(_)
                | Insn::Return(_)
                | Insn::Throw
                | Insn::TableSwitch { .. }
                | Insn::LookupSwitch { .. }
                | Insn::Ret(_)
        )
    }

    pub fn is_jump(&self) -> bool {
        !self.targets().is_empty()
    }

    /// Every label this instruction can transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump(target) | Insn::Jsr(target) | Insn::Branch { target, .. } => vec![*target],
            Insn::TableSwitch { default, targets, .. } => {
                let mut all = Vec::with_capacity(targets.len() + 1);
                all.extend_from_slice(targets);
                all.push(*default);
                all
            }
            Insn::LookupSwitch { default, pairs } => {
                let mut all: Vec<Label> = pairs.iter().map(|(_, l)| *l).collect();
                all.push(*default);
                all
            }
            _ => vec![],
        }
    }

    pub fn for_each_target_mut<F: FnMut(&mut Label)>(&mut self, mut f: F) {
        match self {
            Insn::Jump(target) | Insn::Jsr(target) | Insn::Branch { target, .. } => f(target),
            Insn::TableSwitch { default, targets, .. } => {
                targets.iter_mut().for_each(&mut f);
                f(default);
            }
            Insn::LookupSwitch { default, pairs } => {
                pairs.iter_mut().for_each(|(_, l)| f(l));
                f(default);
            }
            _ => {}
        }
    }

    pub fn as_const(&self) -> Option<&ConstValue> {
        match self {
            Insn::Const(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Label(label) => write!(f, "{}:", label),
            Insn::LineNumber(line) => write!(f, "line {}", line),
            Insn::Const(value) => write!(f, "push {}", value),
            Insn::Load { kind, slot } => write!(f, "{}load {}", kind.prefix(), slot),
            Insn::Store { kind, slot } => write!(f, "{}store {}", kind.prefix(), slot),
            Insn::Iinc { slot, delta } => write!(f, "iinc {} {}", slot, delta),
            Insn::Field { op, owner, name, descriptor } => {
                write!(f, "{:?} {}.{} {}", op, owner, name, descriptor)
            }
            Insn::Invoke { kind, owner, name, descriptor, .. } => {
                write!(f, "invoke{:?} {}.{}{}", kind, owner, name, descriptor)
            }
            Insn::InvokeDynamic(site) => write!(f, "invokedynamic {}{}", site.name, site.descriptor),
            Insn::Type { op, class } => write!(f, "{:?} {}", op, class),
            Insn::NewArray(ty) => write!(f, "newarray {}", ty),
            Insn::MultiANewArray { class, dims } => write!(f, "multianewarray {} {}", class, dims),
            Insn::Jump(target) => write!(f, "goto {}", target),
            Insn::Branch { cond, target } => write!(f, "{:?} {}", cond, target),
            Insn::TableSwitch { low, high, .. } => write!(f, "tableswitch [{}, {}]", low, high),
            Insn::LookupSwitch { pairs, .. } => write!(f, "lookupswitch ({} keys)", pairs.len()),
            Insn::Stack(op) => write!(f, "{:?}", op),
            Insn::Math { kind, op } => write!(f, "{}{}", kind.prefix(), op.name()),
            Insn::Return(Some(kind)) => write!(f, "{}return", kind.prefix()),
            Insn::Return(None) => write!(f, "return"),
            Insn::Throw => write!(f, "athrow"),
            Insn::Jsr(target) => write!(f, "jsr {}", target),
            Insn::Ret(slot) => write!(f, "ret {}", slot),
            Insn::Simple(opcode) => write!(f, "{}", opcodes::mnemonic(*opcode)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_targets_include_default() {
        let insn = Insn::LookupSwitch {
            default: Label(9),
            pairs: vec![(1, Label(1)), (2, Label(2))],
        };
        assert_eq!(insn.targets(), vec![Label(1), Label(2), Label(9)]);
        assert!(!insn.falls_through());
    }

    #[test]
    fn retargeting_touches_every_reference() {
        let mut insn = Insn::TableSwitch {
            low: 0,
            high: 1,
            default: Label(3),
            targets: vec![Label(3), Label(4)],
        };
        insn.for_each_target_mut(|l| {
            if *l == Label(3) {
                *l = Label(7)
            }
        });
        assert_eq!(insn.targets(), vec![Label(7), Label(4), Label(7)]);
    }

    #[test]
    fn cond_opcodes_are_consistent() {
        for opcode in opcodes::IFEQ..=opcodes::IF_ACMPNE {
            let cond = Cond::from_opcode(opcode).unwrap();
            assert_eq!(cond.opcode(), opcode);
            assert_eq!(cond.invert().invert(), cond);
        }
        assert_eq!(Cond::IfNull.operand_count(), 1);
        assert_eq!(Cond::IcmpLe.operand_count(), 2);
    }
}
