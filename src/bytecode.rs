//! Conversion between raw `Code` attributes and [`MethodBody`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::trace;

use crate::classfile::{
    parse_line_numbers, parse_local_variables, write_line_numbers, write_local_variables, AttributeInfo,
    CodeAttribute, LineNumberEntry, RawBootstrapMethod, RawExceptionEntry, RawLocalVariable,
};
use crate::code::{ExceptionRange, Label, LocalVariable, MethodBody};
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::MethodDescriptor;
use crate::error::Error;
use crate::insn::*;
use crate::mutf8::JavaString;
use crate::opcodes::*;

const LOCAL_KINDS: [ValueKind; 5] = [
    ValueKind::Int,
    ValueKind::Long,
    ValueKind::Float,
    ValueKind::Double,
    ValueKind::Ref,
];
const NUM_KINDS: [NumKind; 4] = [NumKind::Int, NumKind::Long, NumKind::Float, NumKind::Double];
const ARITH_OPS: [MathOp; 6] = [
    MathOp::Add,
    MathOp::Sub,
    MathOp::Mul,
    MathOp::Div,
    MathOp::Rem,
    MathOp::Neg,
];
const BITWISE_OPS: [MathOp; 6] = [
    MathOp::Shl,
    MathOp::Shr,
    MathOp::Ushr,
    MathOp::And,
    MathOp::Or,
    MathOp::Xor,
];
const STACK_OPS: [StackOp; 9] = [
    StackOp::Pop,
    StackOp::Pop2,
    StackOp::Dup,
    StackOp::DupX1,
    StackOp::DupX2,
    StackOp::Dup2,
    StackOp::Dup2X1,
    StackOp::Dup2X2,
    StackOp::Swap,
];

fn u8_at(code: &[u8], pos: usize) -> Result<u8, Error> {
    code.get(pos).copied().ok_or(Error::TruncatedCode)
}

fn u16_at(code: &[u8], pos: usize) -> Result<u16, Error> {
    Ok(BigEndian::read_u16(code.get(pos..pos + 2).ok_or(Error::TruncatedCode)?))
}

fn i16_at(code: &[u8], pos: usize) -> Result<i16, Error> {
    Ok(BigEndian::read_i16(code.get(pos..pos + 2).ok_or(Error::TruncatedCode)?))
}

fn i32_at(code: &[u8], pos: usize) -> Result<i32, Error> {
    Ok(BigEndian::read_i32(code.get(pos..pos + 4).ok_or(Error::TruncatedCode)?))
}

fn loadable_constant(pool: &ConstantPool, index: u16, wide: bool) -> Result<ConstValue, Error> {
    Ok(match pool.get(index)? {
        Constant::Integer(v) => ConstValue::Int(*v),
        Constant::Float(bits) => ConstValue::Float(f32::from_bits(*bits)),
        Constant::Long(v) => ConstValue::Long(*v),
        Constant::Double(bits) => ConstValue::Double(f64::from_bits(*bits)),
        Constant::String(_) => ConstValue::Str(pool.string(index)?),
        Constant::Class(_) => ConstValue::Type(pool.class_name(index)?),
        Constant::MethodType(desc) => ConstValue::MethodType(pool.utf8_str(*desc)?),
        _ => ConstValue::Pooled { index, wide },
    })
}

pub(crate) fn method_handle(pool: &ConstantPool, index: u16) -> Result<MethodHandle, Error> {
    match pool.get(index)? {
        Constant::MethodHandle { kind, reference } => {
            let member = pool.member_ref(*reference)?;
            Ok(MethodHandle {
                kind: *kind,
                owner: member.owner,
                name: member.name,
                descriptor: member.descriptor,
                interface: member.interface,
            })
        }
        _ => Err(Error::UnexpectedConstant {
            index,
            expected: "MethodHandle",
        }),
    }
}

fn bootstrap_arg(pool: &ConstantPool, index: u16) -> Result<BootstrapArg, Error> {
    Ok(match pool.get(index)? {
        Constant::Integer(v) => BootstrapArg::Int(*v),
        Constant::Float(bits) => BootstrapArg::Float(f32::from_bits(*bits)),
        Constant::Long(v) => BootstrapArg::Long(*v),
        Constant::Double(bits) => BootstrapArg::Double(f64::from_bits(*bits)),
        Constant::String(_) => BootstrapArg::Str(pool.string(index)?),
        Constant::Class(_) => BootstrapArg::Class(pool.class_name(index)?),
        Constant::MethodType(desc) => BootstrapArg::MethodType(pool.utf8_str(*desc)?),
        Constant::MethodHandle { .. } => BootstrapArg::Handle(method_handle(pool, index)?),
        _ => BootstrapArg::Other(index),
    })
}

fn call_site(pool: &ConstantPool, bootstrap: &[RawBootstrapMethod], index: u16) -> Result<CallSite, Error> {
    let (bootstrap_index, nat) = match pool.get(index)? {
        Constant::InvokeDynamic {
            bootstrap,
            name_and_type,
        } => (*bootstrap, *name_and_type),
        _ => {
            return Err(Error::UnexpectedConstant {
                index,
                expected: "InvokeDynamic",
            })
        }
    };
    let (name, descriptor) = pool.name_and_type(nat)?;
    let entry = bootstrap
        .get(bootstrap_index as usize)
        .ok_or(Error::InvalidConstantIndex(bootstrap_index))?;

    Ok(CallSite {
        index,
        name,
        descriptor,
        bootstrap_index,
        bootstrap: method_handle(pool, entry.method_ref)?,
        arguments: entry
            .arguments
            .iter()
            .map(|arg| bootstrap_arg(pool, *arg))
            .collect::<Result<Vec<_>, _>>()?,
    })
}

/// Decodes the instruction at `pos`. Branch offsets are handed to `target`,
/// which turns an absolute offset into a label.
fn decode_at<F>(
    code: &[u8],
    pos: usize,
    pool: &ConstantPool,
    bootstrap: &[RawBootstrapMethod],
    target: &mut F,
) -> Result<(Insn, usize), Error>
where
    F: FnMut(usize, i64) -> Result<Label, Error>,
{
    let opcode = code[pos];
    let rel = |disp: i64| pos as i64 + disp;

    let decoded = match opcode {
        NOP => (Insn::Simple(NOP), 1),
        ACONST_NULL => (Insn::Const(ConstValue::Null), 1),
        ICONST_M1..=ICONST_5 => (Insn::Const(ConstValue::Int(opcode as i32 - ICONST_0 as i32)), 1),
        LCONST_0 | LCONST_1 => (Insn::Const(ConstValue::Long((opcode - LCONST_0) as i64)), 1),
        FCONST_0..=FCONST_2 => (Insn::Const(ConstValue::Float((opcode - FCONST_0) as f32)), 1),
        DCONST_0 | DCONST_1 => (Insn::Const(ConstValue::Double((opcode - DCONST_0) as f64)), 1),
        BIPUSH => (Insn::Const(ConstValue::Int(u8_at(code, pos + 1)? as i8 as i32)), 2),
        SIPUSH => (Insn::Const(ConstValue::Int(i16_at(code, pos + 1)? as i32)), 3),
        LDC => (
            Insn::Const(loadable_constant(pool, u8_at(code, pos + 1)? as u16, false)?),
            2,
        ),
        LDC_W | LDC2_W => (
            Insn::Const(loadable_constant(pool, u16_at(code, pos + 1)?, opcode == LDC2_W)?),
            3,
        ),
        ILOAD..=ALOAD => (
            Insn::Load {
                kind: LOCAL_KINDS[(opcode - ILOAD) as usize],
                slot: u8_at(code, pos + 1)? as u16,
            },
            2,
        ),
        ILOAD_0..=ALOAD_3 => (
            Insn::Load {
                kind: LOCAL_KINDS[((opcode - ILOAD_0) / 4) as usize],
                slot: ((opcode - ILOAD_0) % 4) as u16,
            },
            1,
        ),
        ISTORE..=ASTORE => (
            Insn::Store {
                kind: LOCAL_KINDS[(opcode - ISTORE) as usize],
                slot: u8_at(code, pos + 1)? as u16,
            },
            2,
        ),
        ISTORE_0..=ASTORE_3 => (
            Insn::Store {
                kind: LOCAL_KINDS[((opcode - ISTORE_0) / 4) as usize],
                slot: ((opcode - ISTORE_0) % 4) as u16,
            },
            1,
        ),
        IALOAD..=SALOAD | IASTORE..=SASTORE => (Insn::Simple(opcode), 1),
        POP..=SWAP => (Insn::Stack(STACK_OPS[(opcode - POP) as usize]), 1),
        IADD..=DNEG => (
            Insn::Math {
                kind: NUM_KINDS[((opcode - IADD) % 4) as usize],
                op: ARITH_OPS[((opcode - IADD) / 4) as usize],
            },
            1,
        ),
        ISHL..=LXOR => (
            Insn::Math {
                kind: if (opcode - ISHL) % 2 == 0 {
                    NumKind::Int
                } else {
                    NumKind::Long
                },
                op: BITWISE_OPS[((opcode - ISHL) / 2) as usize],
            },
            1,
        ),
        IINC => (
            Insn::Iinc {
                slot: u8_at(code, pos + 1)? as u16,
                delta: u8_at(code, pos + 2)? as i8 as i16,
            },
            3,
        ),
        I2L..=DCMPG => (Insn::Simple(opcode), 1),
        IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL => {
            let cond = Cond::from_opcode(opcode).ok_or(Error::UnknownOpcode { opcode, offset: pos })?;
            (
                Insn::Branch {
                    cond,
                    target: target(pos, rel(i16_at(code, pos + 1)? as i64))?,
                },
                3,
            )
        }
        GOTO => (Insn::Jump(target(pos, rel(i16_at(code, pos + 1)? as i64))?), 3),
        JSR => (Insn::Jsr(target(pos, rel(i16_at(code, pos + 1)? as i64))?), 3),
        GOTO_W => (Insn::Jump(target(pos, rel(i32_at(code, pos + 1)? as i64))?), 5),
        JSR_W => (Insn::Jsr(target(pos, rel(i32_at(code, pos + 1)? as i64))?), 5),
        RET => (Insn::Ret(u8_at(code, pos + 1)? as u16), 2),
        TABLESWITCH => {
            let base = (pos + 4) & !3;
            let default = target(pos, rel(i32_at(code, base)? as i64))?;
            let low = i32_at(code, base + 4)?;
            let high = i32_at(code, base + 8)?;
            let count = high as i64 - low as i64 + 1;
            if count < 0 || count as usize * 4 > code.len() {
                return Err(Error::TruncatedCode);
            }
            let mut targets = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                targets.push(target(pos, rel(i32_at(code, base + 12 + i * 4)? as i64))?);
            }
            (
                Insn::TableSwitch {
                    low,
                    high,
                    default,
                    targets,
                },
                base + 12 + count as usize * 4 - pos,
            )
        }
        LOOKUPSWITCH => {
            let base = (pos + 4) & !3;
            let default = target(pos, rel(i32_at(code, base)? as i64))?;
            let npairs = i32_at(code, base + 4)?;
            if npairs < 0 || npairs as usize * 8 > code.len() {
                return Err(Error::TruncatedCode);
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for i in 0..npairs as usize {
                let key = i32_at(code, base + 8 + i * 8)?;
                pairs.push((key, target(pos, rel(i32_at(code, base + 12 + i * 8)? as i64))?));
            }
            (Insn::LookupSwitch { default, pairs }, base + 8 + npairs as usize * 8 - pos)
        }
        IRETURN..=ARETURN => (Insn::Return(Some(LOCAL_KINDS[(opcode - IRETURN) as usize])), 1),
        RETURN => (Insn::Return(None), 1),
        GETSTATIC..=PUTFIELD => {
            let member = pool.member_ref(u16_at(code, pos + 1)?)?;
            let op = match opcode {
                GETSTATIC => FieldOp::GetStatic,
                PUTSTATIC => FieldOp::PutStatic,
                GETFIELD => FieldOp::GetField,
                _ => FieldOp::PutField,
            };
            (
                Insn::Field {
                    op,
                    owner: member.owner,
                    name: member.name,
                    descriptor: member.descriptor,
                },
                3,
            )
        }
        INVOKEVIRTUAL..=INVOKEINTERFACE => {
            let member = pool.member_ref(u16_at(code, pos + 1)?)?;
            let kind = match opcode {
                INVOKEVIRTUAL => InvokeKind::Virtual,
                INVOKESPECIAL => InvokeKind::Special,
                INVOKESTATIC => InvokeKind::Static,
                _ => InvokeKind::Interface,
            };
            (
                Insn::Invoke {
                    kind,
                    owner: member.owner,
                    name: member.name,
                    descriptor: member.descriptor,
                    interface: member.interface,
                },
                if opcode == INVOKEINTERFACE { 5 } else { 3 },
            )
        }
        INVOKEDYNAMIC => (
            Insn::InvokeDynamic(Box::new(call_site(pool, bootstrap, u16_at(code, pos + 1)?)?)),
            5,
        ),
        NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
            let op = match opcode {
                NEW => TypeOp::New,
                ANEWARRAY => TypeOp::ANewArray,
                CHECKCAST => TypeOp::CheckCast,
                _ => TypeOp::InstanceOf,
            };
            (
                Insn::Type {
                    op,
                    class: pool.class_name(u16_at(code, pos + 1)?)?,
                },
                3,
            )
        }
        NEWARRAY => (Insn::NewArray(u8_at(code, pos + 1)?), 2),
        ARRAYLENGTH | MONITORENTER | MONITOREXIT => (Insn::Simple(opcode), 1),
        ATHROW => (Insn::Throw, 1),
        MULTIANEWARRAY => (
            Insn::MultiANewArray {
                class: pool.class_name(u16_at(code, pos + 1)?)?,
                dims: u8_at(code, pos + 3)?,
            },
            4,
        ),
        WIDE => {
            let inner = u8_at(code, pos + 1)?;
            let slot = u16_at(code, pos + 2)?;
            match inner {
                ILOAD..=ALOAD => (
                    Insn::Load {
                        kind: LOCAL_KINDS[(inner - ILOAD) as usize],
                        slot,
                    },
                    4,
                ),
                ISTORE..=ASTORE => (
                    Insn::Store {
                        kind: LOCAL_KINDS[(inner - ISTORE) as usize],
                        slot,
                    },
                    4,
                ),
                RET => (Insn::Ret(slot), 4),
                IINC => (
                    Insn::Iinc {
                        slot,
                        delta: i16_at(code, pos + 4)?,
                    },
                    6,
                ),
                _ => {
                    return Err(Error::UnknownOpcode {
                        opcode: inner,
                        offset: pos + 1,
                    })
                }
            }
        }
        _ => return Err(Error::UnknownOpcode { opcode, offset: pos }),
    };

    if pos + decoded.1 > code.len() {
        return Err(Error::TruncatedCode);
    }

    Ok(decoded)
}

/// Decodes a `Code` attribute into an instruction list. Every branch target
/// and exception-table boundary must fall on an instruction boundary.
pub fn disassemble(
    code: &CodeAttribute,
    pool: &ConstantPool,
    bootstrap: &[RawBootstrapMethod],
) -> Result<MethodBody, Error> {
    let bytes = code.code.as_slice();

    // First sweep: instruction boundaries and every branch target
    let mut boundaries = BTreeSet::new();
    let mut wanted: Vec<(usize, i64)> = vec![];
    let mut pos = 0;
    while pos < bytes.len() {
        boundaries.insert(pos);
        let (_, len) = decode_at(bytes, pos, pool, bootstrap, &mut |from, to| {
            wanted.push((from, to));
            Ok(Label(0))
        })?;
        pos += len;
    }
    // code end is a valid exclusive boundary for ranges and locals
    boundaries.insert(bytes.len());

    let mut body = MethodBody::new(code.max_stack, code.max_locals);
    let mut labels: BTreeMap<usize, Label> = BTreeMap::new();
    let mut label_for = |offset: usize, body: &mut MethodBody| -> Label {
        *labels.entry(offset).or_insert_with(|| body.insns.new_label())
    };

    for (from, to) in wanted {
        if to < 0 || to as usize >= bytes.len() || !boundaries.contains(&(to as usize)) {
            return Err(Error::InvalidBranchTarget { from, to });
        }
        label_for(to as usize, &mut body);
    }

    for entry in &code.exception_table {
        for offset in [entry.start_pc, entry.end_pc, entry.handler_pc] {
            if !boundaries.contains(&(offset as usize)) {
                return Err(Error::InvalidBranchTarget {
                    from: entry.handler_pc as usize,
                    to: offset as i64,
                });
            }
        }
        let catch_type = if entry.catch_type == 0 {
            None
        } else {
            Some(pool.class_name(entry.catch_type)?)
        };
        let range = ExceptionRange {
            start: label_for(entry.start_pc as usize, &mut body),
            end: label_for(entry.end_pc as usize, &mut body),
            handler: label_for(entry.handler_pc as usize, &mut body),
            catch_type,
        };
        body.try_catch.push(range);
    }

    let mut lines: HashMap<usize, Vec<u16>> = HashMap::new();
    for attr in &code.attributes {
        match pool.utf8_str(attr.name_index)?.as_str() {
            "LineNumberTable" => {
                for entry in parse_line_numbers(&attr.data)? {
                    if boundaries.contains(&(entry.start_pc as usize)) {
                        lines.entry(entry.start_pc as usize).or_default().push(entry.line);
                    }
                }
            }
            "LocalVariableTable" => {
                for local in parse_local_variables(&attr.data)? {
                    let start = local.start_pc as usize;
                    let end = start + local.length as usize;
                    // debug info only: entries that don't line up are dropped
                    if !boundaries.contains(&start) || !boundaries.contains(&end) {
                        trace!("dropping misaligned local variable entry {:?}", local);
                        continue;
                    }
                    let (name, descriptor) = match (
                        pool.utf8_str(local.name_index),
                        pool.utf8_str(local.descriptor_index),
                    ) {
                        (Ok(n), Ok(d)) => (n, d),
                        _ => continue,
                    };
                    let variable = LocalVariable {
                        name,
                        descriptor,
                        start: label_for(start, &mut body),
                        end: label_for(end, &mut body),
                        index: local.index,
                    };
                    body.locals.push(variable);
                }
            }
            _ => {}
        }
    }

    // Second sweep: emit nodes with labels resolved
    let mut pos = 0;
    while pos < bytes.len() {
        if let Some(label) = labels.get(&pos) {
            body.insns.push(Insn::Label(*label));
        }
        if let Some(numbers) = lines.get(&pos) {
            for line in numbers {
                body.insns.push(Insn::LineNumber(*line));
            }
        }
        let (insn, len) = decode_at(bytes, pos, pool, bootstrap, &mut |_, to| {
            labels.get(&(to as usize)).copied().ok_or(Error::InvalidBranchTarget { from: pos, to })
        })?;
        body.insns.push(insn);
        pos += len;
    }
    if let Some(label) = labels.get(&bytes.len()) {
        body.insns.push(Insn::Label(*label));
    }

    Ok(body)
}

/// One lowered node: either pre-encoded bytes or something whose encoding
/// depends on layout.
#[derive(Debug)]
enum Lowered {
    Mark(Label),
    Line(u16),
    Fixed(Vec<u8>),
    Branch { cond: Cond, target: Label },
    Goto { target: Label, jsr: bool },
    Table { low: i32, high: i32, default: Label, targets: Vec<Label> },
    Lookup { default: Label, pairs: Vec<(i32, Label)> },
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

impl Lowered {
    fn size(&self, offset: usize, wide: bool) -> usize {
        match self {
            Lowered::Mark(_) | Lowered::Line(_) => 0,
            Lowered::Fixed(bytes) => bytes.len(),
            // a wide conditional becomes `if!cond +8; goto_w target`
            Lowered::Branch { .. } => {
                if wide {
                    8
                } else {
                    3
                }
            }
            Lowered::Goto { .. } => {
                if wide {
                    5
                } else {
                    3
                }
            }
            Lowered::Table { targets, .. } => 1 + switch_padding(offset) + 12 + targets.len() * 4,
            Lowered::Lookup { pairs, .. } => 1 + switch_padding(offset) + 8 + pairs.len() * 8,
        }
    }
}

fn index_operand(out: &mut Vec<u8>, short: u8, long: u8, index: u16) {
    if index <= u8::MAX as u16 {
        out.push(short);
        out.push(index as u8);
    } else {
        out.push(long);
        out.extend_from_slice(&index.to_be_bytes());
    }
}

fn lower_const(value: &ConstValue, pool: &mut ConstantPool) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(3);
    match value {
        ConstValue::Int(v @ -1..=5) => out.push((ICONST_0 as i32 + v) as u8),
        ConstValue::Int(v) if i8::try_from(*v).is_ok() => {
            out.push(BIPUSH);
            out.push(*v as i8 as u8);
        }
        ConstValue::Int(v) if i16::try_from(*v).is_ok() => {
            out.push(SIPUSH);
            out.extend_from_slice(&(*v as i16).to_be_bytes());
        }
        ConstValue::Int(v) => index_operand(&mut out, LDC, LDC_W, pool.integer_index(*v)?),
        ConstValue::Long(v @ 0..=1) => out.push(LCONST_0 + *v as u8),
        ConstValue::Long(v) => {
            out.push(LDC2_W);
            out.extend_from_slice(&pool.long_index(*v)?.to_be_bytes());
        }
        ConstValue::Float(v) if [0.0f32, 1.0, 2.0].iter().any(|c| c.to_bits() == v.to_bits()) => {
            out.push(FCONST_0 + *v as u8)
        }
        ConstValue::Float(v) => index_operand(&mut out, LDC, LDC_W, pool.float_index(*v)?),
        ConstValue::Double(v) if [0.0f64, 1.0].iter().any(|c| c.to_bits() == v.to_bits()) => {
            out.push(DCONST_0 + *v as u8)
        }
        ConstValue::Double(v) => {
            out.push(LDC2_W);
            out.extend_from_slice(&pool.double_index(*v)?.to_be_bytes());
        }
        ConstValue::Str(s) => index_operand(&mut out, LDC, LDC_W, pool.string_index(s)?),
        ConstValue::Null => out.push(ACONST_NULL),
        ConstValue::Type(class) => index_operand(&mut out, LDC, LDC_W, pool.class_index(class)?),
        ConstValue::MethodType(desc) => index_operand(&mut out, LDC, LDC_W, pool.method_type_index(desc)?),
        ConstValue::Pooled { index, wide: true } => {
            out.push(LDC2_W);
            out.extend_from_slice(&index.to_be_bytes());
        }
        ConstValue::Pooled { index, wide: false } => index_operand(&mut out, LDC, LDC_W, *index),
    }
    Ok(out)
}

fn local_kind_index(kind: ValueKind) -> u8 {
    match kind {
        ValueKind::Int => 0,
        ValueKind::Long => 1,
        ValueKind::Float => 2,
        ValueKind::Double => 3,
        ValueKind::Ref => 4,
    }
}

fn lower_local(out: &mut Vec<u8>, base: u8, short_base: u8, kind: ValueKind, slot: u16) {
    let k = local_kind_index(kind);
    if slot <= 3 {
        out.push(short_base + k * 4 + slot as u8);
    } else if slot <= u8::MAX as u16 {
        out.push(base + k);
        out.push(slot as u8);
    } else {
        out.push(WIDE);
        out.push(base + k);
        out.extend_from_slice(&slot.to_be_bytes());
    }
}

fn math_opcode(kind: NumKind, op: MathOp) -> Option<u8> {
    let k = match kind {
        NumKind::Int => 0,
        NumKind::Long => 1,
        NumKind::Float => 2,
        NumKind::Double => 3,
    };
    let base = match op {
        MathOp::Add => IADD,
        MathOp::Sub => ISUB,
        MathOp::Mul => IMUL,
        MathOp::Div => IDIV,
        MathOp::Rem => IREM,
        MathOp::Neg => INEG,
        _ if k > 1 => return None,
        MathOp::Shl => ISHL,
        MathOp::Shr => ISHR,
        MathOp::Ushr => IUSHR,
        MathOp::And => IAND,
        MathOp::Or => IOR,
        MathOp::Xor => IXOR,
    };
    Some(base + k)
}

fn lower(insn: &Insn, pool: &mut ConstantPool) -> Result<Lowered, Error> {
    let mut out = Vec::with_capacity(3);
    match insn {
        Insn::Label(label) => return Ok(Lowered::Mark(*label)),
        Insn::LineNumber(line) => return Ok(Lowered::Line(*line)),
        Insn::Jump(target) => return Ok(Lowered::Goto { target: *target, jsr: false }),
        Insn::Jsr(target) => return Ok(Lowered::Goto { target: *target, jsr: true }),
        Insn::Branch { cond, target } => {
            return Ok(Lowered::Branch {
                cond: *cond,
                target: *target,
            })
        }
        Insn::TableSwitch {
            low,
            high,
            default,
            targets,
        } => {
            return Ok(Lowered::Table {
                low: *low,
                high: *high,
                default: *default,
                targets: targets.clone(),
            })
        }
        Insn::LookupSwitch { default, pairs } => {
            let mut pairs = pairs.clone();
            // keys must be sorted for the verifier
            pairs.sort_by_key(|(key, _)| *key);
            return Ok(Lowered::Lookup {
                default: *default,
                pairs,
            });
        }
        Insn::Const(value) => out = lower_const(value, pool)?,
        Insn::Load { kind, slot } => lower_local(&mut out, ILOAD, ILOAD_0, *kind, *slot),
        Insn::Store { kind, slot } => lower_local(&mut out, ISTORE, ISTORE_0, *kind, *slot),
        Insn::Iinc { slot, delta } => {
            if *slot <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                out.extend_from_slice(&[IINC, *slot as u8, *delta as i8 as u8]);
            } else {
                out.extend_from_slice(&[WIDE, IINC]);
                out.extend_from_slice(&slot.to_be_bytes());
                out.extend_from_slice(&delta.to_be_bytes());
            }
        }
        Insn::Ret(slot) => {
            if *slot <= u8::MAX as u16 {
                out.extend_from_slice(&[RET, *slot as u8]);
            } else {
                out.extend_from_slice(&[WIDE, RET]);
                out.extend_from_slice(&slot.to_be_bytes());
            }
        }
        Insn::Field {
            op,
            owner,
            name,
            descriptor,
        } => {
            out.push(match op {
                FieldOp::GetStatic => GETSTATIC,
                FieldOp::PutStatic => PUTSTATIC,
                FieldOp::GetField => GETFIELD,
                FieldOp::PutField => PUTFIELD,
            });
            out.extend_from_slice(&pool.field_ref_index(owner, name, descriptor)?.to_be_bytes());
        }
        Insn::Invoke {
            kind,
            owner,
            name,
            descriptor,
            interface,
        } => {
            let index = pool.method_ref_index(owner, name, descriptor, *interface)?;
            match kind {
                InvokeKind::Interface => {
                    let count = MethodDescriptor::parse(descriptor)?.arg_slots() + 1;
                    out.push(INVOKEINTERFACE);
                    out.extend_from_slice(&index.to_be_bytes());
                    out.push(count as u8);
                    out.push(0);
                }
                _ => {
                    out.push(match kind {
                        InvokeKind::Virtual => INVOKEVIRTUAL,
                        InvokeKind::Special => INVOKESPECIAL,
                        _ => INVOKESTATIC,
                    });
                    out.extend_from_slice(&index.to_be_bytes());
                }
            }
        }
        Insn::InvokeDynamic(site) => {
            out.push(INVOKEDYNAMIC);
            out.extend_from_slice(&site.index.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
        }
        Insn::Type { op, class } => {
            out.push(match op {
                TypeOp::New => NEW,
                TypeOp::ANewArray => ANEWARRAY,
                TypeOp::CheckCast => CHECKCAST,
                TypeOp::InstanceOf => INSTANCEOF,
            });
            out.extend_from_slice(&pool.class_index(class)?.to_be_bytes());
        }
        Insn::NewArray(ty) => out.extend_from_slice(&[NEWARRAY, *ty]),
        Insn::MultiANewArray { class, dims } => {
            out.push(MULTIANEWARRAY);
            out.extend_from_slice(&pool.class_index(class)?.to_be_bytes());
            out.push(*dims);
        }
        Insn::Stack(op) => out.push(POP + *op as u8),
        Insn::Math { kind, op } => {
            out.push(math_opcode(*kind, *op).ok_or_else(|| Error::Unencodable(insn.to_string()))?)
        }
        Insn::Return(Some(kind)) => out.push(IRETURN + local_kind_index(*kind)),
        Insn::Return(None) => out.push(RETURN),
        Insn::Throw => out.push(ATHROW),
        Insn::Simple(opcode) => out.push(*opcode),
    }

    Ok(Lowered::Fixed(out))
}

/// Encodes a method body back into a `Code` attribute, interning whatever
/// constants it needs. Line numbers and local variables are rebuilt from
/// the instruction list; other sub-attributes are not carried over.
pub fn assemble(body: &MethodBody, pool: &mut ConstantPool) -> Result<CodeAttribute, Error> {
    let lowered = body
        .insns
        .iter()
        .map(|(_, insn)| lower(insn, pool))
        .collect::<Result<Vec<_>, _>>()?;

    // Widen jumps until every displacement fits. Widening only ever grows
    // code, so this terminates.
    let mut wide = vec![false; lowered.len()];
    let (offsets, label_offsets, code_len) = loop {
        let mut offsets = Vec::with_capacity(lowered.len());
        let mut label_offsets = HashMap::new();
        let mut offset = 0usize;
        for (i, node) in lowered.iter().enumerate() {
            offsets.push(offset);
            if let Lowered::Mark(label) = node {
                label_offsets.insert(*label, offset);
            }
            offset += node.size(offset, wide[i]);
        }

        let mut changed = false;
        for (i, node) in lowered.iter().enumerate() {
            let target = match node {
                Lowered::Branch { target, .. } | Lowered::Goto { target, .. } => *target,
                _ => continue,
            };
            if wide[i] {
                continue;
            }
            let to = *label_offsets.get(&target).ok_or(Error::UnboundLabel(target.0))?;
            let disp = to as i64 - offsets[i] as i64;
            if i16::try_from(disp).is_err() {
                wide[i] = true;
                changed = true;
            }
        }

        if !changed {
            break (offsets, label_offsets, offset);
        }
    };

    if code_len > u16::MAX as usize {
        return Err(Error::CodeTooLarge);
    }

    let resolve = |label: &Label| -> Result<usize, Error> {
        label_offsets.get(label).copied().ok_or(Error::UnboundLabel(label.0))
    };

    let mut code = Vec::with_capacity(code_len);
    let mut line_numbers: Vec<LineNumberEntry> = vec![];
    for (i, node) in lowered.iter().enumerate() {
        let at = offsets[i];
        match node {
            Lowered::Mark(_) => {}
            Lowered::Line(line) => {
                if at < code_len {
                    if let Some(last) = line_numbers.last_mut().filter(|l| l.start_pc as usize == at) {
                        last.line = *line;
                    } else {
                        line_numbers.push(LineNumberEntry {
                            start_pc: at as u16,
                            line: *line,
                        });
                    }
                }
            }
            Lowered::Fixed(bytes) => code.extend_from_slice(bytes),
            Lowered::Branch { cond, target } => {
                let to = resolve(target)? as i64;
                if wide[i] {
                    code.push(cond.invert().opcode());
                    code.write_i16::<BigEndian>(8)?;
                    code.push(GOTO_W);
                    code.write_i32::<BigEndian>((to - (at as i64 + 3)) as i32)?;
                } else {
                    code.push(cond.opcode());
                    code.write_i16::<BigEndian>((to - at as i64) as i16)?;
                }
            }
            Lowered::Goto { target, jsr } => {
                let disp = resolve(target)? as i64 - at as i64;
                if wide[i] {
                    code.push(if *jsr { JSR_W } else { GOTO_W });
                    code.write_i32::<BigEndian>(disp as i32)?;
                } else {
                    code.push(if *jsr { JSR } else { GOTO });
                    code.write_i16::<BigEndian>(disp as i16)?;
                }
            }
            Lowered::Table {
                low,
                high,
                default,
                targets,
            } => {
                code.push(TABLESWITCH);
                code.extend(std::iter::repeat(0).take(switch_padding(at)));
                code.write_i32::<BigEndian>((resolve(default)? as i64 - at as i64) as i32)?;
                code.write_i32::<BigEndian>(*low)?;
                code.write_i32::<BigEndian>(*high)?;
                for target in targets {
                    code.write_i32::<BigEndian>((resolve(target)? as i64 - at as i64) as i32)?;
                }
            }
            Lowered::Lookup { default, pairs } => {
                code.push(LOOKUPSWITCH);
                code.extend(std::iter::repeat(0).take(switch_padding(at)));
                code.write_i32::<BigEndian>((resolve(default)? as i64 - at as i64) as i32)?;
                code.write_i32::<BigEndian>(pairs.len() as i32)?;
                for (key, target) in pairs {
                    code.write_i32::<BigEndian>(*key)?;
                    code.write_i32::<BigEndian>((resolve(target)? as i64 - at as i64) as i32)?;
                }
            }
        }
    }
    debug_assert_eq!(code.len(), code_len);

    let mut exception_table = Vec::with_capacity(body.try_catch.len());
    for range in &body.try_catch {
        let start = resolve(&range.start)?;
        let end = resolve(&range.end)?;
        if start >= end {
            trace!("dropping empty exception range {:?}", range);
            continue;
        }
        exception_table.push(RawExceptionEntry {
            start_pc: start as u16,
            end_pc: end as u16,
            handler_pc: resolve(&range.handler)? as u16,
            catch_type: match &range.catch_type {
                Some(class) => pool.class_index(class)?,
                None => 0,
            },
        });
    }

    let mut locals = Vec::with_capacity(body.locals.len());
    for local in &body.locals {
        let (start, end) = match (label_offsets.get(&local.start), label_offsets.get(&local.end)) {
            (Some(s), Some(e)) if s <= e => (*s, *e),
            _ => continue,
        };
        locals.push(RawLocalVariable {
            start_pc: start as u16,
            length: (end - start) as u16,
            name_index: pool.utf8_index(&local.name)?,
            descriptor_index: pool.utf8_index(&local.descriptor)?,
            index: local.index,
        });
    }

    let mut attributes = vec![];
    if !line_numbers.is_empty() {
        attributes.push(AttributeInfo {
            name_index: pool.utf8_index("LineNumberTable")?,
            data: write_line_numbers(&line_numbers)?,
        });
    }
    if !locals.is_empty() {
        attributes.push(AttributeInfo {
            name_index: pool.utf8_index("LocalVariableTable")?,
            data: write_local_variables(&locals)?,
        });
    }

    Ok(CodeAttribute {
        max_stack: body.max_stack,
        max_locals: body.max_locals,
        code,
        exception_table,
        attributes,
    })
}

/// Builds a string literal instruction; shorthand used across passes.
pub fn string_const(value: &str) -> Insn {
    Insn::Const(ConstValue::Str(JavaString::from(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::tests::insns_of;

    fn roundtrip(body: &MethodBody) -> MethodBody {
        let mut pool = ConstantPool::new();
        let code = assemble(body, &mut pool).unwrap();
        disassemble(&code, &pool, &[]).unwrap()
    }

    #[test]
    fn simple_method_survives_reassembly() {
        let mut body = MethodBody::new(2, 2);
        let exit = body.insns.new_label();
        body.insns.push(Insn::LineNumber(10));
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 1 });
        body.insns.push(Insn::Branch { cond: Cond::IfEq, target: exit });
        body.insns.push(string_const("hi"));
        body.insns.push(Insn::Invoke {
            kind: InvokeKind::Static,
            owner: "a/B".to_string(),
            name: "p".to_string(),
            descriptor: "(Ljava/lang/String;)V".to_string(),
            interface: false,
        });
        body.insns.push(Insn::Label(exit));
        body.insns.push(Insn::Return(None));

        let decoded = roundtrip(&body);
        let insns = insns_of(&decoded);
        assert_eq!(insns.len(), 7);
        assert_eq!(insns[0], Insn::LineNumber(10));
        assert!(matches!(insns[2], Insn::Branch { cond: Cond::IfEq, .. }));
        assert_eq!(insns[3], string_const("hi"));
        assert_eq!(insns[6], Insn::Return(None));
    }

    #[test]
    fn constants_pick_short_encodings() {
        let mut pool = ConstantPool::new();
        let cases: [(ConstValue, &[u8]); 4] = [
            (ConstValue::Int(-1), &[ICONST_M1]),
            (ConstValue::Int(100), &[BIPUSH, 100]),
            (ConstValue::Int(1000), &[SIPUSH, 0x03, 0xE8]),
            (ConstValue::Long(1), &[LCONST_1]),
        ];
        for (value, expected) in cases.iter() {
            assert_eq!(lower_const(value, &mut pool).unwrap(), expected.to_vec());
        }
        // -0.0 is not fconst_0
        assert_eq!(lower_const(&ConstValue::Float(-0.0), &mut pool).unwrap()[0], LDC);
    }

    #[test]
    fn long_jumps_are_widened() {
        let mut body = MethodBody::new(1, 1);
        let far = body.insns.new_label();
        body.insns.push(Insn::Jump(far));
        for _ in 0..40_000 {
            body.insns.push(Insn::Simple(NOP));
        }
        body.insns.push(Insn::Label(far));
        body.insns.push(Insn::Return(None));

        let mut pool = ConstantPool::new();
        let code = assemble(&body, &mut pool).unwrap();
        assert_eq!(code.code[0], GOTO_W);
        assert_eq!(code.code.len(), 5 + 40_000 + 1);

        let decoded = disassemble(&code, &pool, &[]).unwrap();
        let first = decoded.insns.first().unwrap();
        assert!(matches!(decoded.insns.get(first), Some(Insn::Jump(_))));
    }

    #[test]
    fn far_conditionals_jump_over_goto_w() {
        let mut body = MethodBody::new(1, 1);
        let far = body.insns.new_label();
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 0 });
        body.insns.push(Insn::Branch { cond: Cond::IfNe, target: far });
        for _ in 0..40_000 {
            body.insns.push(Insn::Simple(NOP));
        }
        body.insns.push(Insn::Label(far));
        body.insns.push(Insn::Return(None));

        let mut pool = ConstantPool::new();
        let code = assemble(&body, &mut pool).unwrap();
        assert_eq!(code.code[1], IFEQ);
        assert_eq!(&code.code[2..4], &[0, 8]);
        assert_eq!(code.code[4], GOTO_W);
    }

    #[test]
    fn switch_padding_and_empty_ranges() {
        let mut body = MethodBody::new(1, 1);
        let a = body.insns.new_label();
        let b = body.insns.new_label();
        let start = body.insns.push_label();
        let end = body.insns.push_label();
        body.insns.push(Insn::Const(ConstValue::Int(1)));
        body.insns.push(Insn::TableSwitch {
            low: 0,
            high: 1,
            default: b,
            targets: vec![a, b],
        });
        body.insns.push(Insn::Label(a));
        body.insns.push(Insn::Return(None));
        body.insns.push(Insn::Label(b));
        body.insns.push(Insn::Return(None));
        body.try_catch.push(ExceptionRange {
            start,
            end,
            handler: a,
            catch_type: None,
        });

        let mut pool = ConstantPool::new();
        let code = assemble(&body, &mut pool).unwrap();
        // iconst_1 at 0, tableswitch at 1 needs 2 padding bytes
        assert_eq!(code.code[1], TABLESWITCH);
        assert_eq!(&code.code[2..4], &[0, 0]);
        assert!(code.exception_table.is_empty());

        let decoded = disassemble(&code, &pool, &[]).unwrap();
        assert!(decoded
            .insns
            .iter()
            .any(|(_, i)| matches!(i, Insn::TableSwitch { low: 0, high: 1, .. })));
    }

    #[test]
    fn branch_into_operand_is_rejected() {
        // goto +1 lands inside its own operand
        let code = CodeAttribute {
            max_stack: 0,
            max_locals: 0,
            code: vec![GOTO, 0, 1, RETURN],
            exception_table: vec![],
            attributes: vec![],
        };
        assert!(matches!(
            disassemble(&code, &ConstantPool::new(), &[]),
            Err(Error::InvalidBranchTarget { from: 0, to: 1 })
        ));
    }

    #[test]
    fn wide_locals_round_trip() {
        let mut body = MethodBody::new(2, 400);
        body.insns.push(Insn::Iinc { slot: 300, delta: 1000 });
        body.insns.push(Insn::Load { kind: ValueKind::Long, slot: 300 });
        body.insns.push(Insn::Return(Some(ValueKind::Long)));
        let decoded = roundtrip(&body);
        assert_eq!(insns_of(&decoded), insns_of(&body));
    }
}
