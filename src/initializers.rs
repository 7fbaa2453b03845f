//! Junk in initializers: sequences obfuscators plant in `<clinit>` to fill
//! fields nobody reads, and throwaway exception allocations in constructors.

use std::collections::HashSet;

use log::{debug, trace};

use crate::cleanup::{read_fields, referenced_members};
use crate::code::{InsnId, Label, MethodBody};
use crate::descriptor::MethodDescriptor;
use crate::insn::{ConstValue, FieldOp, Insn, InvokeKind, StackOp, TypeOp};
use crate::opcodes;
use crate::pass::{PassContext, UnitPass};
use crate::unit::CompiledUnit;

const ASCII_ART_FIELD: &str = "nothing_to_see_here";
const LONGEST_SEQUENCE: usize = 4096;

/// Real instructions from `start` on, stopping at the first label something
/// jumps to.
fn straight_run(body: &MethodBody, start: InsnId, referenced: &HashSet<Label>) -> Vec<InsnId> {
    let mut run = vec![];
    let mut cur = Some(start);
    while let Some(id) = cur {
        match body.insns.get(id) {
            Some(Insn::LineNumber(_)) => {}
            Some(Insn::Label(label)) if !referenced.contains(label) => {}
            Some(Insn::Label(_)) | None => break,
            Some(_) => run.push(id),
        }
        if run.len() == LONGEST_SEQUENCE {
            break;
        }
        cur = body.insns.next(id);
    }
    run
}

fn is_call(insn: &Insn, kind: InvokeKind, owner: &str, name: &str) -> bool {
    matches!(insn, Insn::Invoke { kind: k, owner: o, name: n, .. } if *k == kind && o == owner && n == name)
}

/// The field a `putstatic` into the unit itself writes.
fn own_static_store<'a>(insn: &'a Insn, unit_name: &str) -> Option<(&'a str, &'a str)> {
    match insn {
        Insn::Field {
            op: FieldOp::PutStatic,
            owner,
            name,
            descriptor,
        } if owner == unit_name => Some((name.as_str(), descriptor.as_str())),
        _ => None,
    }
}

/// `n; anewarray String; (dup; i; "line"; aastore)*; putstatic nothing_to_see_here`
fn ascii_art(insns: &[&Insn], unit_name: &str) -> Option<(usize, String, String)> {
    match insns {
        [Insn::Const(ConstValue::Int(_)), Insn::Type {
            op: TypeOp::ANewArray,
            class,
        }, ..]
            if class == "java/lang/String" => {}
        _ => return None,
    }
    let mut at = 2;
    while let [Insn::Stack(StackOp::Dup), Insn::Const(ConstValue::Int(_)), Insn::Const(ConstValue::Str(_)), Insn::Simple(opcodes::AASTORE), ..] =
        insns.get(at..)?
    {
        at += 4;
    }
    match own_static_store(insns.get(at)?, unit_name)? {
        (ASCII_ART_FIELD, descriptor) if descriptor == "[Ljava/lang/String;" => {
            Some((at + 1, ASCII_ART_FIELD.to_string(), descriptor.to_string()))
        }
        _ => None,
    }
}

/// `provider(); ByteBuffer.wrap; asCharBuffer; toString; putstatic`
fn char_buffer_field(insns: &[&Insn], unit_name: &str) -> Option<(usize, String, String)> {
    match insns {
        [Insn::Invoke {
            kind: InvokeKind::Static,
            owner,
            descriptor,
            ..
        }, wrap, as_chars, to_string, store, ..]
            if owner == unit_name
                && descriptor == "()[B"
                && is_call(wrap, InvokeKind::Static, "java/nio/ByteBuffer", "wrap")
                && is_call(as_chars, InvokeKind::Virtual, "java/nio/ByteBuffer", "asCharBuffer")
                && is_call(to_string, InvokeKind::Virtual, "java/nio/CharBuffer", "toString") =>
        {
            let (name, descriptor) = own_static_store(store, unit_name)?;
            Some((5, name.to_string(), descriptor.to_string()))
        }
        _ => None,
    }
}

/// `new Random(seed)`, optionally followed by `nextInt()` or `nextInt(n)`,
/// stored into a field.
fn seeded_random(insns: &[&Insn], unit_name: &str) -> Option<(usize, String, String)> {
    let mut at = match insns {
        [Insn::Type { op: TypeOp::New, class }, Insn::Stack(StackOp::Dup), Insn::Const(ConstValue::Long(_)), init, ..]
            if class == "java/util/Random" && is_call(init, InvokeKind::Special, "java/util/Random", "<init>") =>
        {
            4
        }
        _ => return None,
    };
    match insns.get(at..)? {
        [Insn::Const(ConstValue::Int(_)), next, ..] if is_call(next, InvokeKind::Virtual, "java/util/Random", "nextInt") => {
            at += 2
        }
        [next, ..] if is_call(next, InvokeKind::Virtual, "java/util/Random", "nextInt") => at += 1,
        _ => {}
    }
    let (name, descriptor) = own_static_store(insns.get(at)?, unit_name)?;
    Some((at + 1, name.to_string(), descriptor.to_string()))
}

/// Only a `return` is left.
fn is_empty_initializer(body: &MethodBody) -> bool {
    body.try_catch.is_empty()
        && body
            .insns
            .iter()
            .filter(|(_, insn)| insn.is_real())
            .all(|(_, insn)| *insn == Insn::Return(None))
}

/// Strips junk field initialisation from `<clinit>`: ASCII art arrays,
/// `ByteBuffer` round trips and seeded `Random` values, each only when the
/// field it fills is never read. An initializer left with nothing but a
/// `return` is removed.
pub struct StaticInitializerCleaner;

impl UnitPass for StaticInitializerCleaner {
    fn name(&self) -> &'static str {
        "static-initializer"
    }

    fn run(&self, unit: &mut CompiledUnit, _ctx: &mut PassContext) -> usize {
        let reads = read_fields(unit);
        let unit_name = unit.name.clone();
        let clinit = match unit
            .methods
            .iter_mut()
            .find(|m| m.name == "<clinit>" && m.descriptor == "()V")
            .and_then(|m| m.body.as_mut())
        {
            Some(body) => body,
            None => return 0,
        };

        let referenced = clinit.referenced_labels();
        let mut changes = 0;
        let mut emptied = vec![];
        for id in clinit.insns.ids() {
            if !clinit.insns.contains(id) || !clinit.insns.get(id).map_or(false, Insn::is_real) {
                continue;
            }
            let run = straight_run(clinit, id, &referenced);
            let insns: Vec<&Insn> = run.iter().filter_map(|id| clinit.insns.get(*id)).collect();
            let found = ascii_art(&insns, &unit_name)
                .or_else(|| char_buffer_field(&insns, &unit_name))
                .or_else(|| seeded_random(&insns, &unit_name));
            let (len, name, descriptor) = match found {
                Some(found) => found,
                None => continue,
            };
            if reads.contains(&(name.clone(), descriptor.clone())) {
                continue;
            }

            trace!("{} | dropping {} instructions filling {}", unit_name, len, name);
            for id in &run[..len] {
                clinit.insns.remove(*id);
            }
            emptied.push((name, descriptor));
            changes += 1;
        }

        if is_empty_initializer(clinit) {
            changes += unit.remove_methods(|m| m.name == "<clinit>" && m.descriptor == "()V");
        }
        if !emptied.is_empty() {
            let (fields, _) = referenced_members(unit);
            changes += unit.remove_fields(|f| {
                let key = (f.name.clone(), f.descriptor.clone());
                emptied.contains(&key) && !fields.contains(&key)
            });
        }

        if changes > 0 {
            debug!("{} | cleaned up the static initializer ({} changes)", unit.name, changes);
        }
        changes
    }
}

/// Exception types whose constructors have no side effects.
const THROWAWAY_TYPES: [&str; 3] = ["java/lang/Throwable", "java/lang/Exception", "java/lang/RuntimeException"];

const SUSPICIOUS_CALLS: [(&str, &str); 6] = [
    ("java/lang/System", "exit"),
    ("java/lang/Runtime", "exit"),
    ("java/lang/Runtime", "halt"),
    ("java/lang/Class", "forName"),
    ("java/lang/Class", "getDeclaredMethod"),
    ("java/lang/System", "setSecurityManager"),
];

/// `new T; dup; <literals>; invokespecial T.<init>; pop`
fn throwaway_allocation(insns: &[&Insn]) -> Option<usize> {
    let class = match insns {
        [Insn::Type { op: TypeOp::New, class }, Insn::Stack(StackOp::Dup), ..] if THROWAWAY_TYPES.contains(&class.as_str()) => {
            class
        }
        _ => return None,
    };
    let literals = insns[2..]
        .iter()
        .take_while(|insn| matches!(insn, Insn::Const(value) if !matches!(value, ConstValue::Pooled { .. })))
        .count();
    let at = 2 + literals;
    match insns.get(at..)? {
        [Insn::Invoke {
            kind: InvokeKind::Special,
            owner,
            name,
            descriptor,
            ..
        }, Insn::Stack(StackOp::Pop), ..]
            if owner == class
                && name == "<init>"
                && MethodDescriptor::parse(descriptor).map_or(false, |d| d.params.len() == literals) =>
        {
            Some(at + 2)
        }
        _ => None,
    }
}

/// Removes exceptions constructors allocate and drop straight away after
/// the super or this call.
pub struct ConstructorCleaner;

impl UnitPass for ConstructorCleaner {
    fn name(&self) -> &'static str {
        "constructor-junk"
    }

    fn run(&self, unit: &mut CompiledUnit, _ctx: &mut PassContext) -> usize {
        let unit_name = unit.name.clone();
        let super_name = unit.super_name.clone().unwrap_or_default();
        let mut changes = 0;

        for method in unit.methods.iter_mut().filter(|m| m.name == "<init>") {
            let body = match method.body.as_mut() {
                Some(body) => body,
                None => continue,
            };
            let referenced = body.referenced_labels();
            let mut initialized = false;

            for id in body.insns.ids() {
                let insn = match body.insns.get(id) {
                    Some(insn) => insn,
                    None => continue,
                };
                if let Insn::Invoke { kind, owner, name, .. } = insn {
                    let delegates = *owner == super_name || *owner == unit_name;
                    if !initialized && *kind == InvokeKind::Special && name == "<init>" && delegates {
                        initialized = true;
                        continue;
                    }
                    if SUSPICIOUS_CALLS.iter().any(|(o, n)| o == owner && n == name) {
                        debug!("{} | constructor {} calls {}.{}", unit_name, method.descriptor, owner, name);
                    }
                }
                if !initialized {
                    continue;
                }

                let run = straight_run(body, id, &referenced);
                let insns: Vec<&Insn> = run.iter().filter_map(|id| body.insns.get(*id)).collect();
                if let Some(len) = throwaway_allocation(&insns) {
                    trace!("{} | constructor drops a throwaway allocation", unit_name);
                    for id in &run[..len] {
                        body.insns.remove(*id);
                    }
                    changes += 1;
                }
            }
        }

        if changes > 0 {
            debug!("{} | cleaned {} constructor obfuscations", unit_name, changes);
        }
        changes
    }
}
