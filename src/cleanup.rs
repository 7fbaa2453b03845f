use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::insn::{BootstrapArg, ConstValue, FieldOp, Insn, InvokeKind, ValueKind};
use crate::pass::{PassContext, UnitPass};
use crate::unit::{AccessFlags, CompiledUnit, Field, Method};

/// Member names referenced from inside `unit`, as (name, descriptor).
pub(crate) fn referenced_members(unit: &CompiledUnit) -> (HashSet<(String, String)>, HashSet<(String, String)>) {
    let mut fields = HashSet::new();
    let mut methods = HashSet::new();

    for body in unit.methods.iter().filter_map(|m| m.body.as_ref()) {
        for (_, insn) in body.insns.iter() {
            match insn {
                Insn::Field {
                    owner, name, descriptor, ..
                } if *owner == unit.name => {
                    fields.insert((name.clone(), descriptor.clone()));
                }
                Insn::Invoke {
                    owner, name, descriptor, ..
                } if *owner == unit.name => {
                    methods.insert((name.clone(), descriptor.clone()));
                }
                Insn::InvokeDynamic(site) => {
                    let handles = std::iter::once(&site.bootstrap).chain(site.arguments.iter().filter_map(|arg| match arg {
                        BootstrapArg::Handle(handle) => Some(handle),
                        _ => None,
                    }));
                    for handle in handles.filter(|h| h.owner == unit.name) {
                        // kinds 1-4 are field handles
                        let key = (handle.name.clone(), handle.descriptor.clone());
                        if handle.kind <= 4 {
                            fields.insert(key);
                        } else {
                            methods.insert(key);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    (fields, methods)
}

/// Own fields something in `unit` reads. Field handles count as reads.
pub(crate) fn read_fields(unit: &CompiledUnit) -> HashSet<(String, String)> {
    let mut reads = HashSet::new();
    for body in unit.methods.iter().filter_map(|m| m.body.as_ref()) {
        for (_, insn) in body.insns.iter() {
            match insn {
                Insn::Field {
                    op,
                    owner,
                    name,
                    descriptor,
                } if matches!(op, FieldOp::GetStatic | FieldOp::GetField) && *owner == unit.name => {
                    reads.insert((name.clone(), descriptor.clone()));
                }
                Insn::InvokeDynamic(site) => {
                    let handles = std::iter::once(&site.bootstrap).chain(site.arguments.iter().filter_map(|arg| match arg {
                        BootstrapArg::Handle(handle) => Some(handle),
                        _ => None,
                    }));
                    for handle in handles.filter(|h| h.owner == unit.name && h.kind <= 4) {
                        reads.insert((handle.name.clone(), handle.descriptor.clone()));
                    }
                }
                _ => {}
            }
        }
    }
    reads
}

/// Seven to thirteen alphanumerics with at least one letter and one digit.
pub(crate) fn looks_generated(name: &str) -> bool {
    (7..=13).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric())
        && name.bytes().any(|b| b.is_ascii_alphabetic())
        && name.bytes().any(|b| b.is_ascii_digit())
}

fn lowercase_run(name: &str, min: usize) -> bool {
    name.len() >= min && name.bytes().all(|b| b.is_ascii_lowercase())
}

fn is_junk_field(field: &Field) -> bool {
    field.name == "nothing_to_see_here"
        || (field.access.contains(AccessFlags::PRIVATE | AccessFlags::STATIC) && lowercase_run(&field.name, 10))
}

fn is_junk_method(method: &Method) -> bool {
    method.access.contains(AccessFlags::PRIVATE) && method.descriptor == "()[B" && lowercase_run(&method.name, 9)
}

/// Drops fields and byte-array helpers that obfuscators plant and nothing
/// in the unit uses any more.
pub struct MemberCleaner;

impl UnitPass for MemberCleaner {
    fn name(&self) -> &'static str {
        "junk-members"
    }

    fn run(&self, unit: &mut CompiledUnit, _ctx: &mut PassContext) -> usize {
        let (fields, methods) = referenced_members(unit);

        let removed_fields = unit.remove_fields(|f| {
            is_junk_field(f) && !fields.contains(&(f.name.clone(), f.descriptor.clone()))
        });
        let removed_methods = unit.remove_methods(|m| {
            is_junk_method(m) && !methods.contains(&(m.name.clone(), m.descriptor.clone()))
        });

        if removed_fields + removed_methods > 0 {
            debug!(
                "{} | removed {} junk fields and {} junk methods",
                unit.name, removed_fields, removed_methods
            );
        }
        removed_fields + removed_methods
    }
}

fn return_kind(descriptor: &str) -> Option<Option<ValueKind>> {
    let descriptor = crate::descriptor::MethodDescriptor::parse(descriptor).ok()?;
    Some(descriptor.ret.as_ref().map(|ret| ret.value_kind()))
}

/// The call a private method forwards to, when its whole body is: load every
/// argument in order, call another method of the same unit with the same
/// descriptor, return the result.
fn forwarded_call(unit_name: &str, method: &Method) -> Option<Insn> {
    if !method.access.contains(AccessFlags::PRIVATE) || method.name.starts_with('<') {
        return None;
    }
    let body = method.body.as_ref()?;
    if !body.try_catch.is_empty() {
        return None;
    }
    let descriptor = crate::descriptor::MethodDescriptor::parse(&method.descriptor).ok()?;

    let mut expected = vec![];
    let mut slot = 0u16;
    if !method.is_static() {
        expected.push(Insn::Load {
            kind: ValueKind::Ref,
            slot: 0,
        });
        slot = 1;
    }
    for param in &descriptor.params {
        expected.push(Insn::Load {
            kind: param.value_kind(),
            slot,
        });
        slot += param.slots() as u16;
    }

    let real: Vec<&Insn> = body.insns.iter().map(|(_, insn)| insn).filter(|insn| insn.is_real()).collect();
    if real.len() != expected.len() + 2 || real[..expected.len()].iter().zip(&expected).any(|(a, b)| *a != b) {
        return None;
    }
    let call = real[expected.len()];
    let forwards = match (call, real[expected.len() + 1]) {
        (
            Insn::Invoke {
                kind,
                owner,
                name,
                descriptor: target_descriptor,
                ..
            },
            Insn::Return(ret),
        ) => {
            owner == unit_name
                && *target_descriptor == method.descriptor
                && *name != method.name
                && (*kind == InvokeKind::Static) == method.is_static()
                && Some(*ret) == return_kind(&method.descriptor)
        }
        _ => false,
    };
    if forwards {
        Some(call.clone())
    } else {
        None
    }
}

/// A private method with a generated name that does nothing but return a
/// literal (or nothing).
fn is_dummy_method(method: &Method) -> bool {
    if !method.access.contains(AccessFlags::PRIVATE) || !looks_generated(&method.name) {
        return false;
    }
    let body = match &method.body {
        Some(body) => body,
        None => return false,
    };
    let real: Vec<&Insn> = body.insns.iter().map(|(_, insn)| insn).filter(|insn| insn.is_real()).collect();
    match real.as_slice() {
        [Insn::Return(None)] => true,
        [Insn::Const(value), Insn::Return(Some(_))] => !matches!(value, ConstValue::Pooled { .. }),
        _ => false,
    }
}

fn is_dummy_field(field: &Field) -> bool {
    field
        .access
        .contains(AccessFlags::PRIVATE | AccessFlags::STATIC | AccessFlags::FINAL)
        && looks_generated(&field.name)
}

/// Routes calls through private forwarding methods straight to their target,
/// then drops the forwarders along with generated-name constant methods and
/// constant fields nothing uses.
pub struct ProxyMemberRemover;

impl UnitPass for ProxyMemberRemover {
    fn name(&self) -> &'static str {
        "proxy-members"
    }

    fn run(&self, unit: &mut CompiledUnit, _ctx: &mut PassContext) -> usize {
        let unit_name = unit.name.clone();
        let mut proxies: HashMap<(String, String), Insn> = unit
            .methods
            .iter()
            .filter_map(|m| forwarded_call(&unit_name, m).map(|call| ((m.name.clone(), m.descriptor.clone()), call)))
            .collect();
        // a forwarder to a forwarder waits for the next round
        let chained: Vec<(String, String)> = proxies
            .iter()
            .filter(|(_, call)| match call {
                Insn::Invoke { name, descriptor, .. } => proxies.contains_key(&(name.clone(), descriptor.clone())),
                _ => false,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in chained {
            proxies.remove(&key);
        }

        let mut changes = 0;
        for method in unit.methods.iter_mut() {
            if proxies.contains_key(&(method.name.clone(), method.descriptor.clone())) {
                continue;
            }
            let body = match method.body.as_mut() {
                Some(body) => body,
                None => continue,
            };
            for id in body.insns.ids() {
                let target = match body.insns.get(id) {
                    Some(Insn::Invoke {
                        owner, name, descriptor, ..
                    }) if *owner == unit_name => proxies.get(&(name.clone(), descriptor.clone())),
                    _ => None,
                };
                if let Some(target) = target.cloned() {
                    trace!("{} | {}: call forwarded to {}", unit_name, method.name, target);
                    body.insns.replace(id, target);
                    changes += 1;
                }
            }
        }

        let (fields, methods) = referenced_members(unit);
        let removed_methods = unit.remove_methods(|m| {
            let key = (m.name.clone(), m.descriptor.clone());
            !methods.contains(&key) && (proxies.contains_key(&key) || is_dummy_method(m))
        });
        let removed_fields =
            unit.remove_fields(|f| is_dummy_field(f) && !fields.contains(&(f.name.clone(), f.descriptor.clone())));

        if changes + removed_methods + removed_fields > 0 {
            debug!(
                "{} | rerouted {} calls, removed {} proxy or dummy methods and {} dummy fields",
                unit.name, changes, removed_methods, removed_fields
            );
        }
        changes + removed_methods + removed_fields
    }
}
