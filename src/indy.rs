//! Resolution of obfuscated `invokedynamic` sites back to direct calls.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::cleanup::referenced_members;
use crate::descriptor::MethodDescriptor;
use crate::insn::{BootstrapArg, CallSite, ConstValue, Insn, InvokeKind, StackOp, TypeOp};
use crate::pass::{PassContext, UnitPass};
use crate::unit::{AccessFlags, CompiledUnit, Method};

const LOOKUP: &str = "java/lang/invoke/MethodHandles$Lookup";
const BOOTSTRAP_PREFIX: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;";
const CALL_SITE_RETURN: &str = ")Ljava/lang/invoke/CallSite;";
const CALL_SITE_HOLDERS: [&str; 3] = [
    "Ljava/lang/invoke/CallSite;",
    "Ljava/lang/invoke/MutableCallSite;",
    "Ljava/lang/invoke/ConstantCallSite;",
];

/// Whether a method has the shape of a call-site bootstrap routine.
pub fn is_bootstrap_routine(method: &Method) -> bool {
    method.is_static()
        && method.descriptor.starts_with(BOOTSTRAP_PREFIX)
        && method.descriptor.ends_with(CALL_SITE_RETURN)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LookupKind {
    Static,
    Virtual,
    Special,
    Constructor,
}

impl LookupKind {
    fn from_method(name: &str) -> Option<LookupKind> {
        Some(match name {
            "findStatic" => LookupKind::Static,
            "findVirtual" => LookupKind::Virtual,
            "findSpecial" => LookupKind::Special,
            "findConstructor" => LookupKind::Constructor,
            _ => return None,
        })
    }
}

/// What a bootstrap routine's body gives away about its target.
#[derive(Debug, Default, Clone)]
struct BootstrapHints {
    owner: Option<String>,
    name: Option<String>,
    lookup: Option<LookupKind>,
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c == '_' || c == '$' || c.is_alphanumeric())
}

impl BootstrapHints {
    /// Sorts a literal into owner or member name by shape. Descriptors and
    /// anything that isn't a plausible identifier are ignored.
    fn classify(&mut self, literal: &str) {
        if literal.starts_with('(') {
            return;
        }
        if literal.contains('/') || literal.contains('.') {
            let owner = literal.replace('.', "/");
            if self.owner.is_none() && owner.split('/').all(is_identifier) {
                self.owner = Some(owner);
            }
        } else if self.name.is_none() && (is_identifier(literal) || literal == "<init>") {
            self.name = Some(literal.to_string());
        }
    }

    fn from_routine(method: &Method) -> BootstrapHints {
        let mut hints = BootstrapHints::default();
        let body = match &method.body {
            Some(body) => body,
            None => return hints,
        };
        for (_, insn) in body.insns.iter() {
            match insn {
                Insn::Const(ConstValue::Str(s)) => hints.classify(&s.to_string_lossy()),
                Insn::Invoke { owner, name, .. } if owner == LOOKUP && hints.lookup.is_none() => {
                    hints.lookup = LookupKind::from_method(name);
                }
                _ => {}
            }
        }
        hints
    }
}

/// Splits an `owner_name` style call-site name. The owner ends at the first
/// `_` after its last package separator.
fn split_site_name(site_name: &str) -> Option<(String, String)> {
    let separator = site_name.rfind(|c| c == '/' || c == '.')?;
    let underscore = separator + site_name[separator..].find('_')?;
    let (owner, name) = (&site_name[..underscore], &site_name[underscore + 1..]);
    if owner.is_empty() || !is_identifier(name) {
        return None;
    }
    Some((owner.replace('.', "/"), name.to_string()))
}

/// A site's replacement, plus how many locals past the method's own it
/// borrows to hold constructor arguments.
struct Resolved {
    insns: Vec<Insn>,
    spill_slots: u16,
    /// Stack depth above what the site itself needed
    extra_stack: u16,
}

/// Works out the direct call a site stands for, if possible. `spill_base` is
/// the first local slot the method doesn't use.
fn resolve(site: &CallSite, hints: &BootstrapHints, spill_base: u16) -> Option<Resolved> {
    let mut hints = hints.clone();
    for arg in &site.arguments {
        match arg {
            BootstrapArg::Str(s) => hints.classify(&s.to_string_lossy()),
            BootstrapArg::Class(class) => hints.classify(class),
            _ => {}
        }
    }

    let lookup = hints.lookup.unwrap_or(if site.name == "v" {
        LookupKind::Virtual
    } else {
        LookupKind::Static
    });
    let (owner, name) = match (hints.owner, hints.name, lookup) {
        (Some(owner), _, LookupKind::Constructor) => (owner, "<init>".to_string()),
        (Some(owner), Some(name), _) => (owner, name),
        _ => split_site_name(&site.name)?,
    };
    let descriptor = MethodDescriptor::parse(&site.descriptor).ok()?;

    let invoke = |kind, name: String, descriptor: String| Insn::Invoke {
        kind,
        owner: owner.clone(),
        name,
        descriptor,
        interface: false,
    };
    let direct = |insns| {
        Some(Resolved {
            insns,
            spill_slots: 0,
            extra_stack: 0,
        })
    };

    match lookup {
        LookupKind::Static => direct(vec![invoke(InvokeKind::Static, name, site.descriptor.clone())]),
        LookupKind::Virtual => direct(vec![invoke(
            InvokeKind::Virtual,
            name,
            descriptor.without_receiver()?.to_string(),
        )]),
        LookupKind::Special => direct(vec![invoke(
            InvokeKind::Special,
            name,
            descriptor.without_receiver()?.to_string(),
        )]),
        LookupKind::Constructor => {
            let init = MethodDescriptor {
                params: descriptor.params.clone(),
                ret: None,
            };
            let call = invoke(InvokeKind::Special, "<init>".to_string(), init.to_string());
            constructor_call(&owner, &descriptor, call, spill_base)
        }
    }
}

/// `new; dup; <init>` for a constructor site. Arguments already on the stack
/// sit where the new instance has to go, so they are parked in fresh locals
/// and reloaded above it.
fn constructor_call(owner: &str, descriptor: &MethodDescriptor, call: Insn, spill_base: u16) -> Option<Resolved> {
    let slots = u16::try_from(descriptor.arg_slots()).ok()?;
    spill_base.checked_add(slots)?;

    let mut parked = Vec::with_capacity(descriptor.params.len());
    let mut slot = spill_base;
    for param in &descriptor.params {
        parked.push((param.value_kind(), slot));
        slot += param.slots() as u16;
    }

    let mut insns: Vec<Insn> = parked
        .iter()
        .rev()
        .map(|&(kind, slot)| Insn::Store { kind, slot })
        .collect();
    insns.push(Insn::Type {
        op: TypeOp::New,
        class: owner.to_string(),
    });
    insns.push(Insn::Stack(StackOp::Dup));
    insns.extend(parked.iter().map(|&(kind, slot)| Insn::Load { kind, slot }));
    insns.push(call);
    Some(Resolved {
        insns,
        spill_slots: slots,
        extra_stack: 2,
    })
}

/// Rewrites `invokedynamic` instructions bootstrapped by a routine in the
/// same unit into plain invocations, then deletes routines and call-site
/// holder fields nothing uses anymore.
pub struct CallSiteResolver;

impl UnitPass for CallSiteResolver {
    fn name(&self) -> &'static str {
        "call-site"
    }

    fn run(&self, unit: &mut CompiledUnit, _ctx: &mut PassContext) -> usize {
        let routines: HashMap<(String, String), BootstrapHints> = unit
            .methods
            .iter()
            .filter(|m| is_bootstrap_routine(m))
            .map(|m| ((m.name.clone(), m.descriptor.clone()), BootstrapHints::from_routine(m)))
            .collect();
        if routines.is_empty() {
            return 0;
        }

        let unit_name = unit.name.clone();
        let mut changes = 0;
        let mut resolved_routines = HashSet::new();

        for method in unit.methods.iter_mut() {
            let body = match method.body.as_mut() {
                Some(body) => body,
                None => continue,
            };
            let spill_base = body.max_locals;
            let mut spill_slots = 0;
            let mut extra_stack = 0;

            for id in body.insns.ids() {
                let site = match body.insns.get(id) {
                    Some(Insn::InvokeDynamic(site)) if site.bootstrap.owner == unit_name => site,
                    _ => continue,
                };
                let key = (site.bootstrap.name.clone(), site.bootstrap.descriptor.clone());
                let hints = match routines.get(&key) {
                    Some(hints) => hints,
                    None => continue,
                };

                let resolved = match resolve(site, hints, spill_base) {
                    Some(resolved) => resolved,
                    None => {
                        trace!("{} | can't resolve call site {}{}", unit_name, site.name, site.descriptor);
                        continue;
                    }
                };

                debug!(
                    "{} | {}{}: call site {} is {}",
                    unit_name,
                    method.name,
                    method.descriptor,
                    site.name,
                    resolved.insns[resolved.insns.len() - 1]
                );
                spill_slots = spill_slots.max(resolved.spill_slots);
                extra_stack = extra_stack.max(resolved.extra_stack);
                if let Some((call, prefix)) = resolved.insns.split_last() {
                    for insn in prefix {
                        body.insns.insert_before(id, insn.clone());
                    }
                    body.insns.replace(id, call.clone());
                }
                resolved_routines.insert(key);
                changes += 1;
            }

            // every spilling site parks its arguments from the same base
            body.max_locals = spill_base.saturating_add(spill_slots);
            body.max_stack = body.max_stack.saturating_add(extra_stack);
        }

        // A routine goes once no site refers to it anymore
        let still_used: HashSet<(String, String)> = unit
            .methods
            .iter()
            .filter_map(|m| m.body.as_ref())
            .flat_map(|body| body.insns.iter())
            .filter_map(|(_, insn)| match insn {
                Insn::InvokeDynamic(site) if site.bootstrap.owner == unit_name => {
                    Some((site.bootstrap.name.clone(), site.bootstrap.descriptor.clone()))
                }
                _ => None,
            })
            .collect();
        let removable: HashSet<(String, String)> = resolved_routines.difference(&still_used).cloned().collect();
        if !removable.is_empty() {
            changes += unit.remove_methods(|m| removable.contains(&(m.name.clone(), m.descriptor.clone())));
        }

        // Holder fields are only touched from the routines themselves
        let referenced_fields: HashSet<(String, String)> = unit
            .methods
            .iter()
            .filter_map(|m| m.body.as_ref())
            .flat_map(|body| body.insns.iter())
            .filter_map(|(_, insn)| match insn {
                Insn::Field { owner, name, descriptor, .. } if *owner == unit_name => {
                    Some((name.clone(), descriptor.clone()))
                }
                _ => None,
            })
            .collect();
        if !removable.is_empty() {
            changes += unit.remove_fields(|f| {
                CALL_SITE_HOLDERS.contains(&f.descriptor.as_str())
                    && !referenced_fields.contains(&(f.name.clone(), f.descriptor.clone()))
            });
        }

        changes
    }
}

/// A private method that builds a `MethodHandle` through a lookup: the
/// reflective half of an obfuscated call, left behind once its sites are
/// rewritten.
fn is_handle_generator(method: &Method) -> bool {
    if !method.access.contains(AccessFlags::PRIVATE) || !method.descriptor.ends_with(")Ljava/lang/invoke/MethodHandle;") {
        return false;
    }
    let body = match &method.body {
        Some(body) => body,
        None => return false,
    };
    let mut lookup = false;
    let mut find = false;
    for (_, insn) in body.insns.iter() {
        if let Insn::Invoke { owner, name, .. } = insn {
            if owner == "java/lang/invoke/MethodHandles" && name == "lookup" {
                lookup = true;
            } else if owner == LOOKUP && (name == "findStatic" || name == "findVirtual") {
                find = true;
            }
        }
    }
    lookup && find
}

/// Deletes method-handle generators nothing in the unit calls.
pub struct HandleGeneratorRemover;

impl UnitPass for HandleGeneratorRemover {
    fn name(&self) -> &'static str {
        "handle-generators"
    }

    fn run(&self, unit: &mut CompiledUnit, _ctx: &mut PassContext) -> usize {
        let (_, called) = referenced_members(unit);
        let removed = unit.remove_methods(|m| {
            is_handle_generator(m) && !called.contains(&(m.name.clone(), m.descriptor.clone()))
        });
        if removed > 0 {
            debug!("{} | removed {} method handle generators", unit.name, removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::tests::insns_of;
    use crate::code::MethodBody;
    use crate::insn::{MethodHandle, ValueKind};

    const BSM_DESC: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;";

    fn routine(literals: &[&str], lookup: Option<&str>) -> MethodBody {
        let mut body = MethodBody::new(4, 3);
        body.insns.push(Insn::Load { kind: ValueKind::Ref, slot: 0 });
        for literal in literals {
            body.insns.push(Insn::Const(ConstValue::Str((*literal).into())));
        }
        if let Some(lookup) = lookup {
            body.insns.push(Insn::Invoke {
                kind: InvokeKind::Virtual,
                owner: LOOKUP.to_string(),
                name: lookup.to_string(),
                descriptor: "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/MethodHandle;"
                    .to_string(),
                interface: false,
            });
        }
        body.insns.push(Insn::Const(ConstValue::Null));
        body.insns.push(Insn::Return(Some(ValueKind::Ref)));
        body
    }

    fn caller(site_name: &str, descriptor: &str, bsm: &str) -> MethodBody {
        let mut body = MethodBody::new(4, 1);
        body.insns.push(Insn::InvokeDynamic(Box::new(CallSite {
            index: 1,
            name: site_name.to_string(),
            descriptor: descriptor.to_string(),
            bootstrap_index: 0,
            bootstrap: MethodHandle {
                kind: 6,
                owner: "t/Host".to_string(),
                name: bsm.to_string(),
                descriptor: BSM_DESC.to_string(),
                interface: false,
            },
            arguments: vec![],
        })));
        body.insns.push(Insn::Return(None));
        body
    }

    fn host(routine_body: MethodBody, caller_body: MethodBody) -> CompiledUnit {
        let mut unit = CompiledUnit::new("t/Host", "java/lang/Object").unwrap();
        unit.add_field(AccessFlags::PRIVATE | AccessFlags::STATIC, "site", "Ljava/lang/invoke/MutableCallSite;")
            .unwrap();
        unit.add_method(AccessFlags::PRIVATE | AccessFlags::STATIC, "bsm", BSM_DESC, Some(routine_body))
            .unwrap();
        unit.add_method(AccessFlags::STATIC, "main", "()V", Some(caller_body)).unwrap();
        unit
    }

    fn first_insns(unit: &CompiledUnit) -> Vec<Insn> {
        insns_of(unit.find_method("main", "()V").unwrap().body.as_ref().unwrap())
    }

    #[test]
    fn static_site_from_routine_literals() {
        let mut unit = host(
            routine(&["java.lang.System", "exit"], Some("findStatic")),
            caller("s", "(I)V", "bsm"),
        );
        assert!(CallSiteResolver.run(&mut unit, &mut PassContext::default()) > 0);
        assert_eq!(
            first_insns(&unit)[0],
            Insn::Invoke {
                kind: InvokeKind::Static,
                owner: "java/lang/System".to_string(),
                name: "exit".to_string(),
                descriptor: "(I)V".to_string(),
                interface: false,
            }
        );
        assert!(unit.find_method("bsm", BSM_DESC).is_none());
        assert!(unit.fields.is_empty());
    }

    #[test]
    fn virtual_site_drops_the_receiver() {
        let mut unit = host(
            routine(&["java/io/PrintStream", "println"], None),
            caller("v", "(Ljava/io/PrintStream;Ljava/lang/String;)V", "bsm"),
        );
        CallSiteResolver.run(&mut unit, &mut PassContext::default());
        assert_eq!(
            first_insns(&unit)[0],
            Insn::Invoke {
                kind: InvokeKind::Virtual,
                owner: "java/io/PrintStream".to_string(),
                name: "println".to_string(),
                descriptor: "(Ljava/lang/String;)V".to_string(),
                interface: false,
            }
        );
    }

    #[test]
    fn constructor_lookup() {
        let mut unit = host(
            routine(&["java.lang.Object"], Some("findConstructor")),
            caller("c", "()Ljava/lang/Object;", "bsm"),
        );
        CallSiteResolver.run(&mut unit, &mut PassContext::default());
        let insns = first_insns(&unit);
        assert_eq!(
            insns[..3],
            [
                Insn::Type {
                    op: TypeOp::New,
                    class: "java/lang/Object".to_string(),
                },
                Insn::Stack(StackOp::Dup),
                Insn::Invoke {
                    kind: InvokeKind::Special,
                    owner: "java/lang/Object".to_string(),
                    name: "<init>".to_string(),
                    descriptor: "()V".to_string(),
                    interface: false,
                },
            ]
        );
    }

    #[test]
    fn constructor_arguments_are_reloaded_above_the_new_instance() {
        let mut unit = host(
            routine(&["t.Pair"], Some("findConstructor")),
            caller("c", "(Ljava/lang/String;J)Lt/Pair;", "bsm"),
        );
        CallSiteResolver.run(&mut unit, &mut PassContext::default());
        let body = unit.find_method("main", "()V").unwrap().body.as_ref().unwrap();
        assert_eq!(
            insns_of(body),
            vec![
                Insn::Store { kind: ValueKind::Long, slot: 2 },
                Insn::Store { kind: ValueKind::Ref, slot: 1 },
                Insn::Type {
                    op: TypeOp::New,
                    class: "t/Pair".to_string(),
                },
                Insn::Stack(StackOp::Dup),
                Insn::Load { kind: ValueKind::Ref, slot: 1 },
                Insn::Load { kind: ValueKind::Long, slot: 2 },
                Insn::Invoke {
                    kind: InvokeKind::Special,
                    owner: "t/Pair".to_string(),
                    name: "<init>".to_string(),
                    descriptor: "(Ljava/lang/String;J)V".to_string(),
                    interface: false,
                },
                Insn::Return(None),
            ]
        );
        assert_eq!(body.max_locals, 4);
        assert_eq!(body.max_stack, 6);
    }

    #[test]
    fn site_name_fallback() {
        let mut unit = host(routine(&[], None), caller("java.lang.Math_abs", "(I)I", "bsm"));
        CallSiteResolver.run(&mut unit, &mut PassContext::default());
        assert_eq!(
            first_insns(&unit)[0],
            Insn::Invoke {
                kind: InvokeKind::Static,
                owner: "java/lang/Math".to_string(),
                name: "abs".to_string(),
                descriptor: "(I)I".to_string(),
                interface: false,
            }
        );
    }

    #[test]
    fn opaque_site_is_left_alone() {
        let mut unit = host(routine(&["%d"], None), caller("x", "()V", "bsm"));
        assert_eq!(CallSiteResolver.run(&mut unit, &mut PassContext::default()), 0);
        assert!(matches!(first_insns(&unit)[0], Insn::InvokeDynamic(_)));
        assert!(unit.find_method("bsm", BSM_DESC).is_some());
        assert_eq!(unit.fields.len(), 1);
    }

    #[test]
    fn unused_handle_generators_go() {
        let generator = || {
            let mut body = MethodBody::new(4, 0);
            body.insns.push(Insn::Invoke {
                kind: InvokeKind::Static,
                owner: "java/lang/invoke/MethodHandles".to_string(),
                name: "lookup".to_string(),
                descriptor: "()Ljava/lang/invoke/MethodHandles$Lookup;".to_string(),
                interface: false,
            });
            body.insns.push(Insn::Const(ConstValue::Type("java/lang/System".to_string())));
            body.insns.push(Insn::Const(ConstValue::Str("exit".into())));
            body.insns.push(Insn::Const(ConstValue::Null));
            body.insns.push(Insn::Invoke {
                kind: InvokeKind::Virtual,
                owner: LOOKUP.to_string(),
                name: "findStatic".to_string(),
                descriptor: "(Ljava/lang/Class;Ljava/lang/String;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/MethodHandle;"
                    .to_string(),
                interface: false,
            });
            body.insns.push(Insn::Return(Some(ValueKind::Ref)));
            body
        };
        let handle_desc = "()Ljava/lang/invoke/MethodHandle;";

        let mut unit = CompiledUnit::new("t/Host", "java/lang/Object").unwrap();
        let private_static = AccessFlags::PRIVATE | AccessFlags::STATIC;
        unit.add_method(private_static, "unused", handle_desc, Some(generator())).unwrap();
        unit.add_method(private_static, "used", handle_desc, Some(generator())).unwrap();
        unit.add_method(AccessFlags::PUBLIC | AccessFlags::STATIC, "exported", handle_desc, Some(generator()))
            .unwrap();

        let mut caller = MethodBody::new(1, 0);
        caller.insns.push(Insn::Invoke {
            kind: InvokeKind::Static,
            owner: "t/Host".to_string(),
            name: "used".to_string(),
            descriptor: handle_desc.to_string(),
            interface: false,
        });
        caller.insns.push(Insn::Return(Some(ValueKind::Ref)));
        unit.add_method(AccessFlags::STATIC, "main", handle_desc, Some(caller)).unwrap();

        assert_eq!(HandleGeneratorRemover.run(&mut unit, &mut PassContext::default()), 1);
        assert!(unit.find_method("unused", handle_desc).is_none());
        assert!(unit.find_method("used", handle_desc).is_some());
        assert!(unit.find_method("exported", handle_desc).is_some());
    }

    #[test]
    fn site_names_split_after_the_last_separator() {
        assert_eq!(
            split_site_name("a/b_c/Some_method_name"),
            Some(("a/b_c/Some".to_string(), "method_name".to_string()))
        );
        assert_eq!(split_site_name("noseparator_name"), None);
        assert_eq!(split_site_name("a.B_"), None);
    }
}
