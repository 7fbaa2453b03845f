//! Obfuscator families: signature detectors and the pipelines that run on
//! units they match, plus the general pipeline every unit gets.

use crate::cleanup::{looks_generated, MemberCleaner, ProxyMemberRemover};
use crate::code::MethodBody;
use crate::exceptions::ExceptionFlowRestorer;
use crate::flow::flow_simplification;
use crate::fold::XorHelperInliner;
use crate::indy::{is_bootstrap_routine, CallSiteResolver, HandleGeneratorRemover};
use crate::initializers::{ConstructorCleaner, StaticInitializerCleaner};
use crate::insn::{Insn, MathOp};
use crate::pass::{Detector, Pipeline, Repeat};
use crate::strings::StringDecryptor;
use crate::unit::CompiledUnit;

/// Real instructions of every protected range in `body`, range by range.
fn protected_bodies(body: &MethodBody) -> impl Iterator<Item = (&crate::code::ExceptionRange, Vec<Insn>)> + '_ {
    body.try_catch.iter().map(move |range| {
        let insns = body
            .real_insns_between(range.start, range.end)
            .into_iter()
            .filter_map(|id| body.insns.get(id).cloned())
            .collect();
        (range, insns)
    })
}

fn bodies(unit: &CompiledUnit) -> impl Iterator<Item = &MethodBody> {
    unit.methods.iter().filter_map(|m| m.body.as_ref())
}

pub struct SkidFuscatorDetector;

impl Detector for SkidFuscatorDetector {
    fn name(&self) -> &'static str {
        "SkidFuscator"
    }

    fn detect(&self, unit: &CompiledUnit) -> bool {
        if unit.name == "skid/Driver" {
            return true;
        }

        let hash_helper = unit.methods.iter().any(|m| {
            matches!(m.name.as_str(), "get" | "hash" | "checkType")
                && (m.descriptor == "(Ljava/lang/String;)I" || m.descriptor == "(Ljava/lang/String;)Ljava/lang/String;")
        });
        if hash_helper {
            return true;
        }

        bodies(unit).any(|body| {
            let odd_site = body.insns.iter().any(|(_, insn)| match insn {
                Insn::InvokeDynamic(site) => site.name == "v" || site.name.contains('_'),
                _ => false,
            });
            odd_site
                || protected_bodies(body)
                    .any(|(_, insns)| insns.len() <= 5 || insns.iter().any(|i| *i == Insn::Throw))
        })
    }
}

const BROAD_CATCHES: [&str; 3] = [
    "java/lang/RuntimeException",
    "java/lang/IllegalArgumentException",
    "java/lang/Exception",
];

pub struct ColonialDetector;

impl Detector for ColonialDetector {
    fn name(&self) -> &'static str {
        "Colonial"
    }

    fn detect(&self, unit: &CompiledUnit) -> bool {
        if unit.methods.iter().any(is_bootstrap_routine) {
            return true;
        }

        let base64_xor = bodies(unit).any(|body| {
            let mut base64 = false;
            let mut xor = false;
            for (_, insn) in body.insns.iter() {
                match insn {
                    Insn::Invoke { owner, .. } if owner == "java/util/Base64" => base64 = true,
                    Insn::Math { op: MathOp::Xor, .. } => xor = true,
                    _ => {}
                }
            }
            base64 && xor
        });
        if base64_xor {
            return true;
        }

        let broad_short_catch = bodies(unit).any(|body| {
            protected_bodies(body).any(|(range, insns)| {
                insns.len() < 5
                    && range
                        .catch_type
                        .as_deref()
                        .map_or(false, |t| BROAD_CATCHES.contains(&t))
            })
        });
        if broad_short_catch {
            return true;
        }

        let generated = unit.fields.iter().filter(|f| looks_generated(&f.name)).count()
            + unit.methods.iter().filter(|m| looks_generated(&m.name)).count();
        generated > 5
    }
}

pub fn skidfuscator_pipeline() -> Pipeline {
    Pipeline::new("skidfuscator")
        .method_group(flow_simplification(), Repeat::FixedPoint)
        .method_group(vec![Box::new(ExceptionFlowRestorer)], Repeat::Once)
        .unit_pass(Box::new(StringDecryptor), Repeat::Once)
        .method_group(flow_simplification(), Repeat::FixedPoint)
        .unit_pass(Box::new(CallSiteResolver), Repeat::Once)
        .unit_pass(Box::new(HandleGeneratorRemover), Repeat::Once)
}

pub fn colonial_pipeline() -> Pipeline {
    Pipeline::new("colonial")
        .method_group(flow_simplification(), Repeat::FixedPoint)
        .method_group(vec![Box::new(ExceptionFlowRestorer)], Repeat::Once)
        .unit_pass(Box::new(StringDecryptor), Repeat::Once)
        .unit_pass(Box::new(CallSiteResolver), Repeat::Once)
        .unit_pass(Box::new(HandleGeneratorRemover), Repeat::Once)
        .unit_pass(Box::new(MemberCleaner), Repeat::Once)
        .unit_pass(Box::new(ProxyMemberRemover), Repeat::FixedPoint)
}

/// Runs on every unit after the family pipelines.
pub fn general_pipeline() -> Pipeline {
    Pipeline::new("general")
        .method_group(flow_simplification(), Repeat::FixedPoint)
        .method_group(vec![Box::new(ExceptionFlowRestorer)], Repeat::Once)
        .method_group(flow_simplification(), Repeat::FixedPoint)
        .unit_pass(Box::new(StringDecryptor), Repeat::Once)
        .unit_pass(Box::new(CallSiteResolver), Repeat::Once)
        .unit_pass(Box::new(HandleGeneratorRemover), Repeat::Once)
        .unit_pass(Box::new(XorHelperInliner), Repeat::Once)
        .unit_pass(Box::new(ConstructorCleaner), Repeat::Once)
        .unit_pass(Box::new(StaticInitializerCleaner), Repeat::Once)
        .unit_pass(Box::new(MemberCleaner), Repeat::Once)
        .method_group(flow_simplification(), Repeat::FixedPoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::ExceptionRange;
    use crate::insn::{ConstValue, NumKind, ValueKind};
    use crate::unit::AccessFlags;

    fn trivial() -> MethodBody {
        let mut body = MethodBody::new(0, 0);
        body.insns.push(Insn::Return(None));
        body
    }

    #[test]
    fn plain_unit_matches_nothing() {
        let mut unit = CompiledUnit::new("t/Plain", "java/lang/Object").unwrap();
        unit.add_method(AccessFlags::PUBLIC, "run", "()V", Some(trivial())).unwrap();
        assert!(!SkidFuscatorDetector.detect(&unit));
        assert!(!ColonialDetector.detect(&unit));
    }

    #[test]
    fn skidfuscator_signatures() {
        let unit = CompiledUnit::new("skid/Driver", "java/lang/Object").unwrap();
        assert!(SkidFuscatorDetector.detect(&unit));

        let mut unit = CompiledUnit::new("t/Hashed", "java/lang/Object").unwrap();
        unit.add_method(AccessFlags::STATIC, "hash", "(Ljava/lang/String;)I", Some(trivial()))
            .unwrap();
        assert!(SkidFuscatorDetector.detect(&unit));

        let mut body = MethodBody::new(1, 0);
        let start = body.insns.push_label();
        body.insns.push(Insn::Const(ConstValue::Null));
        body.insns.push(Insn::Throw);
        let end = body.insns.push_label();
        body.insns.push(Insn::Stack(crate::insn::StackOp::Pop));
        body.insns.push(Insn::Return(None));
        body.try_catch.push(ExceptionRange {
            start,
            end,
            handler: end,
            catch_type: None,
        });
        let mut unit = CompiledUnit::new("t/Thrower", "java/lang/Object").unwrap();
        unit.add_method(AccessFlags::STATIC, "m", "()V", Some(body)).unwrap();
        assert!(SkidFuscatorDetector.detect(&unit));
    }

    #[test]
    fn colonial_signatures() {
        let mut body = MethodBody::new(2, 1);
        body.insns.push(Insn::Invoke {
            kind: crate::insn::InvokeKind::Static,
            owner: "java/util/Base64".to_string(),
            name: "getDecoder".to_string(),
            descriptor: "()Ljava/util/Base64$Decoder;".to_string(),
            interface: false,
        });
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 0 });
        body.insns.push(Insn::Math {
            kind: NumKind::Int,
            op: MathOp::Xor,
        });
        body.insns.push(Insn::Return(None));
        let mut unit = CompiledUnit::new("t/Colonial", "java/lang/Object").unwrap();
        unit.add_method(AccessFlags::STATIC, "m", "()V", Some(body)).unwrap();
        assert!(ColonialDetector.detect(&unit));

        let mut unit = CompiledUnit::new("t/Names", "java/lang/Object").unwrap();
        for name in ["a1b2c3d", "x9y8z7w6", "q1w2e3r4t", "z0z0z0z", "m4n5b6v7", "k2j3h4g5"].iter() {
            unit.add_field(AccessFlags::PRIVATE, name, "I").unwrap();
        }
        assert!(ColonialDetector.detect(&unit));
        assert!(!looks_generated("counter"));
        assert!(!looks_generated("a1"));
    }

    #[test]
    fn pipelines_are_named() {
        assert_eq!(general_pipeline().name(), "general");
        assert_eq!(skidfuscator_pipeline().name(), "skidfuscator");
        assert_eq!(colonial_pipeline().name(), "colonial");
    }
}
