use log::{debug, info};
use std::collections::HashMap;

use crate::code_graph::CodeGraph;
use crate::error::Error;
use crate::pass::{PassContext, PassEngine, PassReport};
use crate::strings::DecryptedString;
use crate::unit::CompiledUnit;

/// One unit after the engine has run over it.
#[derive(Debug)]
pub struct DeobfuscatedUnit {
    /// Order in which the unit was handed out for processing
    pub file_number: usize,
    pub name: String,
    /// Serialized class bytes. The input bytes when nothing changed.
    pub data: Vec<u8>,
    pub modified: bool,
    pub report: PassReport,
    pub decrypted: Vec<DecryptedString>,
    /// Graph file name to dot source
    pub graphviz_graphs: HashMap<String, String>,
}

fn graph_file_name(unit: &str, method: &str, phase: &str) -> String {
    format!("{}_{}_{}.dot", unit, method, phase)
        .chars()
        .map(|c| match c {
            '/' | '<' | '>' => '_',
            c => c,
        })
        .collect()
}

/// Renders every method body's flow graph for `phase`. Overloads get a
/// numeric suffix so they don't overwrite each other.
fn generate_dot_graphs(unit: &CompiledUnit, phase: &str, out: &mut HashMap<String, String>) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for method in &unit.methods {
        let body = match method.body.as_ref() {
            Some(body) => body,
            None => continue,
        };
        let count = seen.entry(method.name.as_str()).or_insert(0);
        let method_part = if *count == 0 {
            method.name.clone()
        } else {
            format!("{}{}", method.name, count)
        };
        *count += 1;

        let graph = CodeGraph::from_body(body);
        out.insert(graph_file_name(&unit.name, &method_part, phase), graph.to_dot(body));
    }
}

/// Runs `engine` over an already parsed unit. `original` is returned as-is
/// when no pass changed anything.
pub(crate) fn deobfuscate_parsed(
    mut unit: CompiledUnit,
    original: &[u8],
    engine: &PassEngine,
    file_identifier: usize,
    enable_dotviz_graphs: bool,
) -> Result<DeobfuscatedUnit, Error> {
    let mut graphviz_graphs = HashMap::new();
    if enable_dotviz_graphs {
        generate_dot_graphs(&unit, "before", &mut graphviz_graphs);
    }

    let mut ctx = PassContext::default();
    let report = engine.run(&mut unit, &mut ctx);

    if enable_dotviz_graphs {
        generate_dot_graphs(&unit, "after", &mut graphviz_graphs);
    }

    if !ctx.decrypted.is_empty() {
        info!("{} | decrypted {} strings", unit.name, ctx.decrypted.len());
    }
    debug!(
        "{} | {} changes ({} cache hits)",
        unit.name,
        report.total(),
        ctx.cache.hits()
    );

    let modified = unit.is_modified();
    let data = if modified { unit.to_bytes()? } else { original.to_vec() };

    Ok(DeobfuscatedUnit {
        file_number: file_identifier,
        name: unit.name,
        data,
        modified,
        report,
        decrypted: ctx.decrypted,
        graphviz_graphs,
    })
}

/// Parses and deobfuscates one compiled unit.
pub(crate) fn deobfuscate_unit(
    data: &[u8],
    engine: &PassEngine,
    file_identifier: usize,
    enable_dotviz_graphs: bool,
) -> Result<DeobfuscatedUnit, Error> {
    let unit = CompiledUnit::parse(data)?;
    deobfuscate_parsed(unit, data, engine, file_identifier, enable_dotviz_graphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::tests::insns_of;
    use crate::code::MethodBody;
    use crate::insn::{Cond, ConstValue, Insn, MathOp, NumKind, ValueKind};
    use crate::pass::DEFAULT_ITERATION_CAP;
    use crate::unit::tests::class_with_method;

    fn opaque_predicate() -> MethodBody {
        let mut body = MethodBody::new(2, 0);
        let taken = body.insns.new_label();
        body.insns.push(Insn::Const(ConstValue::Int(10)));
        body.insns.push(Insn::Const(ConstValue::Int(3)));
        body.insns.push(Insn::Math {
            kind: NumKind::Int,
            op: MathOp::Xor,
        });
        body.insns.push(Insn::Const(ConstValue::Int(9)));
        body.insns.push(Insn::Branch {
            cond: Cond::IcmpEq,
            target: taken,
        });
        body.insns.push(Insn::Const(ConstValue::Int(1)));
        body.insns.push(Insn::Return(Some(ValueKind::Int)));
        body.insns.push(Insn::Label(taken));
        body.insns.push(Insn::Const(ConstValue::Int(2)));
        body.insns.push(Insn::Return(Some(ValueKind::Int)));
        body
    }

    #[test]
    fn opaque_predicate_is_gone_after_round_trip() {
        crate::test_support::init_logging();

        let data = class_with_method("t/Opaque", "pick", "()I", opaque_predicate());
        let engine = PassEngine::standard(DEFAULT_ITERATION_CAP);
        let out = deobfuscate_unit(&data, &engine, 0, false).unwrap();
        assert!(out.modified);
        assert_eq!(out.name, "t/Opaque");

        let unit = CompiledUnit::parse(&out.data).unwrap();
        let insns = insns_of(unit.find_method("pick", "()I").unwrap().body.as_ref().unwrap());
        match insns.as_slice() {
            [Insn::Jump(target), Insn::Label(label), Insn::Const(ConstValue::Int(2)), Insn::Return(Some(ValueKind::Int))] => {
                assert_eq!(target, label)
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn untouched_unit_keeps_its_bytes() {
        let mut body = MethodBody::new(1, 0);
        body.insns.push(Insn::Const(ConstValue::Int(4)));
        body.insns.push(Insn::Return(Some(ValueKind::Int)));
        let data = class_with_method("t/Clean", "four", "()I", body);

        let engine = PassEngine::standard(DEFAULT_ITERATION_CAP);
        let out = deobfuscate_unit(&data, &engine, 3, false).unwrap();
        assert!(!out.modified);
        assert_eq!(out.file_number, 3);
        assert_eq!(out.data, data);
        assert_eq!(out.report.total(), 0);
    }

    #[test]
    fn graphs_before_and_after() {
        let data = class_with_method("t/Opaque", "<init>", "()V", {
            let mut body = MethodBody::new(0, 0);
            body.insns.push(Insn::Return(None));
            body
        });
        let engine = PassEngine::standard(DEFAULT_ITERATION_CAP);
        let out = deobfuscate_unit(&data, &engine, 0, true).unwrap();

        let mut names: Vec<&String> = out.graphviz_graphs.keys().collect();
        names.sort();
        assert_eq!(names, vec!["t_Opaque__init__after.dot", "t_Opaque__init__before.dot"]);
        assert!(out.graphviz_graphs.values().all(|dot| dot.contains("digraph")));
    }

    #[test]
    fn garbage_is_an_error() {
        let engine = PassEngine::standard(DEFAULT_ITERATION_CAP);
        assert!(matches!(
            deobfuscate_unit(b"not a class", &engine, 0, false),
            Err(Error::BadMagic(_))
        ));
    }
}
