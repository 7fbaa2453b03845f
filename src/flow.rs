//! Control-flow cleanup: `goto` chains and unreachable code.

use std::collections::{HashMap, HashSet};

use log::trace;

use crate::code::{Label, MethodBody};
use crate::code_graph::remove_dead_code;
use crate::fold::{ConstantFolder, ConstantSwitchEliminator, DeadBranchEliminator, PushPopRemover};
use crate::insn::Insn;
use crate::pass::MethodPass;

/// The unconditional jump target `label` forwards to, if the first real
/// instruction after it is a `goto`.
fn forwards_to(body: &MethodBody, label: Label) -> Option<Label> {
    let node = body.insns.label_node(label)?;
    let first = body.insns.next_real(node)?;
    match body.insns.get(first)? {
        Insn::Jump(next) if *next != label => Some(*next),
        _ => None,
    }
}

/// Follows `start` through forwarding jumps until a label that doesn't
/// forward. `None` if the chain closes into a loop of bare jumps.
fn chain_end(body: &MethodBody, start: Label) -> Option<Label> {
    let mut seen = HashSet::new();
    seen.insert(start);
    let mut current = start;
    while let Some(next) = forwards_to(body, current) {
        if !seen.insert(next) {
            return None;
        }
        current = next;
    }
    Some(current)
}

/// Rewrites jumps (and switch cases, and exception handlers) whose target
/// is itself just a `goto`, so they point straight at the final target.
pub struct JumpChainCollapser;

impl MethodPass for JumpChainCollapser {
    fn name(&self) -> &'static str {
        "jump-chain"
    }

    fn run(&self, body: &mut MethodBody) -> usize {
        let mut changes = 0;
        loop {
            let mut redirects = HashMap::new();
            for label in body.referenced_labels() {
                let end = match chain_end(body, label) {
                    Some(end) => end,
                    None => continue,
                };
                if end != label {
                    trace!("{} forwards to {}", label, end);
                    redirects.insert(label, end);
                }
            }
            if redirects.is_empty() {
                break;
            }

            let changed = body.redirect_all(&redirects, true);
            if changed == 0 {
                break;
            }
            changes += changed;
        }
        changes
    }
}

/// Reachability-based dead code removal.
pub struct DeadCodeEliminator;

impl MethodPass for DeadCodeEliminator {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn run(&self, body: &mut MethodBody) -> usize {
        remove_dead_code(body)
    }
}

/// The standard method-level simplification group, in run order.
pub fn flow_simplification() -> Vec<Box<dyn MethodPass>> {
    vec![
        Box::new(ConstantFolder),
        Box::new(DeadBranchEliminator),
        Box::new(ConstantSwitchEliminator),
        Box::new(PushPopRemover),
        Box::new(JumpChainCollapser),
        Box::new(DeadCodeEliminator),
    ]
}
