//! Removal of try/catch ranges that exist only to move control around.
//!
//! Two shapes are recognised. A *redirection* range protects a short
//! sequence that always throws, and its handler drops the exception and
//! carries on somewhere else: every way into the range is sent straight to
//! that continuation. A *pure* range has no observable effect: its body is
//! empty, or it always throws into a handler that never re-throws, or the
//! handler ignores the caught value. Anything else is left alone.

use std::collections::HashMap;

use log::trace;

use crate::code::{ExceptionRange, InsnId, Label, MethodBody};
use crate::code_graph::remove_dead_code;
use crate::insn::{Insn, InvokeKind, StackOp, TypeOp, ValueKind};
use crate::opcodes;
use crate::pass::MethodPass;

/// Longest protected body either heuristic will consider.
pub const SHORT_RANGE: usize = 10;

/// Instructions an obfuscator uses to build the exception it throws.
fn builds_exception(insn: &Insn) -> bool {
    match insn {
        Insn::Const(_) | Insn::Load { .. } | Insn::Throw => true,
        Insn::Type { op: TypeOp::New, .. } => true,
        Insn::Stack(StackOp::Dup) | Insn::Stack(StackOp::DupX1) | Insn::Stack(StackOp::Swap) => true,
        Insn::Invoke {
            kind: InvokeKind::Special,
            name,
            ..
        } => name == "<init>",
        _ => false,
    }
}

/// A body that runs straight through and ends in `athrow`.
fn always_throws(body: &MethodBody, insns: &[InsnId]) -> bool {
    let (last, rest) = match insns.split_last() {
        Some(split) => split,
        None => return false,
    };
    matches!(body.insns.get(*last), Some(Insn::Throw))
        && rest.iter().all(|id| {
            body.insns
                .get(*id)
                .map_or(false, |insn| insn.falls_through() && !insn.is_jump())
        })
}

fn slot_is_read(body: &MethodBody, slot: u16) -> bool {
    body.insns.iter().any(|(_, insn)| match insn {
        Insn::Load { kind, slot: s } => {
            *s == slot || (matches!(kind, ValueKind::Long | ValueKind::Double) && s + 1 == slot)
        }
        Insn::Iinc { slot: s, .. } | Insn::Ret(s) => *s == slot,
        _ => false,
    })
}

/// The handler's first instruction, if it throws the caught value away:
/// a `pop`, or a store into a local nothing ever reads.
fn discarded_at(body: &MethodBody, handler: Label) -> Option<InsnId> {
    let first = body.insns.real_from(body.insns.label_node(handler)?)?;
    match body.insns.get(first)? {
        Insn::Stack(StackOp::Pop) => Some(first),
        Insn::Store {
            kind: ValueKind::Ref,
            slot,
        } if !slot_is_read(body, *slot) => Some(first),
        _ => None,
    }
}

/// Whether the straight-line part of a handler ends in `athrow`. Anything
/// that branches is assumed to maybe re-throw.
fn handler_rethrows(body: &MethodBody, handler: Label) -> bool {
    let mut cur = body.insns.label_node(handler).and_then(|n| body.insns.real_from(n));
    let mut steps = 0;
    while let Some(id) = cur {
        match body.insns.get(id) {
            Some(Insn::Throw) => return true,
            Some(Insn::Return(_)) | Some(Insn::Jump(_)) => return false,
            Some(insn) if insn.is_jump() || !insn.falls_through() => return true,
            Some(_) => {}
            None => return true,
        }
        steps += 1;
        if steps > 64 {
            return true;
        }
        cur = body.insns.next_real(id);
    }
    true
}

/// Labels bound between the range start and its first real instruction.
fn entry_labels(body: &MethodBody, start: Label) -> Vec<Label> {
    let mut labels = vec![];
    let mut cur = body.insns.label_node(start);
    while let Some(id) = cur {
        match body.insns.get(id) {
            Some(Insn::Label(label)) => labels.push(*label),
            Some(Insn::LineNumber(_)) => {}
            _ => break,
        }
        cur = body.insns.next(id);
    }
    labels
}

/// Whether a range listed before `index` also covers `id`, and so would see
/// the exception first.
fn covered_earlier(body: &MethodBody, index: usize, id: InsnId) -> bool {
    body.try_catch[..index]
        .iter()
        .any(|r| body.real_insns_between(r.start, r.end).contains(&id))
}

/// Whether the range's handler catches what its throw sequence builds. An
/// exception that wasn't allocated right there has an unknown type and only
/// matches a catch-all.
fn catches_thrown(body: &MethodBody, range: &ExceptionRange, insns: &[InsnId]) -> bool {
    match (&range.catch_type, insns.first().and_then(|id| body.insns.get(*id))) {
        (None, _) => true,
        (Some(caught), _) if caught == "java/lang/Throwable" => true,
        (Some(caught), Some(Insn::Type { op: TypeOp::New, class })) => caught == class,
        _ => false,
    }
}

/// Detection (b). Returns whether range `index` was rewritten and removed.
fn restore_redirection(body: &mut MethodBody, index: usize) -> bool {
    let range = body.try_catch[index].clone();
    let insns = body.real_insns_between(range.start, range.end);
    if insns.is_empty() || insns.len() > SHORT_RANGE || !always_throws(body, &insns) {
        return false;
    }
    if !catches_thrown(body, &range, &insns) {
        return false;
    }
    if !insns
        .iter()
        .all(|id| body.insns.get(*id).map_or(false, builds_exception))
    {
        return false;
    }
    if covered_earlier(body, index, insns[insns.len() - 1]) {
        return false;
    }

    let index_before = body.flow_index();
    // nothing may jump into the middle of the throw sequence
    let first_pos = index_before.positions[&insns[0]];
    let last_pos = index_before.positions[&insns[insns.len() - 1]];
    let jumps_inside = index_before
        .label_positions
        .iter()
        .any(|(label, pos)| *pos > first_pos && *pos < last_pos && index_before.is_jump_target(*label));
    if jumps_inside {
        return false;
    }

    let discard = match discarded_at(body, range.handler) {
        Some(discard) => discard,
        None => return false,
    };
    let next = match body.insns.next_real(discard) {
        Some(next) => next,
        None => return false,
    };

    let (start_pos, end_pos) = match (
        index_before.label_positions.get(&range.start),
        index_before.label_positions.get(&range.end),
    ) {
        (Some(s), Some(e)) => (*s, *e),
        _ => return false,
    };
    let inside = |pos: usize| pos >= start_pos && pos < end_pos;
    if inside(index_before.positions[&discard]) {
        return false;
    }

    let continuation = match body.insns.get(next) {
        Some(Insn::Jump(target)) => {
            match index_before.label_positions.get(target) {
                Some(pos) if !inside(*pos) => {}
                _ => return false,
            }
            *target
        }
        Some(_) => {
            if inside(index_before.positions[&next]) {
                return false;
            }
            let label = body.insns.new_label();
            body.insns.insert_before(next, Insn::Label(label));
            label
        }
        None => return false,
    };

    trace!(
        "range {}..{} redirects to {} through handler {}",
        range.start,
        range.end,
        continuation,
        range.handler
    );

    let redirects: HashMap<Label, Label> = entry_labels(body, range.start)
        .into_iter()
        .map(|label| (label, continuation))
        .collect();
    body.insns.redirect(&redirects);

    if let Some(start_node) = body.insns.label_node(range.start) {
        let falls_in = match body.insns.prev_real(start_node) {
            Some(prev) => body.insns.get(prev).map_or(false, Insn::falls_through),
            None => true,
        };
        if falls_in {
            body.insns.insert_before(start_node, Insn::Jump(continuation));
        }
    }

    body.remove_range(index);
    true
}

/// Detection (a). Returns whether range `index` was removed.
fn drop_pure_range(body: &mut MethodBody, index: usize) -> bool {
    let range = body.try_catch[index].clone();
    let insns = body.real_insns_between(range.start, range.end);

    let no_op = insns
        .iter()
        .all(|id| matches!(body.insns.get(*id), Some(Insn::Simple(opcodes::NOP))));
    if no_op {
        trace!("range {}..{} protects nothing", range.start, range.end);
        body.remove_range(index);
        return true;
    }
    if insns.len() > SHORT_RANGE {
        return false;
    }

    if always_throws(body, &insns) {
        let throw = insns[insns.len() - 1];
        if catches_thrown(body, &range, &insns) && !covered_earlier(body, index, throw) && !handler_rethrows(body, range.handler) {
            trace!("range {}..{} always throws into {}", range.start, range.end, range.handler);
            body.insns.replace(throw, Insn::Jump(range.handler));
            body.remove_range(index);
            return true;
        }
        return false;
    }

    if discarded_at(body, range.handler).is_some() {
        trace!("handler {} ignores what it catches", range.handler);
        body.remove_range(index);
        return true;
    }

    false
}

/// Runs detection (b) over every range, then detection (a), then dead code
/// elimination if anything changed.
pub struct ExceptionFlowRestorer;

impl MethodPass for ExceptionFlowRestorer {
    fn name(&self) -> &'static str {
        "exception-flow"
    }

    fn run(&self, body: &mut MethodBody) -> usize {
        let mut changes = 0;

        let mut i = 0;
        while i < body.try_catch.len() {
            if restore_redirection(body, i) {
                changes += 1;
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < body.try_catch.len() {
            if drop_pure_range(body, i) {
                changes += 1;
            } else {
                i += 1;
            }
        }

        if changes > 0 {
            changes += remove_dead_code(body);
        }
        changes
    }
}
