//! Literal folding: arithmetic on constants, opaque branches, constant
//! switch selectors and pushes that are immediately discarded.

use std::collections::HashSet;

use log::trace;

use crate::cleanup::referenced_members;
use crate::code::{InsnId, Label, MethodBody};
use crate::insn::{ConstValue, Insn, InvokeKind, MathOp, NumKind, StackOp, ValueKind};
use crate::pass::{MethodPass, PassContext, UnitPass};
use crate::unit::{AccessFlags, CompiledUnit, Method};
use crate::smallvm::{evaluate_condition, execute_binary, execute_unary, Value};

/// The node that produced the stack value consumed at `id`, if it sits
/// directly before it. Line markers and labels nobody jumps to are skipped;
/// a referenced label is a join point and ends the search.
pub(crate) fn operand_before(body: &MethodBody, id: InsnId, referenced: &HashSet<Label>) -> Option<InsnId> {
    let mut cur = body.insns.prev(id);
    while let Some(c) = cur {
        match body.insns.get(c)? {
            Insn::LineNumber(_) => cur = body.insns.prev(c),
            Insn::Label(label) if !referenced.contains(label) => cur = body.insns.prev(c),
            Insn::Label(_) => return None,
            _ => return Some(c),
        }
    }
    None
}

/// Collects `count` literal pushes feeding `id`, in push order.
fn const_operands(body: &MethodBody, id: InsnId, count: usize, referenced: &HashSet<Label>) -> Option<Vec<InsnId>> {
    let mut ids = Vec::with_capacity(count);
    let mut at = id;
    for _ in 0..count {
        let prev = operand_before(body, at, referenced)?;
        body.insns.get(prev)?.as_const()?;
        ids.push(prev);
        at = prev;
    }
    ids.reverse();
    Some(ids)
}

fn const_at(body: &MethodBody, id: InsnId) -> Option<&ConstValue> {
    body.insns.get(id).and_then(Insn::as_const)
}

/// `push a; push b; op` becomes `push (a op b)`; `push a; neg` becomes
/// `push -a`; `neg; neg` disappears.
pub struct ConstantFolder;

impl MethodPass for ConstantFolder {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn run(&self, body: &mut MethodBody) -> usize {
        let referenced = body.referenced_labels();
        let mut changes = 0;

        for id in body.insns.ids() {
            let (kind, op) = match body.insns.get(id) {
                Some(Insn::Math { kind, op }) => (*kind, *op),
                _ => continue,
            };

            if op.is_unary() {
                let prev = match operand_before(body, id, &referenced) {
                    Some(prev) => prev,
                    None => continue,
                };
                match body.insns.get(prev) {
                    Some(Insn::Math { kind: k, op: MathOp::Neg }) if *k == kind => {
                        trace!("cancelling double negation");
                        body.insns.remove(prev);
                        body.insns.remove(id);
                        changes += 1;
                    }
                    Some(Insn::Const(value)) => {
                        let folded = Value::from_const(value)
                            .filter(|v| v.kind() == kind)
                            .and_then(|v| execute_unary(op, v).ok());
                        if let Some(result) = folded {
                            body.insns.replace(prev, Insn::Const(result.into_const()));
                            body.insns.remove(id);
                            changes += 1;
                        }
                    }
                    _ => {}
                }
                continue;
            }

            let operands = match const_operands(body, id, 2, &referenced) {
                Some(operands) => operands,
                None => continue,
            };
            let (left, right) = match (
                const_at(body, operands[0]).and_then(Value::from_const),
                const_at(body, operands[1]).and_then(Value::from_const),
            ) {
                (Some(l), Some(r)) => (l, r),
                _ => continue,
            };
            if left.kind() != kind {
                continue;
            }

            match execute_binary(op, left, right) {
                Ok(result) => {
                    trace!("folding {:?} {:?} {:?} = {:?}", left, op, right, result);
                    body.insns.replace(operands[0], Insn::Const(result.into_const()));
                    body.insns.remove(operands[1]);
                    body.insns.remove(id);
                    changes += 1;
                }
                // e.g. division by zero: leave it for the runtime to throw
                Err(e) => trace!("not folding {:?} {:?} {:?}: {}", left, op, right, e),
            }
        }

        changes
    }
}

/// Conditional jumps over literal operands become a `goto` (always taken)
/// or disappear (never taken). The operands go with them.
pub struct DeadBranchEliminator;

impl MethodPass for DeadBranchEliminator {
    fn name(&self) -> &'static str {
        "dead-branch"
    }

    fn run(&self, body: &mut MethodBody) -> usize {
        let referenced = body.referenced_labels();
        let mut changes = 0;

        for id in body.insns.ids() {
            let (cond, target) = match body.insns.get(id) {
                Some(Insn::Branch { cond, target }) => (*cond, *target),
                _ => continue,
            };
            let operands = match const_operands(body, id, cond.operand_count(), &referenced) {
                Some(operands) => operands,
                None => continue,
            };
            let values: Vec<&ConstValue> = operands.iter().filter_map(|o| const_at(body, *o)).collect();

            match evaluate_condition(cond, &values) {
                Some(true) => {
                    trace!("{:?} always jumps to {}", cond, target);
                    body.insns.replace(id, Insn::Jump(target));
                }
                Some(false) => {
                    trace!("{:?} never jumps to {}", cond, target);
                    body.insns.remove(id);
                }
                None => continue,
            }
            for operand in operands {
                body.insns.remove(operand);
            }
            changes += 1;
        }

        changes
    }
}

/// A switch on a literal selector becomes a `goto` to the case it would
/// take.
pub struct ConstantSwitchEliminator;

impl MethodPass for ConstantSwitchEliminator {
    fn name(&self) -> &'static str {
        "constant-switch"
    }

    fn run(&self, body: &mut MethodBody) -> usize {
        let referenced = body.referenced_labels();
        let mut changes = 0;

        for id in body.insns.ids() {
            if !matches!(
                body.insns.get(id),
                Some(Insn::TableSwitch { .. }) | Some(Insn::LookupSwitch { .. })
            ) {
                continue;
            }
            let selector_id = match operand_before(body, id, &referenced) {
                Some(s) => s,
                None => continue,
            };
            let selector = match const_at(body, selector_id) {
                Some(ConstValue::Int(v)) => *v,
                _ => continue,
            };

            let taken = match body.insns.get(id) {
                Some(Insn::TableSwitch {
                    low,
                    high,
                    default,
                    targets,
                }) => {
                    if selector < *low || selector > *high {
                        *default
                    } else {
                        let index = (selector as i64 - *low as i64) as usize;
                        targets.get(index).copied().unwrap_or(*default)
                    }
                }
                Some(Insn::LookupSwitch { default, pairs }) => pairs
                    .iter()
                    .find(|(key, _)| *key == selector)
                    .map(|(_, label)| *label)
                    .unwrap_or(*default),
                _ => continue,
            };

            trace!("switch on {} always goes to {}", selector, taken);
            body.insns.replace(id, Insn::Jump(taken));
            body.insns.remove(selector_id);
            changes += 1;
        }

        changes
    }
}

/// Removes literal pushes that are popped straight away.
pub struct PushPopRemover;

impl MethodPass for PushPopRemover {
    fn name(&self) -> &'static str {
        "push-pop"
    }

    fn run(&self, body: &mut MethodBody) -> usize {
        let referenced = body.referenced_labels();
        let mut changes = 0;

        for id in body.insns.ids() {
            let width = match body.insns.get(id) {
                Some(Insn::Stack(StackOp::Pop)) => 1,
                Some(Insn::Stack(StackOp::Pop2)) => 2,
                _ => continue,
            };
            let first = match operand_before(body, id, &referenced) {
                Some(first) => first,
                None => continue,
            };
            let first_slots = match const_at(body, first) {
                Some(value) => value.slots(),
                None => continue,
            };

            if first_slots == width {
                body.insns.remove(first);
                body.insns.remove(id);
                changes += 1;
            } else if width == 2 && first_slots == 1 {
                // pop2 over two single-slot literals
                let second = match operand_before(body, first, &referenced) {
                    Some(second) => second,
                    None => continue,
                };
                if const_at(body, second).map_or(false, |v| v.slots() == 1) {
                    body.insns.remove(second);
                    body.insns.remove(first);
                    body.insns.remove(id);
                    changes += 1;
                }
            }
        }

        changes
    }
}

/// `static int f(int a, int b) { return a ^ b; }`, in either operand order.
fn is_xor_helper(method: &Method) -> bool {
    if !method.is_static() || method.descriptor != "(II)I" {
        return false;
    }
    let body = match &method.body {
        Some(body) => body,
        None => return false,
    };
    let real: Vec<&Insn> = body.insns.iter().map(|(_, insn)| insn).filter(|insn| insn.is_real()).collect();
    match real.as_slice() {
        [Insn::Load {
            kind: ValueKind::Int,
            slot: a,
        }, Insn::Load {
            kind: ValueKind::Int,
            slot: b,
        }, Insn::Math {
            kind: NumKind::Int,
            op: MathOp::Xor,
        }, Insn::Return(Some(ValueKind::Int))] => (*a, *b) == (0, 1) || (*a, *b) == (1, 0),
        _ => false,
    }
}

/// Replaces calls to a unit's xor helpers on two literals with the result,
/// then removes private helpers nothing calls anymore.
pub struct XorHelperInliner;

impl UnitPass for XorHelperInliner {
    fn name(&self) -> &'static str {
        "xor-helpers"
    }

    fn run(&self, unit: &mut CompiledUnit, _ctx: &mut PassContext) -> usize {
        let helpers: HashSet<String> = unit
            .methods
            .iter()
            .filter(|m| is_xor_helper(m))
            .map(|m| m.name.clone())
            .collect();
        if helpers.is_empty() {
            return 0;
        }

        let unit_name = unit.name.clone();
        let mut changes = 0;
        for body in unit.methods.iter_mut().filter_map(|m| m.body.as_mut()) {
            let referenced = body.referenced_labels();
            for id in body.insns.ids() {
                let is_helper_call = matches!(
                    body.insns.get(id),
                    Some(Insn::Invoke { kind: InvokeKind::Static, owner, name, descriptor, .. })
                        if *owner == unit_name && descriptor == "(II)I" && helpers.contains(name)
                );
                if !is_helper_call {
                    continue;
                }
                let operands = match const_operands(body, id, 2, &referenced) {
                    Some(operands) => operands,
                    None => continue,
                };
                let value = match (const_at(body, operands[0]), const_at(body, operands[1])) {
                    (Some(ConstValue::Int(a)), Some(ConstValue::Int(b))) => a ^ b,
                    _ => continue,
                };
                trace!("{} | xor helper call folds to {}", unit_name, value);
                body.insns.remove(operands[0]);
                body.insns.remove(operands[1]);
                body.insns.replace(id, Insn::Const(ConstValue::Int(value)));
                changes += 1;
            }
        }

        if changes > 0 {
            let (_, called) = referenced_members(unit);
            changes += unit.remove_methods(|m| {
                m.access.contains(AccessFlags::PRIVATE)
                    && helpers.contains(&m.name)
                    && m.descriptor == "(II)I"
                    && !called.contains(&(m.name.clone(), m.descriptor.clone()))
            });
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::tests::insns_of;
    use crate::insn::Cond;

    fn push(v: i32) -> Insn {
        Insn::Const(ConstValue::Int(v))
    }

    fn math(op: MathOp) -> Insn {
        Insn::Math { kind: NumKind::Int, op }
    }

    fn body_of(insns: Vec<Insn>) -> MethodBody {
        let mut body = MethodBody::new(4, 4);
        for insn in insns {
            body.insns.push(insn);
        }
        body
    }

    #[test]
    fn folds_binary_arithmetic() {
        let mut body = body_of(vec![push(10), push(3), math(MathOp::Xor), Insn::Return(Some(ValueKind::Int))]);
        assert_eq!(ConstantFolder.run(&mut body), 1);
        assert_eq!(insns_of(&body), vec![push(9), Insn::Return(Some(ValueKind::Int))]);
    }

    #[test]
    fn folds_chains_in_one_run() {
        // (5 * 4) - 3
        let mut body = body_of(vec![
            push(5),
            push(4),
            math(MathOp::Mul),
            push(3),
            math(MathOp::Sub),
            Insn::Return(Some(ValueKind::Int)),
        ]);
        assert_eq!(ConstantFolder.run(&mut body), 2);
        assert_eq!(insns_of(&body)[0], push(17));
    }

    #[test]
    fn reverse_order_subtraction() {
        let mut body = body_of(vec![push(3), push(5), math(MathOp::Sub)]);
        ConstantFolder.run(&mut body);
        assert_eq!(insns_of(&body), vec![push(-2)]);
    }

    #[test]
    fn negation_and_double_negation() {
        let mut body = body_of(vec![push(7), math(MathOp::Neg)]);
        assert_eq!(ConstantFolder.run(&mut body), 1);
        assert_eq!(insns_of(&body), vec![push(-7)]);

        let load = Insn::Load { kind: ValueKind::Int, slot: 1 };
        let mut body = body_of(vec![load.clone(), math(MathOp::Neg), math(MathOp::Neg)]);
        assert_eq!(ConstantFolder.run(&mut body), 1);
        assert_eq!(insns_of(&body), vec![load]);
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let mut body = body_of(vec![push(1), push(0), math(MathOp::Div)]);
        assert_eq!(ConstantFolder.run(&mut body), 0);
        assert_eq!(insns_of(&body).len(), 3);
    }

    #[test]
    fn jump_target_between_operands_blocks_folding() {
        let mut body = MethodBody::new(2, 2);
        let join = body.insns.new_label();
        body.insns.push(push(1));
        body.insns.push(Insn::Label(join));
        body.insns.push(push(2));
        body.insns.push(math(MathOp::Add));
        body.insns.push(Insn::Jump(join));
        assert_eq!(ConstantFolder.run(&mut body), 0);
    }

    #[test]
    fn dead_branches_are_resolved_for_every_comparison() {
        let conds = [
            Cond::IcmpEq,
            Cond::IcmpNe,
            Cond::IcmpLt,
            Cond::IcmpGe,
            Cond::IcmpGt,
            Cond::IcmpLe,
        ];
        for cond in conds.iter() {
            for (a, b) in [(1, 2), (2, 2), (3, 2)].iter() {
                let mut body = MethodBody::new(2, 0);
                let target = body.insns.new_label();
                body.insns.push(push(*a));
                body.insns.push(push(*b));
                body.insns.push(Insn::Branch { cond: *cond, target });
                body.insns.push(Insn::Label(target));
                body.insns.push(Insn::Return(None));

                assert_eq!(DeadBranchEliminator.run(&mut body), 1);
                let insns = insns_of(&body);
                assert!(!insns.iter().any(|i| matches!(i, Insn::Branch { .. })));
                assert!(!insns.iter().any(|i| matches!(i, Insn::Const(_))));
                let expected = smallvm_truth(*cond, *a, *b);
                assert_eq!(insns.contains(&Insn::Jump(target)), expected, "{:?} {} {}", cond, a, b);
            }
        }
    }

    fn smallvm_truth(cond: Cond, a: i32, b: i32) -> bool {
        match cond {
            Cond::IcmpEq => a == b,
            Cond::IcmpNe => a != b,
            Cond::IcmpLt => a < b,
            Cond::IcmpGe => a >= b,
            Cond::IcmpGt => a > b,
            _ => a <= b,
        }
    }

    #[test]
    fn single_operand_and_null_branches() {
        let mut body = MethodBody::new(1, 0);
        let target = body.insns.new_label();
        body.insns.push(Insn::Const(ConstValue::Null));
        body.insns.push(Insn::Branch { cond: Cond::IfNonNull, target });
        body.insns.push(push(0));
        body.insns.push(Insn::Branch { cond: Cond::IfEq, target });
        body.insns.push(Insn::Label(target));
        body.insns.push(Insn::Return(None));

        assert_eq!(DeadBranchEliminator.run(&mut body), 2);
        assert_eq!(
            insns_of(&body),
            vec![Insn::Jump(target), Insn::Label(target), Insn::Return(None)]
        );
    }

    #[test]
    fn table_switch_out_of_range_takes_default() {
        let mut body = MethodBody::new(1, 0);
        let cases: Vec<Label> = (0..4).map(|_| body.insns.new_label()).collect();
        let default = body.insns.new_label();
        body.insns.push(push(7));
        body.insns.push(Insn::TableSwitch {
            low: 2,
            high: 5,
            default,
            targets: cases.clone(),
        });
        for label in cases.iter().chain(std::iter::once(&default)) {
            body.insns.push(Insn::Label(*label));
            body.insns.push(Insn::Return(None));
        }

        assert_eq!(ConstantSwitchEliminator.run(&mut body), 1);
        assert_eq!(insns_of(&body)[0], Insn::Jump(default));
    }

    #[test]
    fn table_switch_in_range_and_lookup_switch() {
        let mut body = MethodBody::new(1, 0);
        let a = body.insns.new_label();
        let b = body.insns.new_label();
        let d = body.insns.new_label();
        body.insns.push(push(5));
        body.insns.push(Insn::TableSwitch {
            low: 4,
            high: 5,
            default: d,
            targets: vec![a, b],
        });
        body.insns.push(push(-3));
        body.insns.push(Insn::LookupSwitch {
            default: d,
            pairs: vec![(-3, a), (9, b)],
        });
        for label in [a, b, d].iter() {
            body.insns.push(Insn::Label(*label));
            body.insns.push(Insn::Return(None));
        }

        assert_eq!(ConstantSwitchEliminator.run(&mut body), 2);
        let insns = insns_of(&body);
        assert_eq!(insns[0], Insn::Jump(b));
        assert_eq!(insns[1], Insn::Jump(a));
    }

    #[test]
    fn discarded_pushes_are_removed() {
        let mut body = body_of(vec![
            Insn::Const(ConstValue::Str("junk".into())),
            Insn::Stack(StackOp::Pop),
            Insn::Const(ConstValue::Long(5)),
            Insn::Stack(StackOp::Pop2),
            push(1),
            push(2),
            Insn::Stack(StackOp::Pop2),
            Insn::Return(None),
        ]);
        assert_eq!(PushPopRemover.run(&mut body), 3);
        assert_eq!(insns_of(&body), vec![Insn::Return(None)]);
    }

    #[test]
    fn mismatched_pop_width_is_kept() {
        let mut body = body_of(vec![Insn::Const(ConstValue::Long(5)), Insn::Stack(StackOp::Pop)]);
        assert_eq!(PushPopRemover.run(&mut body), 0);
    }

    #[test]
    fn xor_helper_calls_on_literals_fold() {
        let helper = body_of(vec![
            Insn::Load { kind: ValueKind::Int, slot: 1 },
            Insn::Load { kind: ValueKind::Int, slot: 0 },
            math(MathOp::Xor),
            Insn::Return(Some(ValueKind::Int)),
        ]);
        let call = Insn::Invoke {
            kind: InvokeKind::Static,
            owner: "t/Host".to_string(),
            name: "pyeyrrglswhnwgns".to_string(),
            descriptor: "(II)I".to_string(),
            interface: false,
        };
        let main = body_of(vec![
            push(1784610355),
            push(659658962),
            call.clone(),
            Insn::Store { kind: ValueKind::Int, slot: 1 },
            Insn::Load { kind: ValueKind::Int, slot: 0 },
            push(3),
            call,
            Insn::Return(Some(ValueKind::Int)),
        ]);

        let mut unit = CompiledUnit::new("t/Host", "java/lang/Object").unwrap();
        unit.add_method(AccessFlags::PRIVATE | AccessFlags::STATIC, "pyeyrrglswhnwgns", "(II)I", Some(helper))
            .unwrap();
        unit.add_method(AccessFlags::STATIC, "main", "(I)I", Some(main)).unwrap();

        // the second call has a non-literal operand, so the helper stays
        assert_eq!(XorHelperInliner.run(&mut unit, &mut PassContext::default()), 1);
        let body = unit.find_method("main", "(I)I").unwrap().body.as_ref().unwrap();
        assert_eq!(insns_of(body)[..2], [push(1784610355 ^ 659658962), Insn::Store { kind: ValueKind::Int, slot: 1 }]);
        assert!(unit.find_method("pyeyrrglswhnwgns", "(II)I").is_some());
    }
}
