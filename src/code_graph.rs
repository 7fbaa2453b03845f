use bitflags::bitflags;
use log::trace;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::code::{InsnId, Label, MethodBody};
use crate::insn::Insn;

bitflags! {
    #[derive(Default)]
    pub struct BasicBlockFlags: u32 {
        /// The method entry block
        const ENTRY = 0b00000001;

        /// Start of an exception handler
        const HANDLER = 0b00000010;

        /// Ends in an instruction with no fall-through
        const TERMINAL = 0b00000100;
    }
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum EdgeWeight {
    NonJump,
    Jump,
    Exception,
}

impl fmt::Display for EdgeWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?}", self)
    }
}

/// A run of nodes with a single entry. Labels and line markers are kept in
/// the block they precede.
#[derive(Debug, Default, Clone)]
pub struct BasicBlock {
    /// Nodes in this block, in list order
    pub instrs: Vec<InsnId>,
    /// Labels bound inside this block
    pub labels: Vec<Label>,
    pub flags: BasicBlockFlags,
}

impl BasicBlock {
    fn has_real(&self, body: &MethodBody) -> bool {
        self.instrs
            .iter()
            .any(|id| body.insns.get(*id).map_or(false, Insn::is_real))
    }

    /// Renders the block the way it shows up in graph output.
    pub fn render(&self, body: &MethodBody) -> String {
        let mut out = String::new();
        if !self.flags.is_empty() {
            out.push_str(&format!("Flags: {:?}\n", self.flags));
        }
        for id in &self.instrs {
            if let Some(insn) = body.insns.get(*id) {
                out.push_str(&format!("{}\n", insn));
            }
        }
        out
    }
}

/// A method body represented as a graph of basic blocks. The graph is a
/// read-only view; it is rebuilt after every mutation of the body.
pub struct CodeGraph {
    pub(crate) root: Option<NodeIndex>,
    pub(crate) graph: Graph<BasicBlock, EdgeWeight>,
}

impl CodeGraph {
    pub fn from_body(body: &MethodBody) -> CodeGraph {
        let mut graph = Graph::<BasicBlock, EdgeWeight>::new();
        let mut blocks: Vec<NodeIndex> = vec![];
        let mut block_of_label: HashMap<Label, NodeIndex> = HashMap::new();
        let mut positions: HashMap<InsnId, usize> = HashMap::new();

        let mut current = BasicBlock::default();
        let mut current_has_real = false;
        let mut split_next = false;

        macro_rules! finish_block {
            () => {
                if !current.instrs.is_empty() {
                    let labels = current.labels.clone();
                    let index = graph.add_node(std::mem::take(&mut current));
                    for label in labels {
                        block_of_label.insert(label, index);
                    }
                    blocks.push(index);
                }
                current_has_real = false;
            };
        }

        for (pos, (id, insn)) in body.insns.iter().enumerate() {
            positions.insert(id, pos);
            let starts_block = split_next || (matches!(insn, Insn::Label(_)) && current_has_real);
            if starts_block {
                finish_block!();
                split_next = false;
            }

            if let Insn::Label(label) = insn {
                current.labels.push(*label);
            }
            current.instrs.push(id);
            if insn.is_real() {
                current_has_real = true;
                if insn.is_jump() || !insn.falls_through() {
                    split_next = true;
                }
            }
        }
        finish_block!();

        let root = blocks.first().copied();
        if let Some(root) = root {
            graph[root].flags |= BasicBlockFlags::ENTRY;
        }

        let mut edges = vec![];
        for (i, &node) in blocks.iter().enumerate() {
            let last_real = graph[node]
                .instrs
                .iter()
                .rev()
                .filter_map(|id| body.insns.get(*id))
                .find(|insn| insn.is_real());

            let falls_through = last_real.map_or(true, Insn::falls_through);
            if falls_through {
                if let Some(next) = blocks.get(i + 1) {
                    edges.push((node, *next, EdgeWeight::NonJump));
                }
            } else {
                graph[node].flags |= BasicBlockFlags::TERMINAL;
            }

            if let Some(insn) = last_real {
                for target in insn.targets() {
                    if let Some(dest) = block_of_label.get(&target) {
                        edges.push((node, *dest, EdgeWeight::Jump));
                    }
                }
            }
        }

        // A handler is reachable from every block with at least one real
        // instruction inside its protected range
        for range in &body.try_catch {
            let (start, end, handler) = match (
                body.insns.label_node(range.start).and_then(|id| positions.get(&id)),
                body.insns.label_node(range.end).and_then(|id| positions.get(&id)),
                block_of_label.get(&range.handler),
            ) {
                (Some(s), Some(e), Some(h)) => (*s, *e, *h),
                _ => continue,
            };
            graph[handler].flags |= BasicBlockFlags::HANDLER;

            for &node in &blocks {
                let covered = graph[node].instrs.iter().any(|id| {
                    let pos = positions[id];
                    pos >= start && pos < end && body.insns.get(*id).map_or(false, Insn::is_real)
                });
                if covered {
                    edges.push((node, handler, EdgeWeight::Exception));
                }
            }
        }

        for (from, to, weight) in edges {
            graph.add_edge(from, to, weight);
        }

        CodeGraph { root, graph }
    }

    /// Every node (metadata included) in a block reachable from the entry.
    pub fn reachable_insns(&self) -> HashSet<InsnId> {
        let mut reachable = HashSet::new();
        let root = match self.root {
            Some(root) => root,
            None => return reachable,
        };

        let mut dfs = Dfs::new(&self.graph, root);
        while let Some(node) = dfs.next(&self.graph) {
            reachable.extend(self.graph[node].instrs.iter().copied());
        }

        reachable
    }

    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Graphviz rendering of the graph.
    pub fn to_dot(&self, body: &MethodBody) -> String {
        let rendered = self.graph.map(|_, bb| bb.render(body), |_, edge| *edge);
        format!("{}", Dot::with_config(&rendered, &[Config::EdgeNoLabel]))
    }
}

/// Deletes every instruction the entry can't reach, then every exception
/// range left without real instructions, then every label nothing refers to.
/// Returns the number of deletions; a second call right after always
/// returns 0.
pub fn remove_dead_code(body: &mut MethodBody) -> usize {
    let graph = CodeGraph::from_body(body);
    let live = graph.reachable_insns();

    let dead: Vec<InsnId> = body
        .insns
        .iter()
        .filter(|(id, insn)| !matches!(insn, Insn::Label(_)) && !live.contains(id))
        .map(|(id, _)| id)
        .collect();
    for id in &dead {
        if let Some(insn) = body.insns.remove(*id) {
            trace!("removing unreachable {}", insn);
        }
    }

    let mut removed = dead.len();
    let mut i = 0;
    while i < body.try_catch.len() {
        let range = &body.try_catch[i];
        if body.real_insns_between(range.start, range.end).is_empty() {
            trace!("dropping exception range with no body: {:?}", range);
            body.remove_range(i);
            removed += 1;
        } else {
            i += 1;
        }
    }

    body.prune_labels();
    removed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::code::tests::insns_of;
    use crate::code::ExceptionRange;
    use crate::insn::{ConstValue, Cond, ValueKind};

    #[test]
    fn code_after_goto_is_removed() {
        let mut body = MethodBody::new(1, 1);
        let target = body.insns.new_label();
        body.insns.push(Insn::Jump(target));
        body.insns.push(Insn::Const(ConstValue::Int(1)));
        body.insns.push(Insn::Stack(crate::insn::StackOp::Pop));
        body.insns.push(Insn::Label(target));
        body.insns.push(Insn::Return(None));

        assert_eq!(remove_dead_code(&mut body), 2);
        assert_eq!(
            insns_of(&body),
            vec![Insn::Jump(target), Insn::Label(target), Insn::Return(None)]
        );
    }

    #[test]
    fn dead_code_elimination_is_idempotent() {
        let mut body = MethodBody::new(1, 2);
        let top = body.insns.push_label();
        let exit = body.insns.new_label();
        let orphan = body.insns.new_label();
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 0 });
        body.insns.push(Insn::Branch { cond: Cond::IfEq, target: exit });
        body.insns.push(Insn::Iinc { slot: 0, delta: -1 });
        body.insns.push(Insn::Jump(top));
        body.insns.push(Insn::Label(orphan));
        body.insns.push(Insn::Const(ConstValue::Null));
        body.insns.push(Insn::Throw);
        body.insns.push(Insn::Label(exit));
        body.insns.push(Insn::Return(None));

        remove_dead_code(&mut body);
        let once = insns_of(&body);
        assert_eq!(remove_dead_code(&mut body), 0);
        assert_eq!(insns_of(&body), once);
        assert!(!once.contains(&Insn::Throw));
        assert!(once.contains(&Insn::Iinc { slot: 0, delta: -1 }));
    }

    #[test]
    fn handlers_of_live_ranges_are_kept() {
        let mut body = MethodBody::new(1, 1);
        let start = body.insns.push_label();
        body.insns.push(Insn::Simple(crate::opcodes::NOP));
        let end = body.insns.push_label();
        body.insns.push(Insn::Return(None));
        let handler = body.insns.push_label();
        body.insns.push(Insn::Stack(crate::insn::StackOp::Pop));
        body.insns.push(Insn::Return(None));
        body.try_catch.push(ExceptionRange {
            start,
            end,
            handler,
            catch_type: None,
        });

        assert_eq!(remove_dead_code(&mut body), 0);
        assert_eq!(body.try_catch.len(), 1);
        assert_eq!(insns_of(&body).len(), 7);
    }

    #[test]
    fn graph_has_expected_shape() {
        let mut body = MethodBody::new(1, 1);
        let exit = body.insns.new_label();
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 0 });
        body.insns.push(Insn::Branch { cond: Cond::IfNe, target: exit });
        body.insns.push(Insn::Return(None));
        body.insns.push(Insn::Label(exit));
        body.insns.push(Insn::Return(None));

        let graph = CodeGraph::from_body(&body);
        assert_eq!(graph.block_count(), 3);
        assert_eq!(graph.graph.edge_count(), 2);
        assert!(graph.to_dot(&body).contains("digraph"));
    }
}
