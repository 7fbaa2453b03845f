use std::collections::{HashMap, HashSet};
use std::fmt;

use log::trace;

use crate::insn::Insn;

/// Stable handle to a node of an [`InsnList`]. Stays valid (and never gets
/// reused) no matter what is inserted or removed elsewhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(u32);

/// Jump target identity. A label is bound to at most one `Insn::Label` node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Node {
    insn: Insn,
    prev: Option<InsnId>,
    next: Option<InsnId>,
    live: bool,
}

/// A doubly-linked instruction sequence stored in an arena.
#[derive(Debug, Clone, Default)]
pub struct InsnList {
    nodes: Vec<Node>,
    head: Option<InsnId>,
    tail: Option<InsnId>,
    len: usize,
    labels: HashMap<Label, InsnId>,
    next_label: u32,
    modified: bool,
}

impl InsnList {
    pub fn new() -> InsnList {
        InsnList::default()
    }

    /// Allocates a fresh label that isn't placed anywhere yet.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn alloc(&mut self, insn: Insn) -> InsnId {
        let id = InsnId(self.nodes.len() as u32);
        if let Insn::Label(label) = &insn {
            debug_assert!(!self.labels.contains_key(label), "label {} placed twice", label);
            self.labels.insert(*label, id);
            if label.0 >= self.next_label {
                self.next_label = label.0 + 1;
            }
        }
        self.nodes.push(Node {
            insn,
            prev: None,
            next: None,
            live: true,
        });
        self.len += 1;
        id
    }

    fn node(&self, id: InsnId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).filter(|n| n.live)
    }

    pub fn push(&mut self, insn: Insn) -> InsnId {
        let id = self.alloc(insn);
        match self.tail {
            Some(tail) => {
                self.nodes[tail.0 as usize].next = Some(id);
                self.nodes[id.0 as usize].prev = Some(tail);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Places a new label at the end of the list and returns it.
    pub fn push_label(&mut self) -> Label {
        let label = self.new_label();
        self.push(Insn::Label(label));
        label
    }

    pub fn insert_before(&mut self, at: InsnId, insn: Insn) -> InsnId {
        let id = self.alloc(insn);
        let prev = self.nodes[at.0 as usize].prev;
        self.nodes[id.0 as usize].prev = prev;
        self.nodes[id.0 as usize].next = Some(at);
        self.nodes[at.0 as usize].prev = Some(id);
        match prev {
            Some(prev) => self.nodes[prev.0 as usize].next = Some(id),
            None => self.head = Some(id),
        }
        self.modified = true;
        id
    }

    pub fn insert_after(&mut self, at: InsnId, insn: Insn) -> InsnId {
        let id = self.alloc(insn);
        let next = self.nodes[at.0 as usize].next;
        self.nodes[id.0 as usize].prev = Some(at);
        self.nodes[id.0 as usize].next = next;
        self.nodes[at.0 as usize].next = Some(id);
        match next {
            Some(next) => self.nodes[next.0 as usize].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.modified = true;
        id
    }

    fn unlink(&mut self, id: InsnId) -> Option<Insn> {
        let node = self.node(id)?;
        let (prev, next) = (node.prev, node.next);
        match prev {
            Some(prev) => self.nodes[prev.0 as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next.0 as usize].prev = prev,
            None => self.tail = prev,
        }

        let node = &mut self.nodes[id.0 as usize];
        node.live = false;
        node.prev = None;
        node.next = None;
        self.len -= 1;
        self.modified = true;

        let insn = std::mem::replace(&mut node.insn, Insn::Simple(0));
        if let Insn::Label(label) = &insn {
            self.labels.remove(label);
        }
        Some(insn)
    }

    /// Removes a node and returns it. Label nodes are refused: they only go
    /// away through [`MethodBody::prune_labels`] once nothing refers to them.
    pub fn remove(&mut self, id: InsnId) -> Option<Insn> {
        let is_label = matches!(self.get(id)?, Insn::Label(_));
        if is_label {
            None
        } else {
            self.unlink(id)
        }
    }

    /// Swaps the instruction held by a node. Labels can't be replaced and
    /// can't be introduced this way.
    pub fn replace(&mut self, id: InsnId, insn: Insn) -> Option<Insn> {
        if matches!(insn, Insn::Label(_)) {
            return None;
        }
        let node = self.nodes.get_mut(id.0 as usize).filter(|n| n.live)?;
        if matches!(node.insn, Insn::Label(_)) {
            return None;
        }
        self.modified = true;
        Some(std::mem::replace(&mut node.insn, insn))
    }

    pub fn get(&self, id: InsnId) -> Option<&Insn> {
        self.node(id).map(|n| &n.insn)
    }

    pub fn contains(&self, id: InsnId) -> bool {
        self.node(id).is_some()
    }

    pub fn first(&self) -> Option<InsnId> {
        self.head
    }

    pub fn last(&self) -> Option<InsnId> {
        self.tail
    }

    pub fn next(&self, id: InsnId) -> Option<InsnId> {
        self.node(id)?.next
    }

    pub fn prev(&self, id: InsnId) -> Option<InsnId> {
        self.node(id)?.prev
    }

    /// Next node after `id` that isn't a label or line marker.
    pub fn next_real(&self, id: InsnId) -> Option<InsnId> {
        let mut cur = self.next(id);
        while let Some(c) = cur {
            if self.nodes[c.0 as usize].insn.is_real() {
                return Some(c);
            }
            cur = self.next(c);
        }
        None
    }

    pub fn prev_real(&self, id: InsnId) -> Option<InsnId> {
        let mut cur = self.prev(id);
        while let Some(c) = cur {
            if self.nodes[c.0 as usize].insn.is_real() {
                return Some(c);
            }
            cur = self.prev(c);
        }
        None
    }

    /// First real node at or after `id`.
    pub fn real_from(&self, id: InsnId) -> Option<InsnId> {
        if self.get(id)?.is_real() {
            Some(id)
        } else {
            self.next_real(id)
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cur: self.head,
        }
    }

    /// Snapshot of node ids in order. Safe to hold while mutating the list.
    pub fn ids(&self) -> Vec<InsnId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn label_node(&self, label: Label) -> Option<InsnId> {
        self.labels.get(&label).copied()
    }

    /// Returns a label bound directly before `id`, skipping over other
    /// metadata nodes, placing a new one if there is none.
    pub fn label_at(&mut self, id: InsnId) -> Label {
        let mut cur = self.prev(id);
        while let Some(c) = cur {
            match &self.nodes[c.0 as usize].insn {
                Insn::Label(label) => return *label,
                Insn::LineNumber(_) => cur = self.prev(c),
                _ => break,
            }
        }
        if let Some(Insn::Label(label)) = self.get(id) {
            return *label;
        }

        let label = self.new_label();
        self.insert_before(id, Insn::Label(label));
        label
    }

    /// Applies `redirects` to every jump and switch target. Returns the
    /// number of references that changed.
    pub fn redirect(&mut self, redirects: &HashMap<Label, Label>) -> usize {
        let mut changed = 0;
        for node in self.nodes.iter_mut().filter(|n| n.live) {
            node.insn.for_each_target_mut(|target| {
                if let Some(new) = redirects.get(target) {
                    if new != target {
                        *target = *new;
                        changed += 1;
                    }
                }
            });
        }
        if changed > 0 {
            self.modified = true;
        }
        changed
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

pub struct Iter<'a> {
    list: &'a InsnList,
    cur: Option<InsnId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (InsnId, &'a Insn);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let node = &self.list.nodes[id.0 as usize];
        self.cur = node.next;
        Some((id, &node.insn))
    }
}

/// A protected range. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRange {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// `None` catches everything
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub name: String,
    pub descriptor: String,
    pub start: Label,
    pub end: Label,
    pub index: u16,
}

/// A decoded method body: instruction list plus the structures that refer
/// into it by label.
#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: InsnList,
    pub try_catch: Vec<ExceptionRange>,
    pub locals: Vec<LocalVariable>,
    dirty: bool,
}

impl MethodBody {
    pub fn new(max_stack: u16, max_locals: u16) -> MethodBody {
        MethodBody {
            max_stack,
            max_locals,
            ..Default::default()
        }
    }

    pub fn is_modified(&self) -> bool {
        self.dirty || self.insns.is_modified()
    }

    /// Labels referenced by an instruction, exception range or local
    /// variable entry.
    pub fn referenced_labels(&self) -> HashSet<Label> {
        let mut referenced = HashSet::new();
        for (_, insn) in self.insns.iter() {
            referenced.extend(insn.targets());
        }
        for range in &self.try_catch {
            referenced.insert(range.start);
            referenced.insert(range.end);
            referenced.insert(range.handler);
        }
        for local in &self.locals {
            referenced.insert(local.start);
            referenced.insert(local.end);
        }
        referenced
    }

    /// Redirects jumps, switches and (optionally) exception handlers.
    pub fn redirect_all(&mut self, redirects: &HashMap<Label, Label>, include_handlers: bool) -> usize {
        let mut changed = self.insns.redirect(redirects);
        if include_handlers {
            for range in self.try_catch.iter_mut() {
                if let Some(new) = redirects.get(&range.handler) {
                    if *new != range.handler {
                        range.handler = *new;
                        changed += 1;
                    }
                }
            }
            if changed > 0 {
                self.dirty = true;
            }
        }
        changed
    }

    /// Deletes every label node nothing refers to anymore.
    pub fn prune_labels(&mut self) -> usize {
        let referenced = self.referenced_labels();
        let unreferenced: Vec<InsnId> = self
            .insns
            .iter()
            .filter_map(|(id, insn)| match insn {
                Insn::Label(label) if !referenced.contains(label) => Some(id),
                _ => None,
            })
            .collect();
        for id in &unreferenced {
            self.insns.unlink(*id);
        }
        if !unreferenced.is_empty() {
            trace!("pruned {} labels", unreferenced.len());
        }
        unreferenced.len()
    }

    pub fn remove_range(&mut self, index: usize) -> ExceptionRange {
        self.dirty = true;
        self.try_catch.remove(index)
    }

    /// Real instructions between two labels, `end` exclusive. Empty if the
    /// labels are missing or out of order.
    pub fn real_insns_between(&self, start: Label, end: Label) -> Vec<InsnId> {
        let (start, end) = match (self.insns.label_node(start), self.insns.label_node(end)) {
            (Some(s), Some(e)) => (s, e),
            _ => return vec![],
        };
        let mut out = vec![];
        let mut cur = Some(start);
        while let Some(c) = cur {
            if c == end {
                return out;
            }
            if self.insns.get(c).map_or(false, Insn::is_real) {
                out.push(c);
            }
            cur = self.insns.next(c);
        }
        // ran off the end without meeting `end`
        vec![]
    }

    pub fn flow_index(&self) -> FlowIndex {
        FlowIndex::build(self)
    }
}

/// Derived lookups over a method body. Rebuilt on demand; never updated in
/// place.
#[derive(Debug, Default)]
pub struct FlowIndex {
    pub order: Vec<InsnId>,
    pub positions: HashMap<InsnId, usize>,
    pub label_positions: HashMap<Label, usize>,
    /// Instructions that jump or switch to each label
    pub jump_sources: HashMap<Label, Vec<InsnId>>,
    /// (start, end, handler, type) by position
    pub ranges: Vec<(usize, usize, usize, Option<String>)>,
}

impl FlowIndex {
    fn build(body: &MethodBody) -> FlowIndex {
        let mut index = FlowIndex::default();
        for (pos, (id, insn)) in body.insns.iter().enumerate() {
            index.order.push(id);
            index.positions.insert(id, pos);
            if let Insn::Label(label) = insn {
                index.label_positions.insert(*label, pos);
            }
            for target in insn.targets() {
                index.jump_sources.entry(target).or_default().push(id);
            }
        }
        for range in &body.try_catch {
            if let (Some(s), Some(e), Some(h)) = (
                index.label_positions.get(&range.start),
                index.label_positions.get(&range.end),
                index.label_positions.get(&range.handler),
            ) {
                index.ranges.push((*s, *e, *h, range.catch_type.clone()));
            }
        }
        index
    }

    pub fn is_jump_target(&self, label: Label) -> bool {
        self.jump_sources.get(&label).map_or(false, |s| !s.is_empty())
    }

    /// Whether the instruction at `pos` lies inside some protected range.
    pub fn is_protected(&self, pos: usize) -> bool {
        self.ranges.iter().any(|(s, e, _, _)| *s <= pos && pos < *e)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::insn::{ConstValue, ValueKind};

    /// Collects the instructions of a list for comparisons.
    pub(crate) fn insns_of(body: &MethodBody) -> Vec<Insn> {
        body.insns.iter().map(|(_, i)| i.clone()).collect()
    }

    #[test]
    fn ids_survive_unrelated_edits() {
        let mut list = InsnList::new();
        let a = list.push(Insn::Const(ConstValue::Int(1)));
        let b = list.push(Insn::Const(ConstValue::Int(2)));
        let c = list.push(Insn::Return(Some(ValueKind::Int)));
        list.remove(a);
        list.insert_before(c, Insn::Throw);
        assert_eq!(list.get(b), Some(&Insn::Const(ConstValue::Int(2))));
        let tail = list.insert_after(c, Insn::Return(None));
        assert_eq!(list.len(), 4);
        assert_eq!(list.first(), Some(b));
        assert_eq!(list.next(c), Some(tail));
        assert!(!list.contains(a));
        assert!(list.is_modified());
    }

    #[test]
    fn labels_cannot_be_removed_directly() {
        let mut list = InsnList::new();
        let label = list.push_label();
        let id = list.label_node(label).unwrap();
        assert!(list.remove(id).is_none());
        assert!(list.replace(id, Insn::Throw).is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn prune_keeps_referenced_labels() {
        let mut body = MethodBody::new(1, 1);
        let used = body.insns.new_label();
        let unused = body.insns.push_label();
        body.insns.push(Insn::Jump(used));
        body.insns.push(Insn::Label(used));
        body.insns.push(Insn::Return(None));

        assert_eq!(body.prune_labels(), 1);
        assert!(body.insns.label_node(unused).is_none());
        assert!(body.insns.label_node(used).is_some());
    }

    #[test]
    fn redirect_updates_jumps_and_handlers() {
        let mut body = MethodBody::new(1, 1);
        let a = body.insns.new_label();
        let b = body.insns.new_label();
        let start = body.insns.push_label();
        body.insns.push(Insn::Jump(a));
        let end = body.insns.push_label();
        body.insns.push(Insn::Label(a));
        body.insns.push(Insn::Label(b));
        body.insns.push(Insn::Return(None));
        body.try_catch.push(ExceptionRange {
            start,
            end,
            handler: a,
            catch_type: None,
        });

        let redirects: HashMap<Label, Label> = vec![(a, b)].into_iter().collect();
        assert_eq!(body.redirect_all(&redirects, true), 2);
        assert_eq!(body.try_catch[0].handler, b);
        assert!(body.flow_index().is_jump_target(b));
        let index = body.flow_index();
        assert!(!index.is_jump_target(a));
        // only the jump sits between start and end
        assert!(index.is_protected(1));
        assert!(!index.is_protected(4));
    }

    #[test]
    fn label_at_reuses_existing_label() {
        let mut list = InsnList::new();
        let label = list.push_label();
        list.push(Insn::LineNumber(3));
        let ret = list.push(Insn::Return(None));
        assert_eq!(list.label_at(ret), label);

        let mut list = InsnList::new();
        list.push(Insn::Const(ConstValue::Null));
        let ret = list.push(Insn::Return(Some(ValueKind::Ref)));
        let fresh = list.label_at(ret);
        assert_eq!(list.prev(ret), list.label_node(fresh));
    }
}
