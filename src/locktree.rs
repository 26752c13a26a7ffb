use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::registry::LockId;

/// The locks a thread holds, in the order it acquired them.
///
/// Frames are immutable and shared: pushing a lock reuses the existing stack as
/// the parent, and releasing rebuilds only the frames above the released lock.
/// Stacks that were recorded earlier stay valid, so a set of historical stacks
/// costs one frame per distinct nesting step.
#[derive(Clone, Default)]
pub struct LockStack(Option<Arc<LockFrame>>);

struct LockFrame {
    lock: LockId,
    parent: LockStack,
    depth: usize,
    hash: u64,
}

impl LockStack {
    pub const HEAD: LockStack = LockStack(None);

    pub fn head() -> Self {
        LockStack(None)
    }

    fn push(&self, lock: LockId) -> Self {
        let hash = self.cached_hash().wrapping_mul(31).wrapping_add(lock ^ (lock >> 32));
        LockStack(Some(Arc::new(LockFrame {
            lock,
            parent: self.clone(),
            depth: self.depth() + 1,
            hash,
        })))
    }

    /// Pushes `lock` unless it is already somewhere on the stack.
    pub fn acquire(&self, lock: LockId) -> Self {
        if self.contains(lock) {
            self.clone()
        } else {
            self.push(lock)
        }
    }

    /// Removes the innermost frame for `lock`. Frames below it are shared
    /// with `self`; frames above it are re-pushed in their original order.
    pub fn release(&self, lock: LockId) -> Self {
        if !self.contains(lock) {
            return self.clone();
        }
        let mut above = Vec::new();
        let mut cur = self.clone();
        while let Some(frame) = cur.0.clone() {
            if frame.lock == lock {
                let mut rebuilt = frame.parent.clone();
                for id in above.into_iter().rev() {
                    rebuilt = rebuilt.push(id);
                }
                return rebuilt;
            }
            above.push(frame.lock);
            cur = frame.parent.clone();
        }
        self.clone()
    }

    pub fn contains(&self, lock: LockId) -> bool {
        self.frames().any(|id| id == lock)
    }

    pub fn top(&self) -> Option<LockId> {
        self.0.as_ref().map(|f| f.lock)
    }

    pub fn parent(&self) -> Option<&LockStack> {
        self.0.as_ref().map(|f| &f.parent)
    }

    pub fn is_head(&self) -> bool {
        self.0.is_none()
    }

    pub fn depth(&self) -> usize {
        self.0.as_ref().map_or(0, |f| f.depth)
    }

    /// Lock ids from the innermost (most recently acquired) outwards.
    pub fn frames(&self) -> impl Iterator<Item = LockId> + '_ {
        let mut cur = self.0.as_deref();
        std::iter::from_fn(move || {
            let frame = cur?;
            cur = frame.parent.0.as_deref();
            Some(frame.lock)
        })
    }

    /// Lock ids from the outermost lock inwards.
    pub fn locks(&self) -> Vec<LockId> {
        let mut ids: Vec<LockId> = self.frames().collect();
        ids.reverse();
        ids
    }

    /// `(outer, inner)` for each directly nested pair on the stack.
    pub fn nesting_pairs(&self) -> impl Iterator<Item = (LockId, LockId)> + '_ {
        let mut cur = self.0.as_deref();
        std::iter::from_fn(move || loop {
            let frame = cur?;
            cur = frame.parent.0.as_deref();
            if let Some(outer) = frame.parent.top() {
                return Some((outer, frame.lock));
            }
        })
    }

    pub fn build_path(&self) -> String {
        self.locks().iter().map(|id| format!("->{id}")).collect()
    }

    fn cached_hash(&self) -> u64 {
        self.0.as_ref().map_or(1, |f| f.hash)
    }
}

impl Drop for LockFrame {
    fn drop(&mut self) {
        // unlink uniquely owned parents one by one instead of recursively
        let mut next = self.parent.0.take();
        while let Some(frame) = next {
            match Arc::try_unwrap(frame) {
                Ok(mut frame) => next = frame.parent.0.take(),
                Err(_) => break,
            }
        }
    }
}

impl PartialEq for LockStack {
    fn eq(&self, other: &Self) -> bool {
        let (mut a, mut b) = (self.0.as_ref(), other.0.as_ref());
        loop {
            match (a, b) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    if Arc::ptr_eq(x, y) {
                        return true;
                    }
                    if x.hash != y.hash || x.depth != y.depth || x.lock != y.lock {
                        return false;
                    }
                    a = x.parent.0.as_ref();
                    b = y.parent.0.as_ref();
                }
                _ => return false,
            }
        }
    }
}

impl Eq for LockStack {}

impl Hash for LockStack {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.cached_hash());
    }
}

impl std::fmt::Debug for LockStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_head() {
            write!(f, "HEAD")
        } else {
            write!(f, "HEAD{}", self.build_path())
        }
    }
}

/// Directed "acquired while holding" graph over canonical lock ids, built from
/// every lock stack any thread has been observed in.
#[derive(Debug, Default)]
pub struct LockOrderGraph {
    edges: HashMap<LockId, HashSet<LockId>>,
    stacks: HashSet<LockStack>,
    // every lock on some recorded stack, including all locks with an edge
    stacked: HashSet<LockId>,
}

impl LockOrderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stack and its nesting edges. Returns false if the exact
    /// stack had been seen before.
    pub fn add(&mut self, stack: LockStack) -> bool {
        if stack.is_head() || self.stacks.contains(&stack) {
            return false;
        }
        for (outer, inner) in stack.nesting_pairs() {
            self.edges.entry(outer).or_default().insert(inner);
        }
        self.stacked.extend(stack.frames());
        self.stacks.insert(stack);
        true
    }

    /// Forgets a lock whose object was collected: every recorded stack it
    /// appears in, and the edges only those stacks supported.
    pub fn purge(&mut self, lock: LockId) -> bool {
        if !self.stacked.contains(&lock) {
            return false;
        }
        self.stacks.retain(|stack| !stack.contains(lock));
        self.edges.clear();
        self.stacked.clear();
        for stack in &self.stacks {
            for (outer, inner) in stack.nesting_pairs() {
                self.edges.entry(outer).or_default().insert(inner);
            }
            self.stacked.extend(stack.frames());
        }
        true
    }

    pub fn has_edge(&self, from: LockId, to: LockId) -> bool {
        self.edges.get(&from).is_some_and(|s| s.contains(&to))
    }

    pub fn edges(&self) -> BTreeSet<(LockId, LockId)> {
        self.edges
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (*from, *to)))
            .collect()
    }

    pub fn stacks(&self) -> impl Iterator<Item = &LockStack> {
        self.stacks.iter()
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }

    pub fn locks(&self) -> BTreeSet<LockId> {
        let mut ids = BTreeSet::new();
        for (from, tos) in &self.edges {
            ids.insert(*from);
            ids.extend(tos.iter().copied());
        }
        ids
    }

    fn successors(&self, id: LockId) -> Vec<LockId> {
        let mut next: Vec<LockId> = self.edges.get(&id).map(|s| s.iter().copied().collect()).unwrap_or_default();
        next.sort_unstable();
        next
    }

    /// Strongly connected components with more than one lock. Every lock in
    /// one of these sits on some ordering cycle.
    pub fn cyclic_components(&self) -> Vec<BTreeSet<LockId>> {
        let mut tarjan = Tarjan::default();
        for id in self.locks() {
            if !tarjan.index.contains_key(&id) {
                tarjan.visit(self, id);
            }
        }
        tarjan.components.retain(|c| c.len() > 1);
        tarjan.components.sort();
        tarjan.components
    }

    /// Every lock that lies on an ordering cycle.
    pub fn cycle_locks(&self) -> BTreeSet<LockId> {
        self.cyclic_components().into_iter().flatten().collect()
    }

    /// Minimal cycles: for each edge inside a cyclic component, the shortest
    /// way back closes a cycle. Cycles over the same lock set are reported
    /// once, rotated to start at their smallest lock.
    pub fn cycles(&self) -> Vec<Vec<LockId>> {
        let mut found: BTreeMap<BTreeSet<LockId>, Vec<LockId>> = BTreeMap::new();
        for component in self.cyclic_components() {
            for &from in &component {
                for to in self.successors(from) {
                    if !component.contains(&to) {
                        continue;
                    }
                    if let Some(path) = self.shortest_path(to, from, &component) {
                        let key: BTreeSet<LockId> = path.iter().copied().collect();
                        if key.len() == path.len() {
                            found.entry(key).or_insert_with(|| rotate_to_min(path));
                        }
                    }
                }
            }
        }
        found.into_values().collect()
    }

    fn shortest_path(&self, from: LockId, to: LockId, within: &BTreeSet<LockId>) -> Option<Vec<LockId>> {
        let mut prev: HashMap<LockId, LockId> = HashMap::new();
        let mut seen: HashSet<LockId> = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(from);
        queue.push_back(from);
        while let Some(x) = queue.pop_front() {
            if x == to {
                let mut path = vec![to];
                let mut cur = to;
                while cur != from {
                    cur = prev[&cur];
                    path.push(cur);
                }
                path.reverse();
                return Some(path);
            }
            for next in self.successors(x) {
                if within.contains(&next) && seen.insert(next) {
                    prev.insert(next, x);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

fn rotate_to_min(mut cycle: Vec<LockId>) -> Vec<LockId> {
    if let Some(pos) = cycle.iter().enumerate().min_by_key(|(_, id)| **id).map(|(i, _)| i) {
        cycle.rotate_left(pos);
    }
    cycle
}

#[derive(Default)]
struct Tarjan {
    next_index: usize,
    index: HashMap<LockId, usize>,
    lowlink: HashMap<LockId, usize>,
    on_stack: HashSet<LockId>,
    stack: Vec<LockId>,
    components: Vec<BTreeSet<LockId>>,
}

impl Tarjan {
    fn enter(&mut self, v: LockId) {
        self.index.insert(v, self.next_index);
        self.lowlink.insert(v, self.next_index);
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);
    }

    /// Depth-first from `root` with an explicit work stack; lock-order chains
    /// can be as long as the number of locks.
    fn visit(&mut self, graph: &LockOrderGraph, root: LockId) {
        // (lock, its successors, next successor to look at)
        let mut work: Vec<(LockId, Vec<LockId>, usize)> = Vec::new();
        self.enter(root);
        work.push((root, graph.successors(root), 0));

        while let Some(frame) = work.last_mut() {
            let v = frame.0;
            if let Some(&w) = frame.1.get(frame.2) {
                frame.2 += 1;
                if !self.index.contains_key(&w) {
                    self.enter(w);
                    work.push((w, graph.successors(w), 0));
                } else if self.on_stack.contains(&w) {
                    let low = self.lowlink[&v].min(self.index[&w]);
                    self.lowlink.insert(v, low);
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, ..)) = work.last() {
                let low = self.lowlink[&parent].min(self.lowlink[&v]);
                self.lowlink.insert(parent, low);
            }
            if self.lowlink[&v] == self.index[&v] {
                let mut component = BTreeSet::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    component.insert(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }
}
