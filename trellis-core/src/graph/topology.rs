//! Graph Topology
//!
//! Pure structural queries over the dependency graph: which variables are
//! reachable from the observed roots, which are caught up in a cycle, and in
//! what order a set of variables can be computed.
//!
//! None of these functions touch cells or run definitions, so they are safe
//! to apply to unreachable parts of the graph.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};

use super::node::{Node, VariableId};

/// Read-only adjacency view of a dependency graph.
pub trait Topology {
    /// Variables `id` reads from. Unknown ids have none.
    fn dependencies(&self, id: VariableId) -> &[VariableId];

    /// Variables that read from `id`. Unknown ids have none.
    fn dependents(&self, id: VariableId) -> &[VariableId];
}

impl Topology for IndexMap<VariableId, Node> {
    fn dependencies(&self, id: VariableId) -> &[VariableId] {
        self.get(&id).map(Node::dependencies).unwrap_or(&[])
    }

    fn dependents(&self, id: VariableId) -> &[VariableId] {
        self.get(&id).map(Node::dependents).unwrap_or(&[])
    }
}

/// Everything reachable from `roots` by following dependency edges downward.
///
/// The roots themselves are included.
pub fn reachable<T: Topology + ?Sized>(
    graph: &T,
    roots: impl IntoIterator<Item = VariableId>,
) -> HashSet<VariableId> {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<VariableId> = roots.into_iter().collect();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        for &dependency in graph.dependencies(id) {
            if !visited.contains(&dependency) {
                queue.push_back(dependency);
            }
        }
    }

    visited
}

/// Variables among `ids` that sit on a cycle, plus everything among `ids`
/// that depends on one of them (transitively).
///
/// Cycles are found with Tarjan's strongly-connected-components algorithm
/// restricted to `ids`. A component is cyclic if it has more than one member
/// or a member that depends on itself.
pub fn circular<T: Topology + ?Sized>(graph: &T, ids: &[VariableId]) -> HashSet<VariableId> {
    let scope: HashSet<VariableId> = ids.iter().copied().collect();
    let mut tarjan = Tarjan {
        graph,
        scope: &scope,
        index: 0,
        indices: HashMap::new(),
        lowlinks: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        cyclic: HashSet::new(),
    };
    for &id in ids {
        if !tarjan.indices.contains_key(&id) {
            tarjan.connect(id);
        }
    }

    // Anything downstream of a cycle can never settle either.
    let mut circular = tarjan.cyclic;
    let mut queue: VecDeque<VariableId> = circular.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        for &dependent in graph.dependents(id) {
            if scope.contains(&dependent) && circular.insert(dependent) {
                queue.push_back(dependent);
            }
        }
    }
    circular
}

struct Tarjan<'a, T: ?Sized> {
    graph: &'a T,
    scope: &'a HashSet<VariableId>,
    index: usize,
    indices: HashMap<VariableId, usize>,
    lowlinks: HashMap<VariableId, usize>,
    stack: Vec<VariableId>,
    on_stack: HashSet<VariableId>,
    cyclic: HashSet<VariableId>,
}

impl<T: Topology + ?Sized> Tarjan<'_, T> {
    fn connect(&mut self, id: VariableId) {
        self.indices.insert(id, self.index);
        self.lowlinks.insert(id, self.index);
        self.index += 1;
        self.stack.push(id);
        self.on_stack.insert(id);

        let graph = self.graph;
        let scope = self.scope;
        let mut self_loop = false;
        for &dependency in graph.dependencies(id) {
            if !scope.contains(&dependency) {
                continue;
            }
            if dependency == id {
                self_loop = true;
            }
            match self.indices.get(&dependency).copied() {
                None => {
                    self.connect(dependency);
                    let low = self.lowlinks[&id].min(self.lowlinks[&dependency]);
                    self.lowlinks.insert(id, low);
                }
                Some(index) if self.on_stack.contains(&dependency) => {
                    let low = self.lowlinks[&id].min(index);
                    self.lowlinks.insert(id, low);
                }
                Some(_) => {}
            }
        }

        if self.lowlinks[&id] == self.indices[&id] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(&member);
                component.push(member);
                if member == id {
                    break;
                }
            }
            if component.len() > 1 || self_loop {
                self.cyclic.extend(component);
            }
        }
    }
}

/// Order `ids` so that every variable comes after the members of `ids` it
/// depends on.
///
/// Uses Kahn's algorithm; ties keep the iteration order of `ids`. Variables
/// caught in a cycle within `ids` are left out.
pub fn topological_order<T: Topology + ?Sized>(
    graph: &T,
    ids: &IndexSet<VariableId>,
) -> Vec<VariableId> {
    let mut in_degree: HashMap<VariableId, usize> = HashMap::new();
    let mut result = Vec::with_capacity(ids.len());
    let mut queue = VecDeque::new();

    // Calculate in-degrees (only counting edges within the set)
    for &id in ids {
        let degree = graph
            .dependencies(id)
            .iter()
            .filter(|dependency| ids.contains(*dependency))
            .count();
        in_degree.insert(id, degree);
        if degree == 0 {
            queue.push_back(id);
        }
    }

    while let Some(id) = queue.pop_front() {
        result.push(id);

        for &dependent in graph.dependents(id) {
            if let Some(degree) = in_degree.get_mut(&dependent) {
                // A dependent may list the same input more than once.
                let edges = graph
                    .dependencies(dependent)
                    .iter()
                    .filter(|dependency| **dependency == id)
                    .count();
                *degree = degree.saturating_sub(edges);
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    result
}
