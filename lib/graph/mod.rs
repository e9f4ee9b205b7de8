//! Implements a directed graph with labeled multi-edges.
//!
//! Vertices and edges are owned by the graph and addressed by `usize`
//! handles, never by reference. This keeps deletion-heavy rewrites (the
//! optimization passes delete vertices while iterating over snapshots of
//! the vertex set) free of aliasing hazards.
//!
//! Unlike a plain digraph, a pair of vertices may be connected by more than
//! one edge, as long as the edges compare unequal. The data-flow graph
//! relies on this: each edge carries the name of the value it forwards, and
//! one producer can forward several values to the same consumer. Inserting
//! an edge equal to one already present is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::Error;

pub trait Vertex: Clone {
    /// The handle of this vertex, unique within its graph.
    fn index(&self) -> usize;
    /// A string to display in dot graphviz format.
    fn dot_label(&self) -> String;
}

pub trait Edge: Clone + PartialEq {
    /// The handle of the head (source) vertex.
    fn head(&self) -> usize;
    /// The handle of the tail (target) vertex.
    fn tail(&self) -> usize;
    /// A string to display in dot graphviz format.
    fn dot_label(&self) -> String;
}

/// A directed graph with labeled multi-edges.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Graph<V: Vertex, E: Edge> {
    vertices: BTreeMap<usize, V>,
    edges: BTreeMap<(usize, usize), Vec<E>>,
    successors: BTreeMap<usize, BTreeSet<usize>>,
    predecessors: BTreeMap<usize, BTreeSet<usize>>,
}

impl<V: Vertex, E: Edge> Default for Graph<V, E> {
    fn default() -> Graph<V, E> {
        Graph::new()
    }
}

impl<V, E> Graph<V, E>
where
    V: Vertex,
    E: Edge,
{
    pub fn new() -> Graph<V, E> {
        Graph {
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            successors: BTreeMap::new(),
            predecessors: BTreeMap::new(),
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.values().map(|edges| edges.len()).sum()
    }

    /// Returns true if the vertex with the given handle exists in this graph.
    pub fn has_vertex(&self, index: usize) -> bool {
        self.vertices.contains_key(&index)
    }

    /// Inserts a vertex into the graph.
    /// # Errors
    /// Error if a vertex with the same handle already exists.
    pub fn insert_vertex(&mut self, v: V) -> Result<(), Error> {
        if self.vertices.contains_key(&v.index()) {
            return Err("duplicate vertex index".into());
        }
        self.successors.insert(v.index(), BTreeSet::new());
        self.predecessors.insert(v.index(), BTreeSet::new());
        self.vertices.insert(v.index(), v);
        Ok(())
    }

    /// Inserts an edge into the graph. Inserting an edge equal to an edge
    /// already present is a no-op.
    /// # Errors
    /// Error if either endpoint does not exist.
    pub fn insert_edge(&mut self, edge: E) -> Result<(), Error> {
        if !self.vertices.contains_key(&edge.head()) {
            return Err(Error::GraphVertexNotFound(edge.head()));
        }
        if !self.vertices.contains_key(&edge.tail()) {
            return Err(Error::GraphVertexNotFound(edge.tail()));
        }

        let slot = self.edges.entry((edge.head(), edge.tail())).or_default();
        if slot.iter().any(|e| *e == edge) {
            return Ok(());
        }
        self.successors
            .get_mut(&edge.head())
            .unwrap()
            .insert(edge.tail());
        self.predecessors
            .get_mut(&edge.tail())
            .unwrap()
            .insert(edge.head());
        slot.push(edge);

        Ok(())
    }

    /// Removes a single edge by value.
    pub fn remove_edge(&mut self, edge: &E) -> Result<(), Error> {
        let key = (edge.head(), edge.tail());
        let slot = self
            .edges
            .get_mut(&key)
            .ok_or(Error::GraphEdgeNotFound(key.0, key.1))?;
        let position = slot
            .iter()
            .position(|e| e == edge)
            .ok_or(Error::GraphEdgeNotFound(key.0, key.1))?;
        slot.remove(position);

        if slot.is_empty() {
            self.edges.remove(&key);
            self.successors.get_mut(&key.0).unwrap().remove(&key.1);
            self.predecessors.get_mut(&key.1).unwrap().remove(&key.0);
        }

        Ok(())
    }

    /// Removes a vertex, and every edge incident to it.
    pub fn remove_vertex(&mut self, index: usize) -> Result<(), Error> {
        if !self.has_vertex(index) {
            return Err(Error::GraphVertexNotFound(index));
        }

        let mut keys: Vec<(usize, usize)> = Vec::new();
        for successor in &self.successors[&index] {
            keys.push((index, *successor));
        }
        for predecessor in &self.predecessors[&index] {
            keys.push((*predecessor, index));
        }

        for key in keys {
            self.edges.remove(&key);
            self.successors.get_mut(&key.0).unwrap().remove(&key.1);
            self.predecessors.get_mut(&key.1).unwrap().remove(&key.0);
        }

        self.vertices.remove(&index);
        self.successors.remove(&index);
        self.predecessors.remove(&index);

        Ok(())
    }

    /// Fetches a vertex from the graph by handle.
    pub fn vertex(&self, index: usize) -> Result<&V, Error> {
        self.vertices
            .get(&index)
            .ok_or(Error::GraphVertexNotFound(index))
    }

    /// Fetches a mutable vertex from the graph by handle.
    pub fn vertex_mut(&mut self, index: usize) -> Result<&mut V, Error> {
        self.vertices
            .get_mut(&index)
            .ok_or(Error::GraphVertexNotFound(index))
    }

    /// Returns all vertices in the graph, ordered by handle.
    pub fn vertices(&self) -> Vec<&V> {
        self.vertices.values().collect()
    }

    /// Returns the handles of all vertices in the graph, in order.
    pub fn vertex_indices(&self) -> Vec<usize> {
        self.vertices.keys().cloned().collect()
    }

    /// Get a reference to every edge in the graph.
    pub fn edges(&self) -> Vec<&E> {
        self.edges.values().flatten().collect()
    }

    /// Return all edges into a vertex.
    pub fn edges_in(&self, index: usize) -> Result<Vec<&E>, Error> {
        let predecessors = self
            .predecessors
            .get(&index)
            .ok_or(Error::GraphVertexNotFound(index))?;
        Ok(predecessors
            .iter()
            .flat_map(|pred| self.edges[&(*pred, index)].iter())
            .collect())
    }

    /// Return all edges out of a vertex.
    pub fn edges_out(&self, index: usize) -> Result<Vec<&E>, Error> {
        let successors = self
            .successors
            .get(&index)
            .ok_or(Error::GraphVertexNotFound(index))?;
        Ok(successors
            .iter()
            .flat_map(|succ| self.edges[&(index, *succ)].iter())
            .collect())
    }

    /// The handles of all immediate successors of a vertex.
    pub fn successor_indices(&self, index: usize) -> Result<Vec<usize>, Error> {
        self.successors
            .get(&index)
            .map(|successors| successors.iter().cloned().collect())
            .ok_or(Error::GraphVertexNotFound(index))
    }

    /// The handles of all immediate predecessors of a vertex.
    pub fn predecessor_indices(&self, index: usize) -> Result<Vec<usize>, Error> {
        self.predecessors
            .get(&index)
            .map(|predecessors| predecessors.iter().cloned().collect())
            .ok_or(Error::GraphVertexNotFound(index))
    }

    /// Returns a string in the graphviz format.
    pub fn dot_graph(&self) -> String {
        let vertices = self
            .vertices
            .values()
            .map(|v| {
                let label = v.dot_label().replace('\n', "\\l");
                format!(
                    "{} [shape=\"box\", label=\"{}\", style=\"filled\", fillcolor=\"#ffddcc\"];",
                    v.index(),
                    label
                )
            })
            .collect::<Vec<String>>();

        let edges = self
            .edges()
            .iter()
            .map(|e| {
                let label = e.dot_label().replace('\n', "\\l");
                format!("{} -> {} [label=\"{}\"];", e.head(), e.tail(), label)
            })
            .collect::<Vec<String>>();

        format!(
            "digraph G {{\ngraph [fontname = \"Courier New\"]\n{}\n{}\n}}",
            vertices.join("\n"),
            edges.join("\n")
        )
    }
}
