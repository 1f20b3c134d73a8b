//! A circuit held entirely in memory. Serialisable, so small circuits can be
//! kept as a single JSON document.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{Attribute, CircuitStore, CircuitWriter, EdgeRow, Node};
use crate::{
    err::{anyhow, Context, Result},
    Map,
};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EdgeTable {
    pub source: String,
    pub target: String,
    pub source_node_id: Vec<u64>,
    pub target_node_id: Vec<u64>,
    pub rows: Vec<Map<String, Attribute>>,
}

impl EdgeTable {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, source: u64, target: u64, row: Map<String, Attribute>) -> u64 {
        self.source_node_id.push(source);
        self.target_node_id.push(target);
        self.rows.push(row);
        (self.rows.len() - 1) as u64
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MemoryCircuit {
    pub morphologies_dir: PathBuf,
    pub biophysics_dir: PathBuf,
    /// population -> node id -> attributes
    pub nodes: Map<String, Map<u64, Map<String, Attribute>>>,
    pub edges: Map<String, EdgeTable>,
}

impl MemoryCircuit {
    pub fn new(morphologies_dir: &Path, biophysics_dir: &Path) -> Self {
        Self {
            morphologies_dir: morphologies_dir.to_path_buf(),
            biophysics_dir: biophysics_dir.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let rd = File::open(path).with_context(|| format!("Opening {path:?}"))?;
        serde_json::from_reader(rd).with_context(|| format!("Parsing circuit {path:?}"))
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let wr = File::create(path).with_context(|| format!("Creating {path:?}"))?;
        serde_json::to_writer_pretty(wr, self).with_context(|| format!("Writing circuit {path:?}"))
    }

    pub fn add_node(&mut self, population: &str, node_id: u64, attributes: Map<String, Attribute>) {
        self.nodes
            .entry(population.to_string())
            .or_default()
            .insert(node_id, attributes);
    }

    fn population(&self, population: &str) -> Result<&Map<u64, Map<String, Attribute>>> {
        self.nodes
            .get(population)
            .ok_or_else(|| anyhow!("No node population {population}"))
    }
}

impl CircuitStore for MemoryCircuit {
    fn node_populations(&self) -> Result<Vec<String>> {
        Ok(self.nodes.keys().cloned().collect())
    }

    fn node_ids(&self, population: &str) -> Result<Vec<u64>> {
        Ok(self.population(population)?.keys().copied().collect())
    }

    fn node(&self, population: &str, node_id: u64) -> Result<Node> {
        let attributes = self
            .population(population)?
            .get(&node_id)
            .ok_or_else(|| anyhow!("No node {node_id} in population {population}"))?;
        Ok(Node {
            population: population.to_string(),
            node_id,
            attributes: attributes.clone(),
        })
    }

    fn afferent_edges(&self, population: &str, node_id: u64) -> Result<Vec<EdgeRow>> {
        let mut result = Vec::new();
        for (name, table) in self.edges.iter().filter(|(_, t)| t.target == population) {
            for (ix, (target, row)) in table.target_node_id.iter().zip(&table.rows).enumerate() {
                if *target != node_id {
                    continue;
                }
                let mut columns = row.clone();
                columns.insert(
                    "source_node_id".to_string(),
                    Attribute::Int(table.source_node_id[ix] as i64),
                );
                result.push(EdgeRow {
                    population: name.clone(),
                    edge_id: ix as u64,
                    columns,
                });
            }
        }
        Ok(result)
    }

    fn morphologies_dir(&self) -> Result<PathBuf> {
        Ok(self.morphologies_dir.clone())
    }

    fn biophysics_dir(&self) -> Result<PathBuf> {
        Ok(self.biophysics_dir.clone())
    }
}

impl CircuitWriter for MemoryCircuit {
    fn write_node(&mut self, node: &Node) -> Result<()> {
        let row = self
            .nodes
            .get_mut(&node.population)
            .and_then(|p| p.get_mut(&node.node_id))
            .ok_or_else(|| anyhow!("No node {} in population {}", node.node_id, node.population))?;
        row.extend(node.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn write_edges(&mut self, population: &str, edges: &[EdgeRow]) -> Result<()> {
        let table = self
            .edges
            .get_mut(population)
            .ok_or_else(|| anyhow!("No edge population {population}"))?;
        for edge in edges {
            let row = table
                .rows
                .get_mut(edge.edge_id as usize)
                .ok_or_else(|| anyhow!("No edge {} in population {population}", edge.edge_id))?;
            for (name, value) in &edge.columns {
                if name != "source_node_id" && name != "target_node_id" {
                    row.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}
