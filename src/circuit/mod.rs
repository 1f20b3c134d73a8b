//! Access to SONATA circuits.
//!
//! Nodes and edges are handed around as rows of named attributes; type level
//! attributes are already merged in, group level ones take precedence.
//! Dynamics parameters carry the prefix [`DYNAMICS_PREFIX`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    err::{anyhow, Result},
    Map,
};

#[cfg(feature = "hdf5")]
pub mod h5;
pub mod memory;

pub use memory::{EdgeTable, MemoryCircuit};

/// Column prefix under which per-instance `dynamics_params` are exposed.
pub const DYNAMICS_PREFIX: &str = "@dynamics:";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum Attribute {
    String(String),
    Int(i64),
    Float(f64),
}

impl Attribute {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Attribute::Int(i) => Some(*i as f64),
            Attribute::Float(f) => Some(*f),
            Attribute::String(s) => s.parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Attribute::Int(i) => Some(*i),
            Attribute::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Attribute::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// `NULL` markers of type files and NaN both count as missing.
    pub fn is_null(&self) -> bool {
        match self {
            Attribute::String(s) => s == "NULL",
            Attribute::Float(f) => f.is_nan(),
            Attribute::Int(_) => false,
        }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attribute::String(s) => write!(f, "{s}"),
            Attribute::Int(i) => write!(f, "{i}"),
            Attribute::Float(x) => write!(f, "{x}"),
        }
    }
}

/// One node with all its attributes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Node {
    pub population: String,
    pub node_id: u64,
    pub attributes: Map<String, Attribute>,
}

impl Node {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Attribute::as_str)
    }

    /// Morphology reference; absent and `NULL` are the same.
    pub fn morphology(&self) -> Option<&str> {
        self.get_str("morphology").filter(|m| !m.is_empty() && *m != "NULL")
    }

    pub fn model_template(&self) -> Option<&str> {
        self.get_str("model_template")
    }

    pub fn model_type(&self) -> Option<&str> {
        self.get_str("model_type")
    }

    pub fn dynamics_params(&self) -> Option<&str> {
        self.get_str("dynamics_params").filter(|d| *d != "NULL")
    }

    /// Nodes carrying a morphology or declared biophysical get reduced.
    pub fn is_reducible(&self) -> bool {
        self.morphology().is_some() || self.model_type() == Some("biophysical")
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.attributes
            .insert(key.to_string(), Attribute::String(value.into()));
    }
}

/// An incoming edge. `edge_id` is the row of the edge within its
/// population.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EdgeRow {
    pub population: String,
    pub edge_id: u64,
    pub columns: Map<String, Attribute>,
}

impl EdgeRow {
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).filter(|a| !a.is_null()).and_then(Attribute::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).filter(|a| !a.is_null()).and_then(Attribute::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.columns.get(key).filter(|a| !a.is_null()).and_then(Attribute::as_str)
    }

    /// Dynamics parameters of this edge, prefix stripped.
    pub fn dynamics(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.columns
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(DYNAMICS_PREFIX).map(|k| (k, v)))
    }
}

/// Column oriented edges of one population as staged on disk.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct EdgeColumns {
    pub edge_ids: Vec<u64>,
    pub columns: Map<String, Vec<Option<Attribute>>>,
}

impl EdgeColumns {
    /// Gather rows into columns; a column without a single value is left out.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a EdgeRow>) -> Self {
        let rows = rows.into_iter().collect::<Vec<_>>();
        let mut names = rows
            .iter()
            .flat_map(|r| r.columns.keys())
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        let mut columns = Map::new();
        for name in names {
            let values = rows
                .iter()
                .map(|r| r.columns.get(name).filter(|a| !a.is_null()).cloned())
                .collect::<Vec<_>>();
            if values.iter().any(Option::is_some) {
                columns.insert(name.clone(), values);
            }
        }
        Self {
            edge_ids: rows.iter().map(|r| r.edge_id).collect(),
            columns,
        }
    }

    pub fn into_rows(self, population: &str) -> Result<Vec<EdgeRow>> {
        let size = self.edge_ids.len();
        if let Some((name, _)) = self.columns.iter().find(|(_, v)| v.len() != size) {
            return Err(anyhow!(
                "Staged edges of {population}: column {name} does not have {size} entries"
            ));
        }
        let mut rows = self
            .edge_ids
            .iter()
            .map(|edge_id| EdgeRow {
                population: population.to_string(),
                edge_id: *edge_id,
                columns: Map::new(),
            })
            .collect::<Vec<_>>();
        for (name, values) in self.columns {
            for (row, value) in rows.iter_mut().zip(values) {
                if let Some(value) = value {
                    row.columns.insert(name.clone(), value);
                }
            }
        }
        Ok(rows)
    }
}

/// Read access to a circuit.
pub trait CircuitStore: Sync {
    fn node_populations(&self) -> Result<Vec<String>>;
    fn node_ids(&self, population: &str) -> Result<Vec<u64>>;
    fn node(&self, population: &str, node_id: u64) -> Result<Node>;
    /// All edges targeting `node_id`, across every edge population.
    fn afferent_edges(&self, population: &str, node_id: u64) -> Result<Vec<EdgeRow>>;
    fn morphologies_dir(&self) -> Result<PathBuf>;
    fn biophysics_dir(&self) -> Result<PathBuf>;
}

/// Point updates to a circuit. Rows not named are left untouched.
pub trait CircuitWriter: CircuitStore {
    fn write_node(&mut self, node: &Node) -> Result<()>;
    fn write_edges(&mut self, population: &str, edges: &[EdgeRow]) -> Result<()>;
}
