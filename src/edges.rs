//! Incoming edges of the node under reduction.
//!
//! Rows are turned into synapses and connections on the cell, and once the
//! reductor is done, read back from wherever the surviving connections ended
//! up. Connections are created in row order; the reductor may only drop a
//! tail of them, so row `i` keeps belonging to connection `i`.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    cell::{CellTree, ConnectionId, NamedParameterCarrier, SynapseId},
    circuit::{Attribute, EdgeColumns, EdgeRow},
    err::{anyhow, bail, Context, NodeError, NodeResult},
    identity::{IdentityMap, SOMA_ID},
    morph::segment_offset,
    simulator::CableSimulator,
    sup::split_reference,
    Map,
};

pub const SECTION_ID: &str = "afferent_section_id";
pub const SECTION_POS: &str = "afferent_section_pos";
pub const SEGMENT_ID: &str = "afferent_segment_id";
pub const SEGMENT_OFFSET: &str = "afferent_segment_offset";

/// SONATA numbers the soma 0 and neurite sections from 1.
pub fn sonata_section_id(graph_id: i64) -> i64 {
    graph_id + 1
}

pub fn graph_section_id(sonata_id: i64) -> i64 {
    sonata_id - 1
}

#[derive(Debug)]
enum State {
    Unattached,
    Attached {
        synapses: Vec<SynapseId>,
        connections: Vec<ConnectionId>,
    },
    Reduced,
    Persisted,
}

#[derive(Debug)]
pub struct IncomingEdges {
    rows: Vec<EdgeRow>,
    state: State,
}

impl IncomingEdges {
    pub fn new(rows: Vec<EdgeRow>) -> Self {
        Self {
            rows,
            state: State::Unattached,
        }
    }

    /// Current rows; after [`IncomingEdges::reduce`] only the survivors.
    pub fn rows(&self) -> &[EdgeRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Create one synapse and one connection per row, in row order, on the
    /// original cell.
    pub fn instantiate(
        &mut self,
        simulator: &dyn CableSimulator,
        cell: &mut CellTree,
        map: &IdentityMap,
    ) -> NodeResult<(Vec<SynapseId>, Vec<ConnectionId>)> {
        if !matches!(self.state, State::Unattached) {
            return Err(anyhow!("Edges have already been instantiated").into());
        }
        let mut synapses = Vec::with_capacity(self.rows.len());
        let mut connections = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let (synapse, connection) = attach(row, simulator, cell, map)
                .with_context(|| format!("Edge {} of {}", row.edge_id, row.population))?;
            synapses.push(synapse);
            connections.push(connection);
        }
        debug!("Attached {} incoming edges", connections.len());
        self.state = State::Attached {
            synapses: synapses.clone(),
            connections: connections.clone(),
        };
        Ok((synapses, connections))
    }

    /// Take the reductor's connections and recompute every surviving row's
    /// attachment on the reduced cell. May be called once.
    pub fn reduce(
        &mut self,
        cell: &CellTree,
        map: &IdentityMap,
        connections: &[ConnectionId],
    ) -> NodeResult<()> {
        let before = match &self.state {
            State::Attached { connections, .. } => connections,
            _ => return Err(anyhow!("Edges must be attached, and only reduced once").into()),
        };
        if connections.len() > before.len() {
            return Err(NodeError::ReductionContractViolation {
                index: before.len(),
                expected: "no further connections".into(),
                found: connections[before.len()].to_string(),
            });
        }
        for (index, (expected, found)) in before.iter().zip(connections).enumerate() {
            if expected != found {
                return Err(NodeError::ReductionContractViolation {
                    index,
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
        }
        if connections.len() < self.rows.len() {
            warn!(
                "Reductor dropped {} of {} connections",
                self.rows.len() - connections.len(),
                self.rows.len()
            );
            self.rows.truncate(connections.len());
        }
        for (row, connection) in self.rows.iter_mut().zip(connections) {
            let (section, x) = cell.postseg(*connection)?;
            let (gid, fraction) = map.locate(section, x).ok_or_else(|| {
                anyhow!("{connection} sits on {}, which is not part of the reduced cell", cell.name(section))
            })?;
            let points = if gid == SOMA_ID {
                &map.graph().soma.points
            } else {
                let gs = usize::try_from(gid)
                    .ok()
                    .and_then(|g| map.graph().section(g))
                    .ok_or_else(|| anyhow!("No graph section {gid}"))?;
                &gs.points
            };
            let (segment, offset) = segment_offset(points, fraction);
            let columns = &mut row.columns;
            columns.insert(SECTION_ID.into(), Attribute::Int(sonata_section_id(gid)));
            columns.insert(SECTION_POS.into(), Attribute::Float(fraction));
            columns.insert(SEGMENT_ID.into(), Attribute::Int(segment as i64));
            columns.insert(SEGMENT_OFFSET.into(), Attribute::Float(offset));
        }
        self.state = State::Reduced;
        Ok(())
    }

    /// Stage the surviving rows below `dir`, one `<population>.json` per
    /// edge population. Efferent columns are left out.
    pub fn write(&mut self, dir: &Path) -> NodeResult<Vec<PathBuf>> {
        if !matches!(self.state, State::Reduced) {
            return Err(anyhow!("Only reduced edges can be written, and only once").into());
        }
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir:?}"))?;
        let mut by_population: Map<String, Vec<EdgeRow>> = Map::new();
        for row in &self.rows {
            let mut row = row.clone();
            row.columns.retain(|name, _| !name.starts_with("efferent_"));
            by_population.entry(row.population.clone()).or_default().push(row);
        }
        let mut written = Vec::new();
        for (population, rows) in by_population {
            let path = dir.join(format!("{population}.json"));
            let staged = EdgeColumns::from_rows(&rows);
            let wr = std::fs::File::create(&path).with_context(|| format!("Creating {path:?}"))?;
            serde_json::to_writer(wr, &staged)?;
            written.push(path);
        }
        self.state = State::Persisted;
        Ok(written)
    }
}

fn attach(
    row: &EdgeRow,
    simulator: &dyn CableSimulator,
    cell: &mut CellTree,
    map: &IdentityMap,
) -> crate::err::Result<(SynapseId, ConnectionId)> {
    let sonata_id = row
        .get_i64(SECTION_ID)
        .ok_or_else(|| anyhow!("No {SECTION_ID}"))?;
    let position = row
        .get_f64(SECTION_POS)
        .ok_or_else(|| anyhow!("No {SECTION_POS}"))?;
    let (section, x) = map
        .resolve(graph_section_id(sonata_id), position)
        .ok_or_else(|| anyhow!("Section {sonata_id} does not exist on this cell"))?;
    let template = row
        .get_str("model_template")
        .ok_or_else(|| anyhow!("No synapse model_template"))?;
    let (_, class) = split_reference(template);
    let synapse = simulator.new_synapse(cell, class, section, x)?;
    {
        let target = cell.synapse_mut(synapse)?;
        for (name, value) in row.dynamics() {
            let value = value
                .as_f64()
                .ok_or_else(|| anyhow!("Dynamics parameter {name} = {value} is not a number"))?;
            target.set(name, value)?;
        }
    }
    let delay = row.get_f64("delay").ok_or_else(|| anyhow!("No delay"))?;
    let Some(weight) = row.get_f64("syn_weight").or_else(|| row.get_f64("conductance")) else {
        bail!("No syn_weight");
    };
    let connection = cell.connect_synapse(synapse, delay, weight)?;
    Ok((synapse, connection))
}
