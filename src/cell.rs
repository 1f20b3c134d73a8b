//! In-memory cable tree of a single instantiated cell.
//!
//! Sections, synapses and connections live in arenas and are addressed by
//! typed handles. Handles are the identity of the underlying object: two
//! connections are the same connection iff their `ConnectionId`s are equal.
//! Connection ids are unique across all trees of a process, so a rebuilt tree
//! only holds an old connection if it adopted it explicitly.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    err::{bail, Result},
    Map,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SynapseId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    fn fresh() -> Self {
        ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetCon[{}]", self.0)
    }
}

/// Anything whose parameters are addressed by name, like mechanism instances
/// and point processes of a cable simulator.
pub trait NamedParameterCarrier {
    fn has(&self, name: &str) -> bool;
    fn get(&self, name: &str) -> Option<f64>;
    fn set(&mut self, name: &str, value: f64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub diam: f64,
}

impl Point3d {
    pub fn new(x: f64, y: f64, z: f64, diam: f64) -> Self {
        Self { x, y, z, diam }
    }

    pub fn distance(&self, other: &Point3d) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }

    pub fn xyz(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Density mechanism inserted into one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mechanism {
    pub name: String,
    /// ion mechanisms (`na_ion`, ...) are bookkeeping, not channels
    #[serde(default)]
    pub ion: bool,
    /// short parameter names, eg `gbar` for `gbar_NaTs`
    pub parameters: Map<String, f64>,
}

impl Mechanism {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ion: name.ends_with("_ion"),
            parameters: Map::new(),
        }
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }

    /// Names of the parameters this mechanism defines, in declaration order.
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }

    /// NEURON's global name for a parameter, `gbar` -> `gbar_NaTs`.
    pub fn full_name(&self, param: &str) -> String {
        format!("{param}_{}", self.name)
    }
}

impl NamedParameterCarrier for Mechanism {
    fn has(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    fn set(&mut self, name: &str, value: f64) -> Result<()> {
        match self.parameters.get_mut(name) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => bail!("Mechanism {} has no parameter {name}", self.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    /// eg `Cell[0].dend[3]`
    pub name: String,
    /// sampled 3d geometry, may be empty until a shape is defined
    pub points: Vec<Point3d>,
    pub parent: Option<SectionId>,
    /// in creation order
    children: Vec<SectionId>,
    /// length [um], used when no 3d points are present
    pub length: f64,
    /// diameter [um], used when no 3d points are present
    pub diam: f64,
    /// specific membrane capacitance [uF/cm2]
    pub cm: f64,
    /// axial resistivity [ohm cm]
    pub ra: f64,
    /// mechanisms per segment; the length is nseg
    pub segments: Vec<Vec<Mechanism>>,
}

impl Section {
    pub fn nseg(&self) -> usize {
        self.segments.len()
    }

    /// Path length along the 3d points, or the nominal length without them.
    pub fn length(&self) -> f64 {
        if self.points.len() < 2 {
            return self.length;
        }
        self.points.windows(2).map(|w| w[0].distance(&w[1])).sum()
    }

    /// Index of the segment containing position `x` in [0, 1].
    pub fn segment_index(&self, x: f64) -> usize {
        let nseg = self.nseg().max(1);
        ((x.clamp(0.0, 1.0) * nseg as f64) as usize).min(nseg - 1)
    }

    /// Centres of all segments.
    pub fn segment_centres(&self) -> Vec<f64> {
        let nseg = self.nseg();
        (0..nseg)
            .map(|i| (i as f64 + 0.5) / nseg as f64)
            .collect()
    }

    /// Replace the discretisation, copying the mechanisms of the first segment.
    pub fn set_nseg(&mut self, nseg: usize) {
        let template = self.segments.first().cloned().unwrap_or_default();
        self.segments = vec![template; nseg.max(1)];
    }

    pub fn insert(&mut self, mechanism: Mechanism) {
        for segment in self.segments.iter_mut() {
            match segment.iter_mut().find(|m| m.name == mechanism.name) {
                Some(existing) => existing.parameters.extend(mechanism.parameters.clone()),
                None => segment.push(mechanism.clone()),
            }
        }
    }
}

/// Point process sitting at a position of a section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synapse {
    pub class: String,
    pub section: SectionId,
    pub x: f64,
    pub parameters: Map<String, f64>,
}

impl NamedParameterCarrier for Synapse {
    fn has(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    fn set(&mut self, name: &str, value: f64) -> Result<()> {
        match self.parameters.get_mut(name) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => bail!("Synapse {} has no parameter {name}", self.class),
        }
    }
}

/// Network connection delivering events into a synapse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub synapse: SynapseId,
    pub delay: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellTree {
    sections: Vec<Section>,
    synapses: Vec<Synapse>,
    connections: Vec<Connection>,
}

impl CellTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_section(&mut self, name: &str) -> SectionId {
        let id = SectionId(self.sections.len());
        self.sections.push(Section {
            name: name.to_string(),
            points: Vec::new(),
            parent: None,
            children: Vec::new(),
            length: 100.0,
            diam: 500.0,
            cm: 1.0,
            ra: 35.4,
            segments: vec![Vec::new()],
        });
        id
    }

    /// Attach `child` to the distal end of `parent`.
    pub fn connect(&mut self, child: SectionId, parent: SectionId) -> Result<()> {
        if child == parent || self.is_ancestor(child, parent) {
            bail!("Connecting {child:?} to {parent:?} would create a cycle");
        }
        if let Some(old) = self.section(child)?.parent {
            self.section_mut(old)?.children.retain(|c| *c != child);
        }
        self.section_mut(child)?.parent = Some(parent);
        self.section_mut(parent)?.children.push(child);
        Ok(())
    }

    fn is_ancestor(&self, candidate: SectionId, of: SectionId) -> bool {
        let mut cursor = self.sections.get(of.0).and_then(|s| s.parent);
        while let Some(sec) = cursor {
            if sec == candidate {
                return true;
            }
            cursor = self.sections.get(sec.0).and_then(|s| s.parent);
        }
        false
    }

    pub fn section(&self, id: SectionId) -> Result<&Section> {
        match self.sections.get(id.0) {
            Some(sec) => Ok(sec),
            None => bail!("Unknown section {id:?}"),
        }
    }

    pub fn section_mut(&mut self, id: SectionId) -> Result<&mut Section> {
        match self.sections.get_mut(id.0) {
            Some(sec) => Ok(sec),
            None => bail!("Unknown section {id:?}"),
        }
    }

    pub fn name(&self, id: SectionId) -> &str {
        self.sections
            .get(id.0)
            .map(|s| s.name.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn section_ids(&self) -> impl Iterator<Item = SectionId> {
        (0..self.sections.len()).map(SectionId)
    }

    /// Children as the simulator reports them: most recently attached first.
    pub fn children(&self, id: SectionId) -> Vec<SectionId> {
        self.sections
            .get(id.0)
            .map(|s| s.children.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    /// All sections without a parent, ie one per instantiated cell.
    pub fn roots(&self) -> Vec<SectionId> {
        self.section_ids()
            .filter(|id| self.sections[id.0].parent.is_none())
            .collect()
    }

    /// Every section reachable from `root`, parents before children.
    pub fn wholetree(&self, root: SectionId) -> Vec<SectionId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(sec) = stack.pop() {
            out.push(sec);
            // children() is newest first, so the oldest ends up on top
            stack.extend(self.children(sec));
        }
        out
    }

    /// True when any section lacks the two 3d points needed to place it.
    pub fn is_shape_degenerate(&self) -> bool {
        self.sections.iter().any(|s| s.points.len() < 2)
    }

    /// Lay out sections without 3d information as straight lines, starting at
    /// the distal end of their parent and extending along +x.
    pub fn define_shape(&mut self) {
        for root in self.roots() {
            for sec in self.wholetree(root) {
                if self.sections[sec.0].points.len() >= 2 {
                    continue;
                }
                let start = self.sections[sec.0]
                    .parent
                    .and_then(|p| self.sections[p.0].points.last().copied())
                    .map(|p| [p.x, p.y, p.z])
                    .unwrap_or([0.0, 0.0, 0.0]);
                let section = &mut self.sections[sec.0];
                let (length, diam) = (section.length, section.diam);
                section.points = vec![
                    Point3d::new(start[0], start[1], start[2], diam),
                    Point3d::new(start[0] + length, start[1], start[2], diam),
                ];
            }
        }
    }

    pub fn add_synapse(&mut self, synapse: Synapse) -> Result<SynapseId> {
        self.section(synapse.section)?;
        self.synapses.push(synapse);
        Ok(SynapseId(self.synapses.len() - 1))
    }

    pub fn synapse(&self, id: SynapseId) -> Result<&Synapse> {
        match self.synapses.get(id.0) {
            Some(syn) => Ok(syn),
            None => bail!("Unknown synapse {id:?}"),
        }
    }

    pub fn synapse_mut(&mut self, id: SynapseId) -> Result<&mut Synapse> {
        match self.synapses.get_mut(id.0) {
            Some(syn) => Ok(syn),
            None => bail!("Unknown synapse {id:?}"),
        }
    }

    pub fn connect_synapse(&mut self, synapse: SynapseId, delay: f64, weight: f64) -> Result<ConnectionId> {
        self.synapse(synapse)?;
        let id = ConnectionId::fresh();
        self.connections.push(Connection {
            id,
            synapse,
            delay,
            weight,
        });
        Ok(id)
    }

    /// Re-create connection `id` of another tree on `synapse` of this one,
    /// keeping its identity.
    pub fn adopt_connection(&mut self, id: ConnectionId, synapse: SynapseId, delay: f64, weight: f64) -> Result<ConnectionId> {
        self.synapse(synapse)?;
        if self.connections.iter().any(|c| c.id == id) {
            bail!("Connection {id} already exists in this cell");
        }
        self.connections.push(Connection {
            id,
            synapse,
            delay,
            weight,
        });
        Ok(id)
    }

    pub fn connection(&self, id: ConnectionId) -> Result<&Connection> {
        match self.connections.iter().find(|c| c.id == id) {
            Some(con) => Ok(con),
            None => bail!("Unknown connection {id}"),
        }
    }

    /// Post-synaptic location of a connection.
    pub fn postseg(&self, id: ConnectionId) -> Result<(SectionId, f64)> {
        let syn = self.synapse(self.connection(id)?.synapse)?;
        Ok((syn.section, syn.x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_are_reported_newest_first() {
        let mut cell = CellTree::new();
        let soma = cell.create_section("soma");
        let a = cell.create_section("a");
        let b = cell.create_section("b");
        cell.connect(a, soma).unwrap();
        cell.connect(b, soma).unwrap();
        assert_eq!(cell.children(soma), vec![b, a]);
        assert_eq!(cell.roots(), vec![soma]);
        assert_eq!(cell.wholetree(soma), vec![soma, a, b]);
        assert!(cell.connect(soma, a).is_err());
    }

    #[test]
    fn define_shape_places_sections_end_to_end() {
        let mut cell = CellTree::new();
        let soma = cell.create_section("soma");
        let dend = cell.create_section("dend");
        cell.connect(dend, soma).unwrap();
        cell.section_mut(soma).unwrap().length = 10.0;
        cell.section_mut(dend).unwrap().length = 50.0;
        cell.section_mut(dend).unwrap().diam = 2.0;
        assert!(cell.is_shape_degenerate());
        cell.define_shape();
        assert!(!cell.is_shape_degenerate());
        let dend = cell.section(dend).unwrap();
        assert_eq!(dend.points[0].x, 10.0);
        assert!((dend.length() - 50.0).abs() < 1e-12);
        assert_eq!(dend.points[1].diam, 2.0);
    }

    #[test]
    fn segment_lookup() {
        let mut cell = CellTree::new();
        let sec = cell.create_section("s");
        cell.section_mut(sec).unwrap().set_nseg(5);
        let sec = cell.section(sec).unwrap();
        assert_eq!(sec.segment_index(0.0), 0);
        assert_eq!(sec.segment_index(0.5), 2);
        assert_eq!(sec.segment_index(1.0), 4);
        assert_eq!(sec.segment_centres()[0], 0.1);
    }

    #[test]
    fn connections_keep_identity_across_trees() {
        let mut old = CellTree::new();
        let sec = old.create_section("s");
        let syn = old
            .add_synapse(Synapse {
                class: "ExpSyn".into(),
                section: sec,
                x: 0.5,
                parameters: Default::default(),
            })
            .unwrap();
        let a = old.connect_synapse(syn, 1.0, 0.1).unwrap();
        let b = old.connect_synapse(syn, 1.0, 0.2).unwrap();
        assert!(b > a);

        let mut new = CellTree::new();
        let sec = new.create_section("s");
        let syn = new
            .add_synapse(Synapse {
                class: "ExpSyn".into(),
                section: sec,
                x: 0.25,
                parameters: Default::default(),
            })
            .unwrap();
        // a fresh tree never hands out an id of another tree
        let c = new.connect_synapse(syn, 1.0, 0.1).unwrap();
        assert!(c != a && c != b);
        assert_eq!(new.adopt_connection(b, syn, 1.0, 0.2).unwrap(), b);
        assert_eq!(new.postseg(b).unwrap(), (sec, 0.25));
        assert!(new.adopt_connection(b, syn, 1.0, 0.2).is_err());
    }

    #[test]
    fn parameters_are_addressed_by_name() {
        let mut mech = Mechanism::new("NaTs").with("gbar", 0.1);
        assert!(mech.has("gbar"));
        mech.set("gbar", 0.2).unwrap();
        assert_eq!(mech.get("gbar"), Some(0.2));
        assert!(mech.set("nope", 1.0).is_err());
        assert_eq!(mech.full_name("gbar"), "gbar_NaTs");
        assert!(Mechanism::new("na_ion").ion);
    }
}
