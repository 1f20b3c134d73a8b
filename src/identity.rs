//! Bookkeeping between a live cell and its persisted morphology.
//!
//! Graph ids follow the order in which sections are appended to the
//! morphology graph: depth first, roots in NEURON order. The soma is `-1`.
//! SONATA section ids count the soma as section 0, so `sonata = graph + 1`.

use std::path::Path;

use crate::{
    cell::{CellTree, SectionId},
    err::{Context, NodeError, NodeResult},
    morph::{MorphologyGraph, SectionType},
    Map,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SOMA_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionList {
    Somatic,
    Basal,
    Apical,
    Axonal,
}

impl SectionList {
    pub const ALL: [SectionList; 4] = [
        SectionList::Somatic,
        SectionList::Basal,
        SectionList::Apical,
        SectionList::Axonal,
    ];

    /// Name used by hoc templates.
    pub fn name(&self) -> &'static str {
        match self {
            SectionList::Somatic => "somatic",
            SectionList::Basal => "basal",
            SectionList::Apical => "apical",
            SectionList::Axonal => "axonal",
        }
    }

    /// Array name a cell template creates sections under.
    pub fn array(&self) -> &'static str {
        match self {
            SectionList::Somatic => "soma",
            SectionList::Basal => "dend",
            SectionList::Apical => "apic",
            SectionList::Axonal => "axon",
        }
    }

    pub fn from_array(array: &str) -> Option<Self> {
        match array {
            "soma" => Some(SectionList::Somatic),
            "dend" => Some(SectionList::Basal),
            "apic" => Some(SectionList::Apical),
            "axon" => Some(SectionList::Axonal),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.name() == name)
    }
}

impl std::fmt::Display for SectionList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Split `Template[3].dend[12]` into its list and index.
pub fn parse_section_name(name: &str) -> NodeResult<(SectionList, usize)> {
    let bad = || NodeError::SectionName(name.to_string());
    let (cell, local) = name.rsplit_once('.').ok_or_else(bad)?;
    if !cell.ends_with(']') || !cell.contains('[') {
        return Err(bad());
    }
    let (array, index) = local
        .strip_suffix(']')
        .and_then(|l| l.split_once('['))
        .ok_or_else(bad)?;
    let index = index.parse::<usize>().map_err(|_| bad())?;
    let list = SectionList::from_array(array).ok_or_else(bad)?;
    Ok((list, index))
}

/// Children in creation order. The simulator reports them newest first.
pub fn ordered_children(tree: &CellTree, section: SectionId) -> Vec<SectionId> {
    let mut children = tree.children(section);
    children.reverse();
    children
}

fn section_type(tree: &CellTree, section: SectionId) -> SectionType {
    SectionType::from_name(tree.name(section))
}

/// Which kind of tree is being mapped. A reduced tree must not branch
/// anywhere but in the axon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Original,
    Reduced,
}

/// One cell section inside a (possibly merged) graph section.
#[derive(Debug, Clone)]
struct Link {
    section: SectionId,
    start: f64,
    length: f64,
}

#[derive(Debug, Clone)]
pub struct IdentityMap {
    graph: MorphologyGraph,
    soma: SectionId,
    ids: Map<SectionId, i64>,
    /// cell sections making up each graph section, proximal first
    chains: Vec<Vec<Link>>,
    section_lists: Map<SectionList, Vec<SectionId>>,
}

impl IdentityMap {
    pub fn build(tree: &CellTree, soma: SectionId, topology: Topology) -> NodeResult<Self> {
        let roots = tree.roots();
        if roots.len() != 1 {
            return Err(NodeError::MultipleCells { roots: roots.len() });
        }
        let mut map = IdentityMap {
            graph: MorphologyGraph::new(),
            soma,
            ids: Map::new(),
            chains: Vec::new(),
            section_lists: SectionList::ALL.into_iter().map(|l| (l, Vec::new())).collect(),
        };

        // Leading soma typed children extend the soma itself.
        let mut soma_chain = vec![soma];
        let mut candidates = by_neuron_order(tree, ordered_children(tree, soma));
        while let Some(first) = candidates.first().copied() {
            if section_type(tree, first) != SectionType::Soma {
                break;
            }
            candidates.remove(0);
            soma_chain.push(first);
            candidates.extend(ordered_children(tree, first));
            candidates = by_neuron_order(tree, candidates);
        }
        for section in &soma_chain {
            map.store(tree, *section)?;
            map.ids.insert(*section, SOMA_ID);
            let sec = tree.section(*section)?;
            map.graph.soma.points.extend(sec.points.iter().map(|p| p.xyz()));
            map.graph.soma.diameters.extend(sec.points.iter().map(|p| p.diam));
        }

        for root in candidates {
            let (points, diameters) = geometry(tree, root)?;
            let gid = map
                .graph
                .append_root_section(points, diameters, section_type(tree, root));
            map.put(tree, root, gid)?;
            map.neurite(tree, root, gid, topology)?;
        }
        debug!(
            "Mapped {} cell sections onto {} graph sections",
            map.ids.len(),
            map.graph.len()
        );
        Ok(map)
    }

    fn neurite(
        &mut self,
        tree: &CellTree,
        section: SectionId,
        gid: usize,
        topology: Topology,
    ) -> NodeResult<()> {
        let children = ordered_children(tree, section);
        let kind = section_type(tree, section);
        if topology == Topology::Reduced && !children.is_empty() && kind != SectionType::Axon {
            return Err(NodeError::InvalidReduction {
                section: tree.name(section).to_string(),
                children: children.len(),
            });
        }
        if let [only] = children.as_slice() {
            if section_type(tree, *only) == kind {
                let (points, diameters) = geometry(tree, *only)?;
                self.graph.extend_section(gid, points, diameters)?;
                self.continue_section(tree, *only, gid)?;
                return self.neurite(tree, *only, gid, topology);
            }
        }
        for child in children {
            let (points, diameters) = geometry(tree, child)?;
            let cid = self.graph.append_section(gid, points, diameters)?;
            self.graph.set_kind(cid, section_type(tree, child))?;
            self.put(tree, child, cid)?;
            self.neurite(tree, child, cid, topology)?;
        }
        Ok(())
    }

    fn store(&mut self, tree: &CellTree, section: SectionId) -> NodeResult<()> {
        let name = tree.name(section);
        let (list, index) = parse_section_name(name)?;
        let sections = self.section_lists.entry(list).or_default();
        if sections.len() != index {
            return Err(NodeError::Bookkeeping {
                list: list.name().to_string(),
                expected: sections.len(),
                found: index,
                section: name.to_string(),
            });
        }
        sections.push(section);
        Ok(())
    }

    fn put(&mut self, tree: &CellTree, section: SectionId, gid: usize) -> NodeResult<()> {
        self.store(tree, section)?;
        self.ids.insert(section, gid as i64);
        if self.chains.len() <= gid {
            self.chains.resize(gid + 1, Vec::new());
        }
        self.chains[gid] = vec![Link {
            section,
            start: 0.0,
            length: tree.section(section)?.length(),
        }];
        Ok(())
    }

    fn continue_section(&mut self, tree: &CellTree, child: SectionId, gid: usize) -> NodeResult<()> {
        self.store(tree, child)?;
        self.ids.insert(child, gid as i64);
        let length = tree.section(child)?.length();
        let chain = &mut self.chains[gid];
        let start = chain.last().map(|l| l.start + l.length).unwrap_or(0.0);
        chain.push(Link {
            section: child,
            start,
            length,
        });
        Ok(())
    }

    /// Graph id of a cell section; `-1` for the soma.
    pub fn get_section_id(&self, section: SectionId) -> Option<i64> {
        self.ids.get(&section).copied()
    }

    /// Cell section a graph id was created for.
    pub fn get_section(&self, id: i64) -> Option<SectionId> {
        if id == SOMA_ID {
            return Some(self.soma);
        }
        let id = usize::try_from(id).ok()?;
        self.chains.get(id)?.first().map(|l| l.section)
    }

    pub fn soma(&self) -> SectionId {
        self.soma
    }

    pub fn graph(&self) -> &MorphologyGraph {
        &self.graph
    }

    pub fn section_lists(&self) -> &Map<SectionList, Vec<SectionId>> {
        &self.section_lists
    }

    /// Number of sections in SONATA terms, soma included.
    pub fn section_count(&self) -> usize {
        self.graph.sonata_section_count()
    }

    /// Position `x` on a cell section as (graph id, fraction along the graph
    /// section). Merged chains are measured along their whole length.
    pub fn locate(&self, section: SectionId, x: f64) -> Option<(i64, f64)> {
        let id = self.get_section_id(section)?;
        if id == SOMA_ID {
            return Some((id, x));
        }
        let chain = self.chains.get(id as usize)?;
        if chain.len() == 1 {
            return Some((id, x));
        }
        let link = chain.iter().find(|l| l.section == section)?;
        let total: f64 = chain.iter().map(|l| l.length).sum();
        if total <= 0.0 {
            return Some((id, x));
        }
        Some((id, ((link.start + x * link.length) / total).clamp(0.0, 1.0)))
    }

    /// Inverse of [`IdentityMap::locate`].
    pub fn resolve(&self, id: i64, fraction: f64) -> Option<(SectionId, f64)> {
        if id == SOMA_ID {
            return Some((self.soma, fraction));
        }
        let chain = self.chains.get(usize::try_from(id).ok()?)?;
        if let [only] = chain.as_slice() {
            return Some((only.section, fraction));
        }
        let total: f64 = chain.iter().map(|l| l.length).sum();
        let target = fraction.clamp(0.0, 1.0) * total;
        let last = chain.last()?;
        let link = chain
            .iter()
            .find(|l| target <= l.start + l.length)
            .unwrap_or(last);
        let x = if link.length > 0.0 {
            ((target - link.start) / link.length).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some((link.section, x))
    }

    /// Replace the soma with the one of a morphology file.
    pub fn copy_soma(&mut self, path: &Path) -> NodeResult<()> {
        let source = MorphologyGraph::read_swc(path)
            .with_context(|| format!("Copying soma from {path:?}"))?;
        self.graph.soma = source.soma;
        Ok(())
    }

    /// Write the morphology and check that reading it back reproduces the
    /// section numbering.
    pub fn save(&self, tree: &CellTree, path: &Path) -> NodeResult<()> {
        self.graph.write_swc(path)?;
        let reread = MorphologyGraph::read_swc(path)?;
        let shown = path.display().to_string();
        if reread.len() != self.graph.len() {
            return Err(NodeError::MorphologySelfCheck {
                path: shown,
                id: reread.len().min(self.graph.len()),
                expected: format!("{} sections", self.graph.len()),
                found: format!("{} sections", reread.len()),
            });
        }
        for (id, gs) in reread.iter_depth_first().into_iter().enumerate() {
            let found = reread.section(gs).map(|s| s.kind);
            let expected = self
                .get_section(id as i64)
                .map(|s| section_type(tree, s));
            if found.is_none() || found != expected {
                return Err(NodeError::MorphologySelfCheck {
                    path: shown,
                    id,
                    expected: expected.map(|k| k.to_string()).unwrap_or_default(),
                    found: found.map(|k| k.to_string()).unwrap_or_default(),
                });
            }
        }
        Ok(())
    }
}

fn by_neuron_order(tree: &CellTree, mut sections: Vec<SectionId>) -> Vec<SectionId> {
    sections.sort_by_key(|s| section_type(tree, *s).neuron_rank());
    sections
}

fn geometry(tree: &CellTree, section: SectionId) -> NodeResult<(Vec<[f64; 3]>, Vec<f64>)> {
    let sec = tree.section(section)?;
    Ok((
        sec.points.iter().map(|p| p.xyz()).collect(),
        sec.points.iter().map(|p| p.diam).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Point3d;

    fn section(tree: &mut CellTree, name: &str, from: [f64; 3], to: [f64; 3]) -> SectionId {
        let id = tree.create_section(&format!("Cell[0].{name}"));
        tree.section_mut(id).unwrap().points = vec![
            Point3d::new(from[0], from[1], from[2], 1.0),
            Point3d::new(to[0], to[1], to[2], 1.0),
        ];
        id
    }

    fn soma(tree: &mut CellTree) -> SectionId {
        section(tree, "soma[0]", [-5.0, 0.0, 0.0], [5.0, 0.0, 0.0])
    }

    #[test]
    fn children_are_visited_in_creation_order() {
        let mut tree = CellTree::new();
        let s = soma(&mut tree);
        let a = section(&mut tree, "dend[0]", [5.0, 0.0, 0.0], [10.0, 0.0, 0.0]);
        let b = section(&mut tree, "dend[1]", [5.0, 0.0, 0.0], [5.0, 10.0, 0.0]);
        let c = section(&mut tree, "dend[2]", [5.0, 0.0, 0.0], [5.0, -10.0, 0.0]);
        for child in [a, b, c] {
            tree.connect(child, s).unwrap();
        }
        assert_eq!(tree.children(s), vec![c, b, a]);
        assert_eq!(ordered_children(&tree, s), vec![a, b, c]);

        let map = IdentityMap::build(&tree, s, Topology::Original).unwrap();
        assert_eq!(map.get_section_id(a), Some(0));
        assert_eq!(map.get_section_id(c), Some(2));
        assert_eq!(map.section_lists()[&SectionList::Basal], vec![a, b, c]);
    }

    #[test]
    fn ids_round_trip() {
        let mut tree = CellTree::new();
        let s = soma(&mut tree);
        let axon = section(&mut tree, "axon[0]", [-5.0, 0.0, 0.0], [-30.0, 0.0, 0.0]);
        let apic = section(&mut tree, "apic[0]", [0.0, 5.0, 0.0], [0.0, 50.0, 0.0]);
        let dend = section(&mut tree, "dend[0]", [5.0, 0.0, 0.0], [30.0, 0.0, 0.0]);
        let d1 = section(&mut tree, "dend[1]", [30.0, 0.0, 0.0], [40.0, 5.0, 0.0]);
        let d2 = section(&mut tree, "dend[2]", [30.0, 0.0, 0.0], [40.0, -5.0, 0.0]);
        for (child, parent) in [(apic, s), (axon, s), (dend, s), (d1, dend), (d2, dend)] {
            tree.connect(child, parent).unwrap();
        }
        let map = IdentityMap::build(&tree, s, Topology::Original).unwrap();
        assert_eq!(map.get_section_id(s), Some(SOMA_ID));
        assert_eq!(map.get_section(SOMA_ID), Some(s));
        // axon before basal before apical
        assert_eq!(map.get_section(0), Some(axon));
        assert_eq!(map.get_section(1), Some(dend));
        assert_eq!(map.get_section(4), Some(apic));
        for sec in [axon, apic, dend, d1, d2] {
            let id = map.get_section_id(sec).unwrap();
            assert_eq!(map.get_section(id), Some(sec));
        }
        assert_eq!(map.section_count(), 6);
    }

    #[test]
    fn single_child_continues_parent_id() {
        let mut tree = CellTree::new();
        let s = soma(&mut tree);
        let d1 = section(&mut tree, "dend[0]", [5.0, 0.0, 0.0], [15.0, 0.0, 0.0]);
        let d2 = section(&mut tree, "dend[1]", [15.0, 0.0, 0.0], [45.0, 0.0, 0.0]);
        tree.connect(d1, s).unwrap();
        tree.connect(d2, d1).unwrap();
        let map = IdentityMap::build(&tree, s, Topology::Original).unwrap();
        assert_eq!(map.get_section_id(d1), Some(0));
        assert_eq!(map.get_section_id(d2), Some(0));
        assert_eq!(map.graph().len(), 1);
        assert_eq!(map.graph().section(0).unwrap().points.len(), 3);
        assert_eq!(map.section_lists()[&SectionList::Basal], vec![d1, d2]);

        // 10 + 30 um: the middle of d2 sits at 25 / 40
        let (id, fraction) = map.locate(d2, 0.5).unwrap();
        assert_eq!(id, 0);
        assert!((fraction - 0.625).abs() < 1e-12);
        let (sec, x) = map.resolve(0, 0.625).unwrap();
        assert_eq!(sec, d2);
        assert!((x - 0.5).abs() < 1e-12);
        assert_eq!(map.resolve(0, 0.0), Some((d1, 0.0)));
    }

    #[test]
    fn soma_sections_are_concatenated() {
        let mut tree = CellTree::new();
        let s0 = soma(&mut tree);
        let s1 = section(&mut tree, "soma[1]", [5.0, 0.0, 0.0], [10.0, 0.0, 0.0]);
        let d0 = section(&mut tree, "dend[0]", [-5.0, 0.0, 0.0], [-5.0, 20.0, 0.0]);
        let d1 = section(&mut tree, "dend[1]", [10.0, 0.0, 0.0], [30.0, 0.0, 0.0]);
        tree.connect(s1, s0).unwrap();
        tree.connect(d0, s0).unwrap();
        tree.connect(d1, s1).unwrap();
        let map = IdentityMap::build(&tree, s0, Topology::Original).unwrap();
        assert_eq!(map.get_section_id(s0), Some(SOMA_ID));
        assert_eq!(map.get_section_id(s1), Some(SOMA_ID));
        assert_eq!(map.graph().soma.points.len(), 4);
        assert_eq!(map.graph().soma.points[2], [5.0, 0.0, 0.0]);
        assert_eq!(map.section_lists()[&SectionList::Somatic], vec![s0, s1]);
        // neurites of the first soma section come first
        assert_eq!(map.get_section_id(d0), Some(0));
        assert_eq!(map.get_section_id(d1), Some(1));
        assert_eq!(map.get_section(1), Some(d1));
        assert_eq!(map.section_count(), 3);
    }

    #[test]
    fn list_order_is_enforced() {
        let mut tree = CellTree::new();
        let s = soma(&mut tree);
        let d = section(&mut tree, "dend[1]", [5.0, 0.0, 0.0], [15.0, 0.0, 0.0]);
        tree.connect(d, s).unwrap();
        let err = IdentityMap::build(&tree, s, Topology::Original).unwrap_err();
        assert!(matches!(err, NodeError::Bookkeeping { expected: 0, found: 1, .. }));
    }

    #[test]
    fn reduced_dendrites_must_not_branch() {
        let mut tree = CellTree::new();
        let s = soma(&mut tree);
        let d0 = section(&mut tree, "dend[0]", [5.0, 0.0, 0.0], [15.0, 0.0, 0.0]);
        let d1 = section(&mut tree, "dend[1]", [15.0, 0.0, 0.0], [25.0, 5.0, 0.0]);
        let d2 = section(&mut tree, "dend[2]", [15.0, 0.0, 0.0], [25.0, -5.0, 0.0]);
        tree.connect(d0, s).unwrap();
        tree.connect(d1, d0).unwrap();
        tree.connect(d2, d0).unwrap();
        let err = IdentityMap::build(&tree, s, Topology::Reduced).unwrap_err();
        assert!(matches!(err, NodeError::InvalidReduction { children: 2, .. }));
        assert!(IdentityMap::build(&tree, s, Topology::Original).is_ok());
    }

    #[test]
    fn reduced_axon_may_branch() {
        let mut tree = CellTree::new();
        let s = soma(&mut tree);
        let a0 = section(&mut tree, "axon[0]", [-5.0, 0.0, 0.0], [-15.0, 0.0, 0.0]);
        let a1 = section(&mut tree, "axon[1]", [-15.0, 0.0, 0.0], [-25.0, 5.0, 0.0]);
        let a2 = section(&mut tree, "axon[2]", [-15.0, 0.0, 0.0], [-25.0, -5.0, 0.0]);
        let d0 = section(&mut tree, "dend[0]", [5.0, 0.0, 0.0], [15.0, 0.0, 0.0]);
        tree.connect(a0, s).unwrap();
        tree.connect(a1, a0).unwrap();
        tree.connect(a2, a0).unwrap();
        tree.connect(d0, s).unwrap();
        let map = IdentityMap::build(&tree, s, Topology::Reduced).unwrap();
        assert_eq!(map.section_count(), 5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reduced.swc");
        map.save(&tree, &path).unwrap();
    }

    #[test]
    fn a_second_cell_is_rejected() {
        let mut tree = CellTree::new();
        let s = soma(&mut tree);
        tree.create_section("Cell[1].soma[0]");
        let err = IdentityMap::build(&tree, s, Topology::Original).unwrap_err();
        assert!(matches!(err, NodeError::MultipleCells { roots: 2 }));
    }

    #[test]
    fn section_names() {
        assert_eq!(
            parse_section_name("Scnn1a[0].apic[12]").unwrap(),
            (SectionList::Apical, 12)
        );
        assert!(parse_section_name("soma").is_err());
        assert!(parse_section_name("Cell[0].myelin[0]").is_err());
    }
}
