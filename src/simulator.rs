//! Cable substrate the pipeline instantiates cells in.

use std::path::Path;

use tracing::debug;

use crate::{
    biophys::CanonicalBiophysics,
    cell::{CellTree, Mechanism, Point3d, SectionId, Synapse, SynapseId},
    err::{anyhow, bail, Result},
    identity::{parse_section_name, SectionList},
    morph::{MorphologyGraph, SectionType},
    Map,
};

/// Target length of a segment when discretising, in um.
pub const SEGMENT_LENGTH: f64 = 40.0;

pub trait CableSimulator: Sync {
    /// Whether [`CableSimulator::load_cell`] can read `morphology`.
    fn reads_morphology(&self, morphology: &Path) -> bool {
        has_extension(morphology, "swc")
    }

    /// Instantiate one cell. Sections are named `{template}[{gid}].{array}[{index}]`.
    fn load_cell(
        &self,
        morphology: &Path,
        biophysics: &CanonicalBiophysics,
        template: &str,
        gid: u64,
    ) -> Result<(CellTree, SectionId)>;

    /// Place a point process of class `class` at `x` on `section`.
    fn new_synapse(
        &self,
        cell: &mut CellTree,
        class: &str,
        section: SectionId,
        x: f64,
    ) -> Result<SynapseId>;
}

pub(crate) fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Synapse classes with their parameters and defaults.
const SYNAPSES: &[(&str, &[(&str, f64)])] = &[
    ("ExpSyn", &[("tau", 0.1), ("e", 0.0)]),
    ("Exp2Syn", &[("tau1", 0.1), ("tau2", 10.0), ("e", 0.0)]),
    (
        "ProbAMPANMDA_EMS",
        &[
            ("tau_r_AMPA", 0.2),
            ("tau_d_AMPA", 1.7),
            ("tau_r_NMDA", 0.29),
            ("tau_d_NMDA", 43.0),
            ("Use", 1.0),
            ("Dep", 100.0),
            ("Fac", 10.0),
            ("e", 0.0),
            ("mg", 1.0),
            ("u0", 0.0),
            ("NMDA_ratio", 0.71),
            ("synapseID", 0.0),
            ("verboseLevel", 0.0),
        ],
    ),
    (
        "ProbGABAAB_EMS",
        &[
            ("tau_r_GABAA", 0.2),
            ("tau_d_GABAA", 8.0),
            ("tau_r_GABAB", 3.5),
            ("tau_d_GABAB", 260.9),
            ("Use", 1.0),
            ("Dep", 100.0),
            ("Fac", 10.0),
            ("e_GABAA", -80.0),
            ("e_GABAB", -97.0),
            ("u0", 0.0),
            ("GABAB_ratio", 0.0),
            ("synapseID", 0.0),
            ("verboseLevel", 0.0),
        ],
    ),
];

/// In memory substrate: SWC morphologies with section level biophysics.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinSimulator;

impl BuiltinSimulator {
    fn section_list(kind: SectionType) -> SectionList {
        match kind {
            SectionType::Soma => SectionList::Somatic,
            SectionType::Axon => SectionList::Axonal,
            SectionType::Apical => SectionList::Apical,
            SectionType::Basal | SectionType::Undefined => SectionList::Basal,
        }
    }

    /// Build the cell tree of a morphology graph, one section per graph
    /// section, created depth first so list indices follow the traversal.
    pub fn build(graph: &MorphologyGraph, template: &str, gid: u64) -> Result<(CellTree, SectionId)> {
        let mut cell = CellTree::new();
        let soma = cell.create_section(&format!("{template}[{gid}].soma[0]"));
        let points: Vec<Point3d> = graph
            .soma
            .points
            .iter()
            .zip(&graph.soma.diameters)
            .map(|(p, d)| Point3d::new(p[0], p[1], p[2], *d))
            .collect();
        // single point somata become a cylinder as long as wide
        cell.section_mut(soma)?.points = if points.len() == 1 {
            let p = points[0];
            vec![
                Point3d::new(p.x - p.diam / 2.0, p.y, p.z, p.diam),
                Point3d::new(p.x + p.diam / 2.0, p.y, p.z, p.diam),
            ]
        } else {
            points
        };

        let mut counters: Map<SectionList, usize> = Map::new();
        let mut created: Map<usize, SectionId> = Map::new();
        for id in graph.iter_depth_first() {
            let gs = graph
                .section(id)
                .ok_or_else(|| anyhow!("Morphology lost section {id}"))?;
            let list = Self::section_list(gs.kind);
            let index = counters.entry(list).or_default();
            let sec = cell.create_section(&format!("{template}[{gid}].{}[{index}]", list.array()));
            *index += 1;
            cell.section_mut(sec)?.points = gs
                .points
                .iter()
                .zip(&gs.diameters)
                .map(|(p, d)| Point3d::new(p[0], p[1], p[2], *d))
                .collect();
            let parent = match gs.parent {
                Some(p) => *created
                    .get(&p)
                    .ok_or_else(|| anyhow!("Parent {p} of section {id} not created"))?,
                None => soma,
            };
            cell.connect(sec, parent)?;
            created.insert(id, sec);
        }

        for sec in cell.section_ids().collect::<Vec<_>>() {
            let section = cell.section_mut(sec)?;
            let nseg = 1 + 2 * (section.length() / SEGMENT_LENGTH).floor() as usize;
            section.set_nseg(nseg);
        }
        Ok((cell, soma))
    }

    pub fn apply(cell: &mut CellTree, biophysics: &CanonicalBiophysics) -> Result<()> {
        for sec in cell.section_ids().collect::<Vec<_>>() {
            let (list, _) = parse_section_name(cell.name(sec))?;
            let section = cell.section_mut(sec)?;
            for mech in biophysics.mechanisms.get(&list).into_iter().flat_map(|m| m.values()) {
                section.insert(mech.clone());
            }
            for (name, value) in biophysics.parameters.get(&list).into_iter().flatten() {
                match name.as_str() {
                    "cm" => section.cm = *value,
                    "Ra" => section.ra = *value,
                    ion if ion.len() > 1 && ion.starts_with('e') => {
                        let mech = Mechanism::new(&format!("{}_ion", &ion[1..]))
                            .with(name, *value);
                        section.insert(mech);
                    }
                    _ => debug!("Ignoring section parameter {name}"),
                }
            }
        }
        Ok(())
    }
}

impl CableSimulator for BuiltinSimulator {
    fn load_cell(
        &self,
        morphology: &Path,
        biophysics: &CanonicalBiophysics,
        template: &str,
        gid: u64,
    ) -> Result<(CellTree, SectionId)> {
        let graph = MorphologyGraph::read_swc(morphology)?;
        let (mut cell, soma) = Self::build(&graph, template, gid)?;
        Self::apply(&mut cell, biophysics)?;
        debug!(
            "Instantiated {template}[{gid}] with {} sections from {morphology:?}",
            cell.section_count()
        );
        Ok((cell, soma))
    }

    fn new_synapse(
        &self,
        cell: &mut CellTree,
        class: &str,
        section: SectionId,
        x: f64,
    ) -> Result<SynapseId> {
        let Some((name, defaults)) = SYNAPSES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(class))
        else {
            bail!("Unknown synapse class {class}");
        };
        cell.add_synapse(Synapse {
            class: name.to_string(),
            section,
            x,
            parameters: defaults.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        })
    }
}
