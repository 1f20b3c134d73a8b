//! Reduction of a single node.
//!
//! Everything is staged into `<out>.partial` and moved to `<out>` only once
//! the whole recipe went through, so a directory named `<out>` is always a
//! complete result.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    biophys::BiophysSource,
    circuit::{CircuitStore, Node},
    edges::IncomingEdges,
    err::{anyhow, Context, NodeError, NodeResult},
    extract::Biophysics,
    identity::{IdentityMap, Topology},
    reductor::{Reduction, ReductionOptions, SubtreeReductor},
    simulator::{has_extension, CableSimulator},
    sup::{split_reference, to_valid_nrn_name},
};

pub const NODE_DIR: &str = "node";
pub const EDGES_DIR: &str = "edges";
pub const MORPHOLOGY_DIR: &str = "morphology";
pub const BIOPHYS_DIR: &str = "biophys";
pub const REPORT_FILE: &str = "report.json";

/// What happened to one node; staged next to its results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub population: String,
    pub node_id: u64,
    pub sections_before: usize,
    pub sections_after: usize,
    pub edges_before: usize,
    pub edges_after: usize,
    pub morphology: String,
    pub biophysics: String,
    pub warnings: Vec<String>,
}

/// `out` with `.partial` appended.
pub fn partial_dir(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Where the morphology `name` of a node lives. Circuits with an `ascii`
/// subdirectory keep Neurolucida files there, all others SWC files.
pub fn morphology_path(dir: &Path, name: &str) -> PathBuf {
    let ascii = dir.join("ascii");
    if ascii.is_dir() {
        return ascii.join(format!("{}.asc", stem(name)));
    }
    if Path::new(name).extension().is_some() {
        dir.join(name)
    } else {
        dir.join(format!("{name}.swc"))
    }
}

fn stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

/// Everything needed to reduce nodes of one circuit.
pub struct NodeReducer<'a> {
    pub store: &'a dyn CircuitStore,
    pub simulator: &'a dyn CableSimulator,
    pub reductor: &'a dyn SubtreeReductor,
    pub options: &'a ReductionOptions,
    /// base name of the generated biophysics, instead of the template's
    pub biophys_name: Option<&'a str>,
}

impl NodeReducer<'_> {
    /// Reduce `node_id` of `population` and stage the results in `out`.
    pub fn reduce(&self, population: &str, node_id: u64, out: &Path) -> NodeResult<NodeReport> {
        let staging = partial_dir(out);
        if staging.exists() {
            fs::remove_dir_all(&staging).with_context(|| format!("Clearing {staging:?}"))?;
        }
        let report = match self.reduce_into(population, node_id, &staging) {
            Ok(report) => report,
            Err(err) => {
                if staging.exists() {
                    if let Err(e) = fs::remove_dir_all(&staging) {
                        warn!("Could not clear {staging:?}: {e}");
                    }
                }
                return Err(err);
            }
        };
        if out.exists() {
            fs::remove_dir_all(out).with_context(|| format!("Replacing {out:?}"))?;
        }
        fs::rename(&staging, out).with_context(|| format!("Moving {staging:?} to {out:?}"))?;
        info!(
            "{population}[{node_id}]: {} -> {} sections, {} -> {} edges",
            report.sections_before, report.sections_after, report.edges_before, report.edges_after
        );
        Ok(report)
    }

    fn reduce_into(&self, population: &str, node_id: u64, staging: &Path) -> NodeResult<NodeReport> {
        let mut node = self.store.node(population, node_id)?;
        let rows = self.store.afferent_edges(population, node_id)?;
        let mut report = NodeReport {
            population: population.to_string(),
            node_id,
            edges_before: rows.len(),
            ..Default::default()
        };

        let template = node
            .model_template()
            .ok_or_else(|| anyhow!("{population}[{node_id}] has no model_template"))?
            .to_string();
        let source = BiophysSource::for_node(
            &template,
            node.dynamics_params(),
            &self.store.biophysics_dir()?,
        )?;
        let canonical = source.load()?;
        let morphology = match node.morphology().or(canonical.morphology.as_deref()) {
            Some(m) => m.to_string(),
            None => return Err(anyhow!("{population}[{node_id}] has no morphology").into()),
        };
        let morph_path = morphology_path(&self.store.morphologies_dir()?, &morphology);
        if !self.simulator.reads_morphology(&morph_path) {
            return Err(NodeError::UnsupportedMorphology {
                path: morph_path.display().to_string(),
            });
        }
        let (_, template_name) = split_reference(&template);
        let cell_template = to_valid_nrn_name(stem(template_name));

        let (mut cell, soma) =
            self.simulator
                .load_cell(&morph_path, &canonical, &cell_template, node_id)?;
        let original = IdentityMap::build(&cell, soma, Topology::Original)?;
        report.sections_before = original.section_count();

        let mut edges = IncomingEdges::new(rows);
        let (synapses, connections) = edges.instantiate(self.simulator, &mut cell, &original)?;
        debug!(
            "{population}[{node_id}]: {} sections, {} connections before reduction",
            cell.section_count(),
            connections.len()
        );
        let reduced = self.reductor.reduce(
            Reduction {
                cell,
                root: soma,
                synapses,
                connections,
            },
            self.options,
        )?;
        let Reduction {
            mut cell,
            root,
            connections,
            ..
        } = reduced;
        if cell.is_shape_degenerate() {
            debug!("Reductor dropped 3d points, regenerating shape");
            cell.define_shape();
        }
        let mut map = IdentityMap::build(&cell, root, Topology::Reduced)?;
        if has_extension(&morph_path, "swc") {
            map.copy_soma(&morph_path)?;
        } else {
            debug!("Keeping the instantiated soma of {morph_path:?}");
        }
        edges.reduce(&cell, &map, &connections)?;
        report.sections_after = map.section_count();
        report.edges_after = edges.len();

        let biophysics = Biophysics::extract(&cell, map.section_lists())?;
        report.warnings.extend(biophysics.warnings.iter().cloned());

        let new_morphology = format!("{}_{node_id}", stem(&morphology));
        let new_morph_file = format!("{new_morphology}.swc");
        let base = self.biophys_name.unwrap_or(stem(template_name));
        let new_template = to_valid_nrn_name(&format!("{base}_{node_id}"));
        let new_biophys_file = format!("{new_template}.hoc");
        rename_node(
            &mut node,
            if Path::new(&morphology).extension().is_some() {
                &new_morph_file
            } else {
                &new_morphology
            },
            &new_template,
        );

        for dir in [NODE_DIR, EDGES_DIR, MORPHOLOGY_DIR, BIOPHYS_DIR] {
            fs::create_dir_all(staging.join(dir))
                .with_context(|| format!("Creating {:?}", staging.join(dir)))?;
        }
        map.save(&cell, &staging.join(MORPHOLOGY_DIR).join(&new_morph_file))?;
        if !biophysics.save(&staging.join(BIOPHYS_DIR).join(&new_biophys_file), &new_morph_file)? {
            warn!("{new_biophys_file} already staged, kept the existing one");
        }
        edges.write(&staging.join(EDGES_DIR))?;
        let node_path = staging.join(NODE_DIR).join(format!("{node_id}.json"));
        let wr = fs::File::create(&node_path).with_context(|| format!("Creating {node_path:?}"))?;
        serde_json::to_writer_pretty(wr, &node)?;

        report.morphology = new_morph_file;
        report.biophysics = new_biophys_file;
        let report_path = staging.join(REPORT_FILE);
        let wr = fs::File::create(&report_path).with_context(|| format!("Creating {report_path:?}"))?;
        serde_json::to_writer_pretty(wr, &report)?;
        Ok(report)
    }
}

/// Point the node at its own morphology and biophysics.
fn rename_node(node: &mut Node, morphology: &str, template: &str) {
    node.set("morphology", morphology);
    node.set("model_template", format!("hoc:{template}"));
    node.set("model_type", "biophysical");
    if node.dynamics_params().is_some() {
        // the fit is baked into the template now
        node.set("dynamics_params", "NULL");
    }
}

/// Read back what [`NodeReducer::reduce`] staged in `dir`.
pub fn read_staged_report(dir: &Path) -> NodeResult<NodeReport> {
    let path = dir.join(REPORT_FILE);
    let rd = fs::File::open(&path).with_context(|| format!("Opening {path:?}"))?;
    Ok(serde_json::from_reader(rd)?)
}

pub fn read_staged_node(dir: &Path, node_id: u64) -> NodeResult<Node> {
    let path = dir.join(NODE_DIR).join(format!("{node_id}.json"));
    let rd = fs::File::open(&path).with_context(|| format!("Opening {path:?}"))?;
    Ok(serde_json::from_reader(rd)?)
}
