//! The subtree reductor seam.
//!
//! A reductor takes a whole cell with its synapses and connections and hands
//! back an equivalent, smaller cell. Connections keep their ids across the
//! call; that is the only identity the rest of the pipeline relies on.

use std::{
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    cell::{CellTree, ConnectionId, SectionId, SynapseId},
    err::{anyhow, bail, Context, Result},
};

/// How synapses are moved onto the reduced cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MappingMode {
    /// keep the relative position along the section
    #[default]
    Section,
    /// keep the segment, ie `return_seg_to_seg`
    Segment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionOptions {
    /// frequency [Hz] at which the transfer impedance is preserved
    pub reduction_frequency: f64,
    /// fixed number of segments for the whole reduced cell
    pub total_segments_manual: Option<usize>,
    pub mapping: MappingMode,
}

impl Default for ReductionOptions {
    fn default() -> Self {
        Self {
            reduction_frequency: 0.0,
            total_segments_manual: None,
            mapping: MappingMode::Section,
        }
    }
}

/// A cell as seen across the reductor boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reduction {
    pub cell: CellTree,
    pub root: SectionId,
    pub synapses: Vec<SynapseId>,
    pub connections: Vec<ConnectionId>,
}

pub trait SubtreeReductor: Sync {
    fn reduce(&self, input: Reduction, options: &ReductionOptions) -> Result<Reduction>;
}

/// Hands back its input; useful for dry runs and for checking the
/// bookkeeping around a reduction.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityReductor;

impl SubtreeReductor for IdentityReductor {
    fn reduce(&self, input: Reduction, _options: &ReductionOptions) -> Result<Reduction> {
        Ok(input)
    }
}

#[derive(Serialize)]
struct Request<'a> {
    #[serde(flatten)]
    input: &'a Reduction,
    options: &'a ReductionOptions,
}

/// Runs a reduction program. The request `{cell, root, synapses,
/// connections, options}` goes to its stdin as JSON, the reduced
/// `{cell, root, synapses, connections}` is read from its stdout.
#[derive(Debug, Clone)]
pub struct ExternalReductor {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ExternalReductor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

impl SubtreeReductor for ExternalReductor {
    fn reduce(&self, input: Reduction, options: &ReductionOptions) -> Result<Reduction> {
        let request = serde_json::to_vec(&Request {
            input: &input,
            options,
        })?;
        debug!(
            "Running reductor {:?} on {} sections, {} connections",
            self.program,
            input.cell.section_count(),
            input.connections.len()
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Starting reductor {:?}", self.program))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Reductor stdin unavailable"))?;
        // feed stdin from a thread so a chatty child cannot block us
        let feeder = thread::spawn(move || stdin.write_all(&request));
        let output = child
            .wait_with_output()
            .with_context(|| format!("Waiting for reductor {:?}", self.program))?;
        feeder
            .join()
            .map_err(|_| anyhow!("Reductor input thread panicked"))?
            .with_context(|| format!("Feeding reductor {:?}", self.program))?;
        if !output.status.success() {
            bail!(
                "Reductor {:?} failed with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let reduced: Reduction = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Parsing output of reductor {:?}", self.program))?;
        info!(
            "Reduced {} sections to {}",
            input.cell.section_count(),
            reduced.cell.section_count()
        );
        Ok(reduced)
    }
}
