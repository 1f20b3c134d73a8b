use std::{
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    err::{anyhow, bail, Context, Result},
    sup::{resolve_manifest, Components, Manifest},
};
use serde::{Deserialize, Serialize};

/// Raw SONATA circuit configuration
///
/// Used to ingest circuit_config.json files. All paths are resolved against
/// the manifest and the directory of the configuration on load.

pub const MORPHOLOGIES_DIR: &str = "morphologies_dir";
pub const BIOPHYSICS_DIR: &str = "biophysical_neuron_models_dir";

/// The set of nodes are represented by a vector of Nodes.
/// Each entry specifies a file for node types and node
/// instances.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Nodes {
    #[serde(rename = "nodes_file")]
    pub nodes: String,
    #[serde(rename = "node_types_file", default)]
    pub types: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Edges {
    #[serde(rename = "edges_file")]
    pub edges: String,
    #[serde(rename = "edge_types_file", default)]
    pub types: Option<String>,
}

impl Edges {
    fn resolve_manifest(&mut self, manifest: &Manifest, base: &Path) -> Result<()> {
        resolve_manifest(&mut self.edges, manifest, base)?;
        if let Some(types) = self.types.as_mut() {
            resolve_manifest(types, manifest, base)?;
        }
        Ok(())
    }
}

impl Nodes {
    fn resolve_manifest(&mut self, manifest: &Manifest, base: &Path) -> Result<()> {
        resolve_manifest(&mut self.nodes, manifest, base)?;
        if let Some(types) = self.types.as_mut() {
            resolve_manifest(types, manifest, base)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Network {
    #[serde(default)]
    pub nodes: Vec<Nodes>,
    #[serde(default)]
    pub edges: Vec<Edges>,
}

impl Network {
    fn resolve_manifest(&mut self, manifest: &Manifest, base: &Path) -> Result<()> {
        self.nodes
            .iter_mut()
            .try_for_each(|n| n.resolve_manifest(manifest, base))?;
        self.edges
            .iter_mut()
            .try_for_each(|n| n.resolve_manifest(manifest, base))
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct CircuitConfigRaw {
    #[serde(default)]
    manifest: Manifest,
    #[serde(default)]
    components: Components,
    #[serde(alias = "network")]
    networks: Network,
}

/// Resolved circuit configuration.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// the configuration file itself
    pub path: PathBuf,
    pub components: Components,
    pub network: Network,
}

impl CircuitConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let path = path
            .canonicalize()
            .with_context(|| format!("Resolving circuit config path {path:?}"))?;
        let base_dir = path
            .parent()
            .ok_or_else(|| anyhow!("Couldn't find parent of {path:?}."))?;
        let rd = File::open(&path).with_context(|| format!("Opening {path:?}"))?;
        let mut raw: CircuitConfigRaw = serde_json::de::from_reader(rd)
            .with_context(|| format!("Parsing circuit config {path:?}"))?;
        raw.components
            .iter_mut()
            .try_for_each(|(_, it)| resolve_manifest(it, &raw.manifest, base_dir))?;
        raw.networks.resolve_manifest(&raw.manifest, base_dir)?;
        Ok(Self {
            path: path.clone(),
            components: raw.components,
            network: raw.networks,
        })
    }

    /// Directory holding the configuration; taken to be the circuit's root.
    pub fn base_dir(&self) -> Result<&Path> {
        self.path
            .parent()
            .ok_or_else(|| anyhow!("Couldn't find parent of {:?}.", self.path))
    }

    pub fn component(&self, key: &str) -> Result<PathBuf> {
        self.components
            .get(key)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("Circuit config {:?} has no component {key}", self.path))
    }

    pub fn morphologies_dir(&self) -> Result<PathBuf> {
        self.component(MORPHOLOGIES_DIR)
    }

    pub fn biophysics_dir(&self) -> Result<PathBuf> {
        self.component(BIOPHYSICS_DIR)
    }

    /// Structural checks run before a network reduction starts.
    pub fn validate(&self) -> Result<()> {
        for key in [MORPHOLOGIES_DIR, BIOPHYSICS_DIR] {
            let dir = self.component(key)?;
            if !dir.is_dir() {
                bail!("Component {key} = {dir:?} is not a directory");
            }
        }
        if self.network.nodes.is_empty() {
            bail!("Circuit {:?} defines no node files", self.path);
        }
        let files = self
            .network
            .nodes
            .iter()
            .flat_map(|n| std::iter::once(&n.nodes).chain(n.types.iter()))
            .chain(
                self.network
                    .edges
                    .iter()
                    .flat_map(|e| std::iter::once(&e.edges).chain(e.types.iter())),
            );
        for file in files {
            if !Path::new(file).is_file() {
                bail!("Circuit file {file} does not exist");
            }
        }
        Ok(())
    }

    /// Maps a path inside this circuit's directory to the same place below
    /// `out`.
    pub fn relocate(&self, path: &Path, out: &Path) -> Result<PathBuf> {
        let base = self.base_dir()?;
        let rel = path
            .strip_prefix(base)
            .with_context(|| format!("{path:?} lies outside the circuit directory {base:?}"))?;
        Ok(out.join(rel))
    }
}
