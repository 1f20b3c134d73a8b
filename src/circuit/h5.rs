//! SONATA circuits stored as HDF5 populations plus space separated type
//! tables.
//!
//! Reading merges type and group attributes per row. Writing is a point
//! update: only the addressed element of each column is touched, columns a
//! row needs but its group lacks are created, filled from the type table
//! for nodes and with null markers for edges.

use std::{
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
};

use hdf5::types::{TypeDescriptor, VarLenAscii, VarLenUnicode};
use tracing::{debug, trace};

use super::{Attribute, CircuitStore, CircuitWriter, EdgeRow, Node, DYNAMICS_PREFIX};
use crate::{
    err::{anyhow, bail, Context, Result},
    raw::CircuitConfig,
    Map,
};

const LIBRARY: &str = "@library";
const DYNAMICS: &str = "dynamics_params";

type TypeTable = Map<i64, Map<String, Attribute>>;

fn leaf(name: &str) -> String {
    name.rsplit('/').next().unwrap_or(name).to_string()
}

fn get_dataset<T: hdf5::H5Type + Clone>(g: &hdf5::Group, nm: &str) -> Result<Vec<T>> {
    Ok(g.dataset(nm)
        .with_context(|| format!("Group {} has no dataset {nm}", g.name()))?
        .read_1d::<T>()?
        .to_vec())
}

fn read_types(path: Option<&str>, key: &str) -> Result<TypeTable> {
    let Some(path) = path else {
        return Ok(TypeTable::new());
    };
    let rd = File::open(path).with_context(|| format!("Opening {path}"))?;
    let rows = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .from_reader(rd)
        .deserialize()
        .map(|it| it.map_err(anyhow::Error::from))
        .collect::<Result<Vec<Map<String, Attribute>>>>()
        .with_context(|| format!("Parsing types {path}"))?;
    let mut result = TypeTable::new();
    for mut row in rows {
        let id = row
            .remove(key)
            .and_then(|id| id.as_i64())
            .ok_or_else(|| anyhow!("Type table {path} has a row without {key}"))?;
        row.retain(|_, v| !v.is_null());
        result.insert(id, row);
    }
    Ok(result)
}

/// Per row addressing of a population.
struct Layout {
    ids: Vec<u64>,
    type_ids: Vec<i64>,
    group_ids: Vec<u64>,
    group_indices: Vec<usize>,
}

impl Layout {
    fn new(population: &hdf5::Group, prefix: &str) -> Result<Self> {
        let name = population.name();
        let type_ids = get_dataset::<i64>(population, &format!("{prefix}_type_id"))?;
        let size = type_ids.len();
        let ids = get_dataset::<u64>(population, &format!("{prefix}_id"))
            .unwrap_or_else(|_| (0..size as u64).collect());
        let group_ids = get_dataset::<u64>(population, &format!("{prefix}_group_id"))?;
        let group_indices = get_dataset::<usize>(population, &format!("{prefix}_group_index"))?;
        if ids.len() != size || group_ids.len() != size || group_indices.len() != size {
            bail!("Population {name} has mismatched #type_ids ./. #ids ./. #group_ids ./. #group_indices");
        }
        Ok(Self {
            ids,
            type_ids,
            group_ids,
            group_indices,
        })
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        self.ids.iter().position(|i| *i == id)
    }

    /// Rows of one group, as (row, index within group).
    fn group_rows(&self, group: u64) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.group_ids
            .iter()
            .enumerate()
            .filter(move |(_, g)| **g == group)
            .map(|(ix, _)| (ix, self.group_indices[ix]))
    }
}

fn library(group: &hdf5::Group, name: &str) -> Result<Option<Vec<String>>> {
    if !group.link_exists(LIBRARY) {
        return Ok(None);
    }
    let lib = group.group(LIBRARY)?;
    if !lib.link_exists(name) {
        return Ok(None);
    }
    let values = get_dataset::<VarLenUnicode>(&lib, name)?;
    Ok(Some(values.iter().map(|v| v.as_str().to_string()).collect()))
}

fn read_scalar(ds: &hdf5::Dataset, ix: usize) -> Result<Attribute> {
    fn one<T: hdf5::H5Type + Clone>(ds: &hdf5::Dataset, ix: usize) -> Result<T> {
        ds.read_slice_1d::<T, _>(ix..ix + 1)?
            .iter()
            .next()
            .cloned()
            .ok_or_else(|| anyhow!("Dataset {} has no row {ix}", ds.name()))
    }
    let value = match ds.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) => Attribute::Int(one::<i64>(ds, ix)?),
        TypeDescriptor::Unsigned(_) => Attribute::Int(one::<u64>(ds, ix)? as i64),
        TypeDescriptor::Float(_) => Attribute::Float(one::<f64>(ds, ix)?),
        TypeDescriptor::VarLenUnicode | TypeDescriptor::FixedUnicode(_) => {
            Attribute::String(one::<VarLenUnicode>(ds, ix)?.as_str().to_string())
        }
        TypeDescriptor::VarLenAscii | TypeDescriptor::FixedAscii(_) => {
            Attribute::String(one::<VarLenAscii>(ds, ix)?.as_str().to_string())
        }
        other => bail!("Dataset {} has unsupported type {other:?}", ds.name()),
    };
    Ok(value)
}

fn write_scalar(ds: &hdf5::Dataset, ix: usize, value: &Attribute) -> Result<()> {
    let sel = ix..ix + 1;
    let name = ds.name();
    let int = || {
        value
            .as_i64()
            .ok_or_else(|| anyhow!("Cannot store {value} in integer dataset {name}"))
    };
    match ds.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) => ds.write_slice(std::slice::from_ref(&int()?), sel)?,
        TypeDescriptor::Unsigned(_) => {
            let v = u64::try_from(int()?)?;
            ds.write_slice(std::slice::from_ref(&v), sel)?
        }
        TypeDescriptor::Float(_) => {
            let v = value
                .as_f64()
                .ok_or_else(|| anyhow!("Cannot store {value} in float dataset {name}"))?;
            ds.write_slice(std::slice::from_ref(&v), sel)?
        }
        TypeDescriptor::VarLenUnicode => {
            let v = VarLenUnicode::from_str(&value.to_string()).map_err(|e| anyhow!("{e}"))?;
            ds.write_slice(std::slice::from_ref(&v), sel)?
        }
        TypeDescriptor::VarLenAscii => {
            let v = VarLenAscii::from_ascii(&value.to_string()).map_err(|e| anyhow!("{e}"))?;
            ds.write_slice(std::slice::from_ref(&v), sel)?
        }
        other => bail!("Cannot write to dataset {name} of type {other:?}"),
    }
    Ok(())
}

fn read_group_row(group: &hdf5::Group, ix: usize, attributes: &mut Map<String, Attribute>) -> Result<()> {
    for ds in group.datasets()? {
        let name = leaf(&ds.name());
        let mut value = read_scalar(&ds, ix)?;
        if let Some(lib) = library(group, &name)? {
            let code = value
                .as_i64()
                .and_then(|c| usize::try_from(c).ok())
                .ok_or_else(|| anyhow!("Enumerated column {name} holds {value}"))?;
            value = Attribute::String(
                lib.get(code)
                    .cloned()
                    .ok_or_else(|| anyhow!("Enumerated column {name}: no entry {code} in library"))?,
            );
        }
        attributes.insert(name, value);
    }
    if group.link_exists(DYNAMICS) {
        for ds in group.group(DYNAMICS)?.datasets()? {
            let name = format!("{DYNAMICS_PREFIX}{}", leaf(&ds.name()));
            attributes.insert(name, read_scalar(&ds, ix)?);
        }
    }
    Ok(())
}

/// Store `value` at `ix`, going through the library for enumerated columns.
fn write_group_value(group: &hdf5::Group, name: &str, ix: usize, value: &Attribute) -> Result<()> {
    let ds = group.dataset(name)?;
    let Some(mut lib) = library(group, name)? else {
        return write_scalar(&ds, ix, value);
    };
    let text = value.to_string();
    let code = match lib.iter().position(|l| *l == text) {
        Some(code) => code,
        None => {
            lib.push(text);
            let values = lib
                .iter()
                .map(|l| VarLenUnicode::from_str(l).map_err(|e| anyhow!("{e}")))
                .collect::<Result<Vec<_>>>()?;
            let libgroup = group.group(LIBRARY)?;
            libgroup.unlink(name)?;
            libgroup
                .new_dataset::<VarLenUnicode>()
                .shape(values.len())
                .create(name)?
                .write_raw(&values)?;
            lib.len() - 1
        }
    };
    write_scalar(&ds, ix, &Attribute::Int(code as i64))
}

/// Add a column to `group`, typed after `prototype`.
fn create_column(
    group: &hdf5::Group,
    name: &str,
    prototype: &Attribute,
    fill: Vec<Option<Attribute>>,
) -> Result<()> {
    debug!("Creating column {name} in {}", group.name());
    let size = fill.len();
    match prototype {
        Attribute::Int(_) => {
            let values = fill
                .iter()
                .map(|v| v.as_ref().and_then(Attribute::as_i64).unwrap_or(-1))
                .collect::<Vec<_>>();
            group.new_dataset::<i64>().shape(size).create(name)?.write_raw(&values)?;
        }
        Attribute::Float(_) => {
            let values = fill
                .iter()
                .map(|v| v.as_ref().and_then(Attribute::as_f64).unwrap_or(f64::NAN))
                .collect::<Vec<_>>();
            group.new_dataset::<f64>().shape(size).create(name)?.write_raw(&values)?;
        }
        Attribute::String(_) => {
            let values = fill
                .iter()
                .map(|v| {
                    let text = v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "NULL".into());
                    VarLenUnicode::from_str(&text).map_err(|e| anyhow!("{e}"))
                })
                .collect::<Result<Vec<_>>>()?;
            group
                .new_dataset::<VarLenUnicode>()
                .shape(size)
                .create(name)?
                .write_raw(&values)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
struct NodeFile {
    path: PathBuf,
    types: TypeTable,
    populations: Vec<String>,
}

#[derive(Debug)]
struct EdgePopulation {
    path: PathBuf,
    types: std::sync::Arc<TypeTable>,
    source: String,
    target: String,
}

/// A circuit described by a `circuit_config.json`.
#[derive(Debug)]
pub struct H5Circuit {
    config: CircuitConfig,
    nodes: Vec<NodeFile>,
    edges: Map<String, EdgePopulation>,
}

fn population_attr(population: &hdf5::Group, dataset: &str) -> Result<String> {
    Ok(population
        .dataset(dataset)?
        .attr("node_population")
        .with_context(|| format!("Population {}: {dataset} has no node_population", population.name()))?
        .read_scalar::<VarLenUnicode>()
        .with_context(|| format!("Population {}: node_population is not a string", population.name()))?
        .as_str()
        .to_string())
}

impl H5Circuit {
    pub fn open(config: &Path) -> Result<Self> {
        Self::from_config(CircuitConfig::from_file(config)?)
    }

    pub fn from_config(config: CircuitConfig) -> Result<Self> {
        let mut nodes = Vec::new();
        for entry in &config.network.nodes {
            let types = read_types(entry.types.as_deref(), "node_type_id")?;
            let path = PathBuf::from(&entry.nodes);
            let file = hdf5::File::open(&path).with_context(|| format!("Opening {path:?}"))?;
            let populations = file
                .group("nodes")?
                .groups()?
                .iter()
                .map(|g| leaf(&g.name()))
                .collect();
            nodes.push(NodeFile {
                path,
                types,
                populations,
            });
        }
        let mut edges = Map::new();
        for entry in &config.network.edges {
            let types = std::sync::Arc::new(read_types(entry.types.as_deref(), "edge_type_id")?);
            let path = PathBuf::from(&entry.edges);
            let file = hdf5::File::open(&path).with_context(|| format!("Opening {path:?}"))?;
            for population in file.group("edges")?.groups()? {
                edges.insert(
                    leaf(&population.name()),
                    EdgePopulation {
                        path: path.clone(),
                        types: types.clone(),
                        source: population_attr(&population, "source_node_id")?,
                        target: population_attr(&population, "target_node_id")?,
                    },
                );
            }
        }
        Ok(Self {
            config,
            nodes,
            edges,
        })
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn node_file(&self, population: &str) -> Result<&NodeFile> {
        self.nodes
            .iter()
            .find(|f| f.populations.iter().any(|p| p == population))
            .ok_or_else(|| anyhow!("No node population {population} in {:?}", self.config.path))
    }

    fn edge_population(&self, population: &str) -> Result<&EdgePopulation> {
        self.edges
            .get(population)
            .ok_or_else(|| anyhow!("No edge population {population} in {:?}", self.config.path))
    }

    fn read_row(
        population: &hdf5::Group,
        layout: &Layout,
        ix: usize,
        types: &TypeTable,
    ) -> Result<Map<String, Attribute>> {
        let mut attributes = types.get(&layout.type_ids[ix]).cloned().unwrap_or_default();
        let group = population.group(&layout.group_ids[ix].to_string())?;
        read_group_row(&group, layout.group_indices[ix], &mut attributes)?;
        Ok(attributes)
    }
}

impl CircuitStore for H5Circuit {
    fn node_populations(&self) -> Result<Vec<String>> {
        Ok(self.nodes.iter().flat_map(|f| f.populations.iter().cloned()).collect())
    }

    fn node_ids(&self, population: &str) -> Result<Vec<u64>> {
        let file = self.node_file(population)?;
        let pop = hdf5::File::open(&file.path)?.group(&format!("nodes/{population}"))?;
        let size = pop.dataset("node_type_id")?.size();
        Ok(get_dataset::<u64>(&pop, "node_id").unwrap_or_else(|_| (0..size as u64).collect()))
    }

    fn node(&self, population: &str, node_id: u64) -> Result<Node> {
        let file = self.node_file(population)?;
        let pop = hdf5::File::open(&file.path)?.group(&format!("nodes/{population}"))?;
        let layout = Layout::new(&pop, "node")?;
        let ix = layout
            .index_of(node_id)
            .ok_or_else(|| anyhow!("No node {node_id} in population {population}"))?;
        let mut attributes = Self::read_row(&pop, &layout, ix, &file.types)?;
        attributes.insert("node_type_id".into(), Attribute::Int(layout.type_ids[ix]));
        Ok(Node {
            population: population.to_string(),
            node_id,
            attributes,
        })
    }

    fn afferent_edges(&self, population: &str, node_id: u64) -> Result<Vec<EdgeRow>> {
        let mut result = Vec::new();
        for (name, edges) in self.edges.iter().filter(|(_, e)| e.target == population) {
            let pop = hdf5::File::open(&edges.path)?.group(&format!("edges/{name}"))?;
            let layout = Layout::new(&pop, "edge")?;
            let sources = get_dataset::<u64>(&pop, "source_node_id")?;
            let targets = get_dataset::<u64>(&pop, "target_node_id")?;
            for (ix, _) in targets.iter().enumerate().filter(|(_, t)| **t == node_id) {
                let mut columns = Self::read_row(&pop, &layout, ix, &edges.types)?;
                columns.insert("source_node_id".into(), Attribute::Int(sources[ix] as i64));
                result.push(EdgeRow {
                    population: name.clone(),
                    edge_id: layout.ids[ix],
                    columns,
                });
            }
            trace!("{name}: {} edges from {} into {population}[{node_id}]", result.len(), edges.source);
        }
        Ok(result)
    }

    fn morphologies_dir(&self) -> Result<PathBuf> {
        self.config.morphologies_dir()
    }

    fn biophysics_dir(&self) -> Result<PathBuf> {
        self.config.biophysics_dir()
    }
}

impl CircuitWriter for H5Circuit {
    fn write_node(&mut self, node: &Node) -> Result<()> {
        let file = self.node_file(&node.population)?;
        let h5 = hdf5::File::open_rw(&file.path)?;
        let pop = h5.group(&format!("nodes/{}", node.population))?;
        let layout = Layout::new(&pop, "node")?;
        let ix = layout
            .index_of(node.node_id)
            .ok_or_else(|| anyhow!("No node {} in population {}", node.node_id, node.population))?;
        let group_id = layout.group_ids[ix];
        let group = pop.group(&group_id.to_string())?;
        let gix = layout.group_indices[ix];
        let typed = file.types.get(&layout.type_ids[ix]);
        for (name, value) in &node.attributes {
            if name == "node_type_id" {
                continue;
            }
            if let Some(param) = name.strip_prefix(DYNAMICS_PREFIX) {
                let dynamics = group.group(DYNAMICS)?;
                write_scalar(&dynamics.dataset(param)?, gix, value)?;
            } else if group.link_exists(name) {
                write_group_value(&group, name, gix, value)?;
            } else if typed.and_then(|t| t.get(name)) != Some(value) {
                let rows = layout.group_rows(group_id).collect::<Vec<_>>();
                let mut fill = vec![None; rows.iter().map(|(_, g)| g + 1).max().unwrap_or(0)];
                for (row, g) in rows {
                    fill[g] = file
                        .types
                        .get(&layout.type_ids[row])
                        .and_then(|t| t.get(name))
                        .cloned();
                }
                create_column(&group, name, value, fill)?;
                write_group_value(&group, name, gix, value)?;
            }
        }
        Ok(())
    }

    fn write_edges(&mut self, population: &str, edges: &[EdgeRow]) -> Result<()> {
        let entry = self.edge_population(population)?;
        let h5 = hdf5::File::open_rw(&entry.path)?;
        let pop = h5.group(&format!("edges/{population}"))?;
        let layout = Layout::new(&pop, "edge")?;
        for edge in edges {
            let ix = layout
                .index_of(edge.edge_id)
                .ok_or_else(|| anyhow!("No edge {} in population {population}", edge.edge_id))?;
            let group_id = layout.group_ids[ix];
            let group = pop.group(&group_id.to_string())?;
            let gix = layout.group_indices[ix];
            for (name, value) in &edge.columns {
                if let Some(param) = name.strip_prefix(DYNAMICS_PREFIX) {
                    let dynamics = group.group(DYNAMICS)?;
                    write_scalar(&dynamics.dataset(param)?, gix, value)?;
                } else if group.link_exists(name) {
                    write_group_value(&group, name, gix, value)?;
                } else if name.starts_with("afferent_") {
                    let size = layout.group_rows(group_id).map(|(_, g)| g + 1).max().unwrap_or(0);
                    create_column(&group, name, value, vec![None; size])?;
                    write_group_value(&group, name, gix, value)?;
                } else {
                    trace!("Edge column {name} is not stored per instance, skipping");
                }
            }
        }
        Ok(())
    }
}
