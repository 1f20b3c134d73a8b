//! Biophysics sources a node may reference and their canonical form.
//!
//! Every source is mapped to the same [`CanonicalBiophysics`] before any cell
//! is instantiated: mechanisms with parameters per section list, section
//! level values (`cm`, `Ra`, reversal potentials) per list, and the
//! morphology the template names, if any.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{
    cell::Mechanism,
    err::{anyhow, bail, Context, Result},
    identity::SectionList,
    sup::split_reference,
    Map,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiophysSource {
    HocTemplate(PathBuf),
    NeuroMLModel(PathBuf),
    /// Allen Cell Types fit, `*_fit.json`
    AllenFit(PathBuf),
}

impl BiophysSource {
    /// Pick the source for a node from its `model_template` (`hoc:Name`,
    /// `nml:Cell.cell.nml`, ...) and, for Allen style `ctdb:` templates, its
    /// `dynamics_params` file.
    pub fn for_node(
        model_template: &str,
        dynamics_params: Option<&str>,
        biophys_dir: &Path,
    ) -> Result<Self> {
        let (kind, name) = split_reference(model_template);
        if let (Some("ctdb"), Some(params)) = (kind, dynamics_params) {
            return Ok(BiophysSource::AllenFit(biophys_dir.join(params)));
        }
        let ext = match kind {
            Some(kind) => kind,
            None => Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .ok_or_else(|| anyhow!("Cannot tell the format of model template {model_template}"))?,
        };
        let file = if name.ends_with(&format!(".{ext}")) {
            name.to_string()
        } else {
            format!("{name}.{ext}")
        };
        let path = biophys_dir.join(file);
        match ext {
            "hoc" => Ok(BiophysSource::HocTemplate(path)),
            "nml" => Ok(BiophysSource::NeuroMLModel(path)),
            "json" => Ok(BiophysSource::AllenFit(path)),
            _ => bail!("Unsupported biophysics {model_template}"),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            BiophysSource::HocTemplate(p)
            | BiophysSource::NeuroMLModel(p)
            | BiophysSource::AllenFit(p) => p,
        }
    }

    pub fn load(&self) -> Result<CanonicalBiophysics> {
        let path = self.path();
        let text = std::fs::read_to_string(path).with_context(|| format!("Reading {path:?}"))?;
        self.canonicalize(&text)
            .with_context(|| format!("Interpreting biophysics {path:?}"))
    }

    pub fn canonicalize(&self, text: &str) -> Result<CanonicalBiophysics> {
        match self {
            BiophysSource::HocTemplate(_) => from_hoc(text),
            BiophysSource::NeuroMLModel(_) => from_nml(text),
            BiophysSource::AllenFit(_) => {
                let fit: Fit = serde_json::from_str(text)?;
                fit.canonical()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalBiophysics {
    pub mechanisms: Map<SectionList, Map<String, Mechanism>>,
    pub parameters: Map<SectionList, Map<String, f64>>,
    pub morphology: Option<String>,
}

impl CanonicalBiophysics {
    pub fn insert(&mut self, list: SectionList, mechanism: &str) -> &mut Mechanism {
        self.mechanisms
            .entry(list)
            .or_default()
            .entry(mechanism.to_string())
            .or_insert_with(|| Mechanism::new(mechanism))
    }

    pub fn set_parameter(&mut self, list: SectionList, name: &str, value: f64) {
        self.parameters
            .entry(list)
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Name of the mechanism inserted in `list` that a global parameter name
    /// like `gbar_NaTs` belongs to. Mechanism names may contain underscores,
    /// so the longest match wins.
    fn owner(&self, list: SectionList, name: &str) -> Option<(String, String)> {
        self.mechanisms
            .get(&list)?
            .keys()
            .filter_map(|m| {
                name.strip_suffix(&format!("_{m}"))
                    .map(|p| (m.clone(), p.to_string()))
            })
            .max_by_key(|(m, _)| m.len())
    }
}

/// Section lists addressed by a region name.
fn regions(name: &str) -> Result<Vec<SectionList>> {
    if name == "all" || name == "all_group" {
        return Ok(SectionList::ALL.to_vec());
    }
    if let Some(list) = SectionList::from_name(name).or_else(|| SectionList::from_array(name)) {
        return Ok(vec![list]);
    }
    // NeuroML segment groups, eg soma_group, apical_dends
    for (needle, list) in [
        ("soma", SectionList::Somatic),
        ("axon", SectionList::Axonal),
        ("apic", SectionList::Apical),
        ("dend", SectionList::Basal),
        ("basal", SectionList::Basal),
    ] {
        if name.contains(needle) {
            return Ok(vec![list]);
        }
    }
    bail!("Unknown region {name}")
}

fn from_hoc(text: &str) -> Result<CanonicalBiophysics> {
    let mut out = CanonicalBiophysics::default();
    // lists of the enclosing forsec block and its brace depth
    let mut block: Option<(Vec<SectionList>, i32)> = None;
    for (lno, line) in text.lines().enumerate() {
        let line = line.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.split_once("morphology_name = \"").map(|(_, r)| r) {
            if let Some((name, _)) = rest.split_once('"') {
                out.morphology = Some(name.to_string());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("forsec ") {
            let target = rest.trim_end_matches('{').trim();
            let target = target.rsplit('.').next().unwrap_or(target);
            let lists = match regions(target) {
                Ok(lists) => lists,
                Err(_) => {
                    warn!("Ignoring forsec block over {target} at line {}", lno + 1);
                    Vec::new()
                }
            };
            let depth = line.matches('{').count() as i32;
            block = Some((lists, depth));
            continue;
        }
        let Some((lists, depth)) = block.as_mut() else {
            continue;
        };
        *depth += line.matches('{').count() as i32 - line.matches('}').count() as i32;
        let statement = line.trim_end_matches('}').trim();
        if let Some(mech) = statement.strip_prefix("insert ") {
            for list in lists.iter() {
                out.insert(*list, mech.trim());
            }
        } else if let Some((name, value)) = statement.split_once('=') {
            let name = name.trim();
            match value.trim().parse::<f64>() {
                Ok(value) => {
                    for list in lists.clone() {
                        match out.owner(list, name) {
                            Some((mech, param)) => {
                                out.insert(list, &mech).parameters.insert(param, value);
                            }
                            None => out.set_parameter(list, name, value),
                        }
                    }
                }
                Err(_) => debug!("Skipping non constant assignment {name} at line {}", lno + 1),
            }
        }
        if *depth <= 0 {
            block = None;
        }
    }
    Ok(out)
}

/// Parameter mapping from NeuroML channel densities to NEURON names.
const PARAMS: &[(&str, &str)] = &[
    ("Im", "gbar"),
    ("Ih", "gbar"),
    ("Nap", "gbar"),
    ("NaV", "gbar"),
    ("Kv3_1", "gbar"),
    ("NaTa", "gbar"),
    ("Kd", "gbar"),
    ("K_P", "gbar"),
    ("Kv2like", "gbar"),
    ("Ca_LVA", "gbar"),
    ("Ca_HVA", "gbar"),
    ("Im_v2", "gbar"),
    ("NaTs", "gbar"),
    ("SK", "gbar"),
    ("K_T", "gbar"),
    ("pas", "g"),
];

/// Reversal potentials that are mechanism parameters rather than ion ones.
const GLOBAL: &[(&str, &str)] = &[("Ih", "ehcn"), ("pas", "e")];

fn required<'a>(node: roxmltree::Node<'a, '_>, key: &str) -> Result<&'a str> {
    node.attribute(key)
        .ok_or_else(|| anyhow!("<{}> lacks attribute {key}", node.tag_name().name()))
}

/// Split `0.5 mS_per_cm2` into value and unit.
fn quantity(text: &str) -> Result<(f64, &str)> {
    let text = text.trim();
    let split = text
        .char_indices()
        .find(|(i, c)| {
            (c.is_ascii_alphabetic() || *c == '_')
                && !((*c == 'e' || *c == 'E')
                    && text[i + 1..].starts_with(|n: char| n.is_ascii_digit() || n == '-' || n == '+'))
        })
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let value = text[..split]
        .trim()
        .parse::<f64>()
        .with_context(|| format!("Bad quantity {text}"))?;
    Ok((value, text[split..].trim()))
}

fn scaled(text: &str, units: &[(&str, f64)]) -> Result<f64> {
    let (value, unit) = quantity(text)?;
    if unit.is_empty() {
        return Ok(value);
    }
    match units.iter().find(|(u, _)| *u == unit) {
        Some((_, scale)) => Ok(value * scale),
        None => bail!("Unsupported unit {unit} in {text}"),
    }
}

/// to S/cm2
const CONDUCTANCE: &[(&str, f64)] = &[
    ("S_per_cm2", 1.0),
    ("mS_per_cm2", 1e-3),
    ("S_per_m2", 1e-4),
    ("mS_per_m2", 1e-7),
];
/// to uF/cm2
const CAPACITANCE: &[(&str, f64)] = &[("uF_per_cm2", 1.0), ("F_per_m2", 100.0)];
/// to ohm cm
const RESISTIVITY: &[(&str, f64)] = &[("ohm_cm", 1.0), ("kohm_cm", 1e3), ("ohm_m", 100.0)];
/// to mV
const VOLTAGE: &[(&str, f64)] = &[("mV", 1.0), ("V", 1e3)];

fn from_nml(text: &str) -> Result<CanonicalBiophysics> {
    let doc = roxmltree::Document::parse(text).context("Parsing NeuroML")?;
    let mut out = CanonicalBiophysics::default();
    for element in doc.descendants().filter(|n| n.is_element()) {
        let group = element.attribute("segmentGroup").unwrap_or("all");
        match element.tag_name().name() {
            "channelDensity" | "channelDensityNernst" => {
                let mech = required(element, "ionChannel")?;
                let ion = element.attribute("ion").unwrap_or("non_specific");
                let gname = PARAMS
                    .iter()
                    .find(|(owner, _)| *owner == mech)
                    .map(|(_, p)| *p)
                    .unwrap_or("gbar");
                let cond = element
                    .attribute("condDensity")
                    .map(|c| scaled(c, CONDUCTANCE))
                    .transpose()?;
                let erev = element.attribute("erev").map(|e| scaled(e, VOLTAGE)).transpose()?;
                for list in regions(group)? {
                    let m = out.insert(list, mech);
                    if let Some(g) = cond {
                        m.parameters.insert(gname.to_string(), g);
                    }
                    let Some(e) = erev else { continue };
                    match GLOBAL.iter().find(|(owner, _)| *owner == mech) {
                        Some((_, name)) => {
                            m.parameters.insert(name.to_string(), e);
                        }
                        None if ion == "non_specific" => {
                            m.parameters.insert("e".to_string(), e);
                        }
                        None => out.set_parameter(list, &format!("e{ion}"), e),
                    }
                }
            }
            "specificCapacitance" => {
                let cm = scaled(required(element, "value")?, CAPACITANCE)?;
                for list in regions(group)? {
                    out.set_parameter(list, "cm", cm);
                }
            }
            "resistivity" => {
                let ra = scaled(required(element, "value")?, RESISTIVITY)?;
                for list in regions(group)? {
                    out.set_parameter(list, "Ra", ra);
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

fn de_f64_or_string_as_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(de::Error::custom)?,
        Value::Number(num) => num
            .as_f64()
            .ok_or_else(|| de::Error::custom("Invalid number"))?,
        _ => return Err(de::Error::custom("wrong type")),
    })
}

#[derive(Debug, Deserialize)]
struct Conditions {
    #[serde(default)]
    erev: Vec<RevPot>,
}

#[derive(Debug, Deserialize)]
struct RevPot {
    section: String,
    #[serde(flatten)]
    values: Map<String, f64>,
}

#[derive(Debug, Deserialize)]
struct Gene {
    section: String,
    #[serde(deserialize_with = "de_f64_or_string_as_f64")]
    value: f64,
    mechanism: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Cm {
    section: String,
    cm: f64,
}

#[derive(Debug, Deserialize)]
struct Passive {
    ra: Option<f64>,
    e_pas: Option<f64>,
    #[serde(default)]
    cm: Vec<Cm>,
}

#[derive(Debug, Deserialize)]
struct Fit {
    #[serde(default)]
    conditions: Vec<Conditions>,
    genome: Vec<Gene>,
    #[serde(default)]
    passive: Vec<Passive>,
}

impl Fit {
    fn canonical(&self) -> Result<CanonicalBiophysics> {
        let mut out = CanonicalBiophysics::default();
        for gene in &self.genome {
            let mech = if gene.mechanism.is_empty() {
                "pas"
            } else {
                gene.mechanism.as_str()
            };
            let lists = regions(&gene.section)?;
            // Parameter names end in the mechanism name, eg gbar_NaV, or are
            // one of the reserved passive names.
            if let Some(param) = gene.name.strip_suffix(&format!("_{mech}")) {
                for list in lists {
                    out.insert(list, mech)
                        .parameters
                        .insert(param.to_string(), gene.value);
                }
            } else if mech == "pas" {
                let name = match gene.name.as_str() {
                    "cm" | "Cm" => "cm",
                    "ra" | "Ra" => "Ra",
                    x => bail!("Unexpected passive key {x}"),
                };
                for list in lists {
                    out.set_parameter(list, name, gene.value);
                }
            } else {
                bail!(
                    "Genome parameter must end in its mechanism name, or be cm/ra without one. Found mech={mech} and name={}",
                    gene.name
                );
            }
        }
        for passive in &self.passive {
            for cm in &passive.cm {
                for list in regions(&cm.section)? {
                    out.set_parameter(list, "cm", cm.cm);
                }
            }
            if let Some(ra) = passive.ra {
                for list in SectionList::ALL {
                    out.set_parameter(list, "Ra", ra);
                }
            }
            if let Some(e_pas) = passive.e_pas {
                for mechs in out.mechanisms.values_mut() {
                    if let Some(pas) = mechs.get_mut("pas") {
                        pas.parameters.insert("e".to_string(), e_pas);
                    }
                }
            }
        }
        for cond in &self.conditions {
            for rev in &cond.erev {
                for list in regions(&rev.section)? {
                    for (name, value) in &rev.values {
                        out.set_parameter(list, name, *value);
                    }
                }
            }
        }
        Ok(out)
    }
}
