//! Summarise the biophysics of a (reduced) cell per section list and render
//! it as a hoc cell template.

use std::{
    fmt::Write as _,
    fs::OpenOptions,
    io::{ErrorKind, Write as _},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cell::{CellTree, Mechanism, SectionId},
    err::{anyhow, Context, Result},
    identity::SectionList,
    sup::to_valid_nrn_name,
    Map,
};

/// numpy.isclose with its default tolerances
fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// Per segment values of one parameter over one section.
pub type SegmentValues = Vec<Option<f64>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Biophysics {
    /// channel mechanisms of each list
    pub mechanisms: Map<SectionList, Vec<String>>,
    /// parameters with one value over the whole list, by global name
    pub uniform: Map<SectionList, Map<String, f64>>,
    /// parameters that vary, with their values per section of the list
    pub nonuniform: Map<SectionList, Map<String, Vec<SegmentValues>>>,
    /// nseg of each section of the list
    pub nsegs: Map<SectionList, Vec<usize>>,
    /// data quality findings, also logged
    #[serde(skip)]
    pub warnings: Vec<String>,
}

/// Global parameter name to value of everything a segment carries. Ion
/// mechanisms only contribute their reversal potentials.
fn segment_values(mechanisms: &[Mechanism]) -> Map<String, f64> {
    let mut out = Map::new();
    for mech in mechanisms {
        for (param, value) in &mech.parameters {
            if mech.ion {
                if param.starts_with('e') {
                    out.insert(param.clone(), *value);
                }
            } else {
                out.insert(mech.full_name(param), *value);
            }
        }
    }
    out
}

impl Biophysics {
    pub fn extract(tree: &CellTree, lists: &Map<SectionList, Vec<SectionId>>) -> Result<Self> {
        let mut out = Biophysics::default();
        for (list, sections) in lists {
            let Some(first) = sections.first() else {
                continue;
            };
            let first = tree.section(*first)?;
            let first_segment = first
                .segments
                .first()
                .ok_or_else(|| anyhow!("Section {} has no segments", first.name))?;

            let mechanisms: Vec<String> = first_segment
                .iter()
                .filter(|m| !m.ion)
                .map(|m| m.name.clone())
                .collect();
            let mut canonical = segment_values(first_segment);
            canonical.insert("cm".to_string(), first.cm);
            canonical.insert("Ra".to_string(), first.ra);

            let mut varying: Vec<String> = Vec::new();
            let mut nsegs = Vec::with_capacity(sections.len());
            for id in sections {
                let sec = tree.section(*id)?;
                nsegs.push(sec.nseg());
                for segment in &sec.segments {
                    for mech in segment.iter().filter(|m| !m.ion) {
                        if !mechanisms.contains(&mech.name) {
                            out.warn(format!(
                                "Unidentified mechanism {} in section {}",
                                mech.name, sec.name
                            ));
                        }
                    }
                    for mech in &mechanisms {
                        if !segment.iter().any(|m| &m.name == mech) {
                            out.warn(format!("Mechanism {mech} missing in section {}", sec.name));
                        }
                    }
                    let mut values = segment_values(segment);
                    values.insert("cm".to_string(), sec.cm);
                    values.insert("Ra".to_string(), sec.ra);
                    for (name, value) in values {
                        match canonical.get(&name) {
                            None => out.warn(format!(
                                "Unidentified parameter {name} in section {}",
                                sec.name
                            )),
                            Some(expected) if !is_close(value, *expected) => {
                                if !varying.contains(&name) {
                                    out.warn(format!(
                                        "Unequal parameter {name} in section {}: {value} vs {expected}",
                                        sec.name
                                    ));
                                    varying.push(name);
                                }
                            }
                            Some(_) => {}
                        }
                    }
                }
            }

            let mut nonuniform = Map::new();
            for name in &varying {
                let mut per_section = Vec::with_capacity(sections.len());
                for id in sections {
                    let sec = tree.section(*id)?;
                    let values = sec
                        .segments
                        .iter()
                        .map(|segment| match name.as_str() {
                            "cm" => Some(sec.cm),
                            "Ra" => Some(sec.ra),
                            _ => segment_values(segment).get(name).copied(),
                        })
                        .collect();
                    per_section.push(values);
                }
                nonuniform.insert(name.clone(), per_section);
            }
            canonical.retain(|name, _| !varying.contains(name));

            out.mechanisms.insert(*list, mechanisms);
            out.uniform.insert(*list, canonical);
            out.nonuniform.insert(*list, nonuniform);
            out.nsegs.insert(*list, nsegs);
        }
        Ok(out)
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Render as a hoc template named `template` that loads
    /// `morphology_name` from the directory passed to its `init`.
    pub fn to_hoc(&self, template: &str, morphology_name: &str) -> Result<String> {
        let lists = SectionList::ALL.map(|l| l.name()).join(", ");
        let arrays = SectionList::ALL
            .map(|l| format!("{}[1]", l.array()))
            .join(", ");
        let names = SectionList::ALL.map(|l| l.array()).join(", ");
        let mut hoc = String::new();
        write!(
            hoc,
            r#"/*
 * Reduced cell template, generated by sonata-reduce
 */
{{load_file("stdrun.hoc")}}
{{load_file("import3d.hoc")}}

begintemplate {template}
  public init, load_morphology, geom_nseg, biophys, distribute_nonuniform
  public {names}
  public all, {lists}
  public CellRef, morphology_name
  objref this, CellRef, all, {lists}
  create {arrays}
  strdef morphology_name

proc init(/* morphology_dir */) {{
  all = new SectionList()
"#
        )?;
        for list in SectionList::ALL {
            writeln!(hoc, "  {} = new SectionList()", list.name())?;
        }
        write!(
            hoc,
            r#"  CellRef = this
  morphology_name = "{morphology_name}"
  if (numarg() >= 1) {{
    load_morphology($s1, morphology_name)
  }}
  geom_nseg()
  biophys()
}}

proc load_morphology(/* morphology_dir, morphology_name */) {{ localobj morph, import
  strdef morph_path
  sprint(morph_path, "%s/%s", $s1, $s2)
  morph = new Import3d_SWC_read()
  morph.quiet = 1
  morph.input(morph_path)
  import = new Import3d_GUI(morph, 0)
  import.instantiate(this)
}}

proc geom_nseg() {{
"#
        )?;
        for (list, nsegs) in &self.nsegs {
            for (index, nseg) in nsegs.iter().enumerate() {
                writeln!(hoc, "  {}[{index}] nseg = {nseg}", list.array())?;
            }
        }
        hoc.push_str("}\n\nproc biophys() {\n");
        for (list, mechanisms) in &self.mechanisms {
            writeln!(hoc, "  forsec CellRef.{} {{", list.name())?;
            for mech in mechanisms {
                writeln!(hoc, "    insert {mech}")?;
            }
            for (name, value) in self.uniform.get(list).into_iter().flatten() {
                writeln!(hoc, "    {name} = {value}")?;
            }
            hoc.push_str("  }\n");
        }
        hoc.push_str("  distribute_nonuniform()\n}\n\nproc distribute_nonuniform() {\n");
        for (list, params) in &self.nonuniform {
            let nsegs = self.nsegs.get(list);
            for (name, sections) in params {
                for (index, values) in sections.iter().enumerate() {
                    let nseg = nsegs.and_then(|n| n.get(index)).copied().unwrap_or(1).max(1);
                    if name == "Ra" {
                        if let Some(Some(v)) = values.first() {
                            writeln!(hoc, "  {}[{index}].Ra = {v}", list.array())?;
                        }
                        continue;
                    }
                    for (seg, value) in values.iter().enumerate() {
                        let Some(value) = value else { continue };
                        let x = (seg as f64 + 0.5) / nseg as f64;
                        writeln!(hoc, "  {}[{index}].{name}({x}) = {value}", list.array())?;
                    }
                }
            }
        }
        hoc.push_str("}\n\nendtemplate ");
        hoc.push_str(template);
        hoc.push('\n');
        Ok(hoc)
    }

    /// Write the template to `path` unless a file is already there. Several
    /// cells may share one template, so the first writer wins. Returns
    /// whether anything was written.
    pub fn save(&self, path: &Path, morphology_name: &str) -> Result<bool> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("No template name in {path:?}"))?;
        let hoc = self.to_hoc(&to_valid_nrn_name(stem), morphology_name)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir:?}"))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Biophysics {path:?} exists, leaving it alone");
                return Ok(false);
            }
            Err(e) => return Err(e).with_context(|| format!("Creating {path:?}")),
        };
        file.write_all(hoc.as_bytes())
            .with_context(|| format!("Writing {path:?}"))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biophys::BiophysSource;

    fn cell() -> (CellTree, Map<SectionList, Vec<SectionId>>) {
        let mut tree = CellTree::new();
        let soma = tree.create_section("Cell[0].soma[0]");
        let d0 = tree.create_section("Cell[0].dend[0]");
        let d1 = tree.create_section("Cell[0].dend[1]");
        tree.connect(d0, soma).unwrap();
        tree.connect(d1, soma).unwrap();
        for sec in [soma, d0, d1] {
            let s = tree.section_mut(sec).unwrap();
            s.insert(Mechanism::new("pas").with("g", 3e-5).with("e", -70.0));
            s.insert(Mechanism::new("na_ion").with("ena", 50.0).with("nai", 10.0));
        }
        tree.section_mut(soma)
            .unwrap()
            .insert(Mechanism::new("NaTs").with("gbar", 1.0));
        let mut lists = Map::new();
        lists.insert(SectionList::Somatic, vec![soma]);
        lists.insert(SectionList::Basal, vec![d0, d1]);
        (tree, lists)
    }

    #[test]
    fn uniform_lists() {
        let (tree, lists) = cell();
        let bio = Biophysics::extract(&tree, &lists).unwrap();
        assert_eq!(bio.mechanisms[&SectionList::Somatic], vec!["pas", "NaTs"]);
        assert_eq!(bio.mechanisms[&SectionList::Basal], vec!["pas"]);
        let basal = &bio.uniform[&SectionList::Basal];
        assert_eq!(basal["g_pas"], 3e-5);
        assert_eq!(basal["ena"], 50.0);
        assert_eq!(basal["Ra"], 35.4);
        assert!(!basal.contains_key("nai"));
        assert!(bio.nonuniform[&SectionList::Basal].is_empty());
        assert_eq!(bio.nsegs[&SectionList::Basal], vec![1, 1]);
        assert!(bio.warnings.is_empty());
    }

    #[test]
    fn varying_parameters_are_kept_per_section() {
        let (mut tree, lists) = cell();
        let d1 = lists[&SectionList::Basal][1];
        let sec = tree.section_mut(d1).unwrap();
        sec.set_nseg(3);
        sec.segments[2][0].parameters.insert("g".to_string(), 6e-5);
        sec.insert(Mechanism::new("Ih").with("gbar", 1e-4));

        let bio = Biophysics::extract(&tree, &lists).unwrap();
        let basal = &bio.nonuniform[&SectionList::Basal];
        assert_eq!(
            basal["g_pas"],
            vec![vec![Some(3e-5)], vec![Some(3e-5), Some(3e-5), Some(6e-5)]]
        );
        assert!(!bio.uniform[&SectionList::Basal].contains_key("g_pas"));
        assert_eq!(bio.nsegs[&SectionList::Basal], vec![1, 3]);
        assert!(bio.warnings.iter().any(|w| w.contains("Unidentified mechanism Ih")));

        let hoc = bio.to_hoc("Cell_0", "morph_0.swc").unwrap();
        assert!(hoc.contains("  dend[1].g_pas(0.8333333333333334) = 0.00006"));
        assert!(hoc.contains("  dend[1] nseg = 3"));
    }

    #[test]
    fn rendered_template_reads_back() {
        let (tree, lists) = cell();
        let bio = Biophysics::extract(&tree, &lists).unwrap();
        let hoc = bio.to_hoc("Cell_0", "morph_0.swc").unwrap();
        let back = BiophysSource::HocTemplate("Cell_0.hoc".into())
            .canonicalize(&hoc)
            .unwrap();
        assert_eq!(back.morphology.as_deref(), Some("morph_0.swc"));
        let soma = &back.mechanisms[&SectionList::Somatic];
        assert_eq!(soma["NaTs"].parameters["gbar"], 1.0);
        assert_eq!(soma["pas"].parameters["e"], -70.0);
        assert_eq!(back.parameters[&SectionList::Basal]["ena"], 50.0);
        assert_eq!(back.parameters[&SectionList::Basal]["cm"], 1.0);
    }

    #[test]
    fn save_does_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("biophys").join("Cell_0.hoc");
        let (mut tree, lists) = cell();
        let first = Biophysics::extract(&tree, &lists).unwrap();
        assert!(first.save(&path, "morph_0.swc").unwrap());
        let written = std::fs::read_to_string(&path).unwrap();

        let soma = lists[&SectionList::Somatic][0];
        tree.section_mut(soma).unwrap().cm = 2.0;
        let second = Biophysics::extract(&tree, &lists).unwrap();
        assert!(!second.save(&path, "other.swc").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), written);
        assert!(written.contains("begintemplate Cell_0"));
    }
}
