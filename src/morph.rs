use std::{
    fmt::Write as _,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::{
    err::{anyhow, bail, Context, Result},
    Map,
};
use serde::{Deserialize, Serialize};

/// Neurite types as numbered by SWC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionType {
    Undefined,
    Soma,
    Axon,
    Basal,
    Apical,
}

impl SectionType {
    pub fn from_swc(code: i64) -> Self {
        match code {
            1 => SectionType::Soma,
            2 => SectionType::Axon,
            3 => SectionType::Basal,
            4 => SectionType::Apical,
            _ => SectionType::Undefined,
        }
    }

    pub fn swc(&self) -> i64 {
        match self {
            SectionType::Undefined => 0,
            SectionType::Soma => 1,
            SectionType::Axon => 2,
            SectionType::Basal => 3,
            SectionType::Apical => 4,
        }
    }

    /// Classify a cable section by its name.
    pub fn from_name(name: &str) -> Self {
        if name.contains("axon") {
            SectionType::Axon
        } else if name.contains("apic") {
            SectionType::Apical
        } else if name.contains("dend") {
            SectionType::Basal
        } else if name.contains("soma") {
            SectionType::Soma
        } else {
            SectionType::Undefined
        }
    }

    /// Rank in which NEURON instantiates neurites below the soma.
    pub fn neuron_rank(&self) -> u8 {
        match self {
            SectionType::Undefined => 0,
            SectionType::Soma => 1,
            SectionType::Axon => 2,
            SectionType::Basal => 3,
            SectionType::Apical => 4,
        }
    }
}

impl std::fmt::Display for SectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SectionType::Undefined => "undefined",
            SectionType::Soma => "soma",
            SectionType::Axon => "axon",
            SectionType::Basal => "basal_dendrite",
            SectionType::Apical => "apical_dendrite",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Soma {
    pub points: Vec<[f64; 3]>,
    pub diameters: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSection {
    pub kind: SectionType,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub points: Vec<[f64; 3]>,
    pub diameters: Vec<f64>,
}

/// Persisted morphology: one soma plus a forest of sections. Section ids are
/// assigned depth first, roots in NEURON order; the soma is id -1 and not part
/// of the numbering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MorphologyGraph {
    pub soma: Soma,
    sections: Vec<GraphSection>,
    roots: Vec<usize>,
}

impl MorphologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_root_section(
        &mut self,
        points: Vec<[f64; 3]>,
        diameters: Vec<f64>,
        kind: SectionType,
    ) -> usize {
        let id = self.sections.len();
        self.sections.push(GraphSection {
            kind,
            parent: None,
            children: Vec::new(),
            points,
            diameters,
        });
        self.roots.push(id);
        id
    }

    /// Append a child of `parent`, inheriting its type.
    pub fn append_section(
        &mut self,
        parent: usize,
        points: Vec<[f64; 3]>,
        diameters: Vec<f64>,
    ) -> Result<usize> {
        let kind = self
            .sections
            .get(parent)
            .ok_or_else(|| anyhow!("Unknown parent section {parent}"))?
            .kind;
        let id = self.sections.len();
        self.sections.push(GraphSection {
            kind,
            parent: Some(parent),
            children: Vec::new(),
            points,
            diameters,
        });
        self.sections[parent].children.push(id);
        Ok(id)
    }

    pub fn set_kind(&mut self, id: usize, kind: SectionType) -> Result<()> {
        match self.sections.get_mut(id) {
            Some(section) => {
                section.kind = kind;
                Ok(())
            }
            None => bail!("Unknown section {id}"),
        }
    }

    /// Continue section `id` with more points. A first point equal to the
    /// current last one is dropped.
    pub fn extend_section(
        &mut self,
        id: usize,
        points: Vec<[f64; 3]>,
        diameters: Vec<f64>,
    ) -> Result<()> {
        let section = self
            .sections
            .get_mut(id)
            .ok_or_else(|| anyhow!("Unknown section {id}"))?;
        let skip = match (section.points.last(), points.first()) {
            (Some(a), Some(b)) if a == b => 1,
            _ => 0,
        };
        section.points.extend(points.into_iter().skip(skip));
        section.diameters.extend(diameters.into_iter().skip(skip));
        Ok(())
    }

    pub fn section(&self, id: usize) -> Option<&GraphSection> {
        self.sections.get(id)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Section ids depth first, roots in insertion order.
    pub fn iter_depth_first(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.sections.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.sections[id].children.iter().rev());
        }
        out
    }

    /// Number of sections a SONATA reader sees, soma included.
    pub fn sonata_section_count(&self) -> usize {
        self.sections.len() + 1
    }

    pub fn write_swc(&self, path: &Path) -> Result<()> {
        let mut out = String::from("# generated by sonata-reduce\n");
        let mut next = 1_i64;
        let mut soma_first = -1_i64;
        let mut previous = -1_i64;
        for (p, d) in self.soma.points.iter().zip(&self.soma.diameters) {
            writeln!(out, "{next} 1 {} {} {} {} {previous}", p[0], p[1], p[2], d / 2.0)?;
            if soma_first < 0 {
                soma_first = next;
            }
            previous = next;
            next += 1;
        }
        // id of the last point written for each section
        let mut tails: Map<usize, i64> = Map::new();
        for id in self.iter_depth_first() {
            let section = &self.sections[id];
            let (mut parent, skip_first) = match section.parent {
                Some(p) => {
                    let tail = *tails
                        .get(&p)
                        .ok_or_else(|| anyhow!("Parent {p} of section {id} not yet written"))?;
                    let duplicate = match (self.sections[p].points.last(), section.points.first()) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    };
                    (tail, duplicate)
                }
                None => (soma_first, false),
            };
            let kind = section.kind.swc();
            let skip = usize::from(skip_first);
            for (p, d) in section.points.iter().zip(&section.diameters).skip(skip) {
                writeln!(out, "{next} {kind} {} {} {} {} {parent}", p[0], p[1], p[2], d / 2.0)?;
                parent = next;
                next += 1;
            }
            tails.insert(id, parent);
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir:?}"))?;
        }
        std::fs::write(path, out).with_context(|| format!("Writing morphology {path:?}"))
    }

    /// Read an SWC file. Sections break at bifurcations and type changes, so
    /// unbranched chains come back as a single section.
    pub fn read_swc(path: &Path) -> Result<Self> {
        let rd = File::open(path).with_context(|| format!("Opening {path:?}"))?;
        let mut points: Vec<SwcPoint> = Vec::new();
        for (lno, line) in BufReader::new(rd).lines().enumerate() {
            let line = line.with_context(|| format!("Reading {path:?}"))?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 7 {
                bail!("{path:?}:{}: expected 7 columns, found {}", lno + 1, cols.len());
            }
            let num = |i: usize| -> Result<f64> {
                cols[i]
                    .parse::<f64>()
                    .with_context(|| format!("{path:?}:{}: bad number {}", lno + 1, cols[i]))
            };
            points.push(SwcPoint {
                id: num(0)? as i64,
                kind: SectionType::from_swc(num(1)? as i64),
                xyz: [num(2)?, num(3)?, num(4)?],
                diam: 2.0 * num(5)?,
                parent: num(6)? as i64,
            });
        }
        Self::from_points(&points).with_context(|| format!("Building morphology from {path:?}"))
    }

    fn from_points(points: &[SwcPoint]) -> Result<Self> {
        let index: Map<i64, usize> = points.iter().enumerate().map(|(i, p)| (p.id, i)).collect();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); points.len()];
        for (i, p) in points.iter().enumerate() {
            if p.parent >= 0 {
                let parent = *index
                    .get(&p.parent)
                    .ok_or_else(|| anyhow!("Point {} has unknown parent {}", p.id, p.parent))?;
                children[parent].push(i);
            }
        }

        let mut graph = MorphologyGraph::new();
        let mut starts = Vec::new();
        for (i, p) in points.iter().enumerate() {
            if p.kind == SectionType::Soma {
                graph.soma.points.push(p.xyz);
                graph.soma.diameters.push(p.diam);
                starts.extend(
                    children[i]
                        .iter()
                        .filter(|c| points[**c].kind != SectionType::Soma),
                );
            } else if p.parent < 0 {
                starts.push(i);
            }
        }
        // stable sort keeps file order within a type
        starts.sort_by_key(|i| points[*i].kind.neuron_rank());

        for start in starts {
            let (pts, ds, tail) = walk_section(points, &children, start, None);
            let kind = points[start].kind;
            let root = graph.append_root_section(pts, ds, kind);
            let mut stack = vec![(root, tail)];
            while let Some((section, tail)) = stack.pop() {
                let mut pending = Vec::new();
                for child in &children[tail] {
                    let (pts, ds, child_tail) = walk_section(points, &children, *child, Some(tail));
                    let id = graph.append_section(section, pts, ds)?;
                    graph.sections[id].kind = points[*child].kind;
                    pending.push((id, child_tail));
                }
                stack.extend(pending.into_iter().rev());
            }
        }
        graph.renumber();
        Ok(graph)
    }

    /// Reassign ids so they follow depth-first order.
    fn renumber(&mut self) {
        let order = self.iter_depth_first();
        let mut new_id = vec![0; self.sections.len()];
        for (new, old) in order.iter().enumerate() {
            new_id[*old] = new;
        }
        let mut sections = Vec::with_capacity(order.len());
        for old in &order {
            let mut section = self.sections[*old].clone();
            section.parent = section.parent.map(|p| new_id[p]);
            section.children = section.children.iter().map(|c| new_id[*c]).collect();
            sections.push(section);
        }
        self.roots = self.roots.iter().map(|r| new_id[*r]).collect();
        self.sections = sections;
    }
}

struct SwcPoint {
    id: i64,
    kind: SectionType,
    xyz: [f64; 3],
    diam: f64,
    parent: i64,
}

/// Collect points from `start` while the chain neither branches nor changes
/// type. The parent's last point is repeated as the first point, the way
/// NEURON and SWC readers share bifurcation points.
fn walk_section(
    points: &[SwcPoint],
    children: &[Vec<usize>],
    start: usize,
    parent_tail: Option<usize>,
) -> (Vec<[f64; 3]>, Vec<f64>, usize) {
    let mut pts = Vec::new();
    let mut ds = Vec::new();
    if let Some(tail) = parent_tail {
        pts.push(points[tail].xyz);
        ds.push(points[tail].diam);
    }
    let kind = points[start].kind;
    let mut cursor = start;
    loop {
        pts.push(points[cursor].xyz);
        ds.push(points[cursor].diam);
        match children[cursor].as_slice() {
            [only] if points[*only].kind == kind => cursor = *only,
            _ => break,
        }
    }
    (pts, ds, cursor)
}

/// Cumulative path length at every point.
pub fn arc_lengths(points: &[[f64; 3]]) -> Vec<f64> {
    let mut acc = 0.0;
    let mut out = Vec::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        if i > 0 {
            let q = points[i - 1];
            acc += ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2) + (p[2] - q[2]).powi(2)).sqrt();
        }
        out.push(acc);
    }
    out
}

/// Locate `fraction` of the path along `points` as (segment id, offset): the
/// segment id is the index of the last point whose cumulative length does not
/// exceed the target, the offset the remaining distance past that point.
pub fn segment_offset(points: &[[f64; 3]], fraction: f64) -> (usize, f64) {
    let lengths = arc_lengths(points);
    let total = match lengths.last() {
        Some(total) => *total,
        None => return (0, 0.0),
    };
    let target = fraction.clamp(0.0, 1.0) * total;
    let index = lengths
        .iter()
        .rposition(|l| *l <= target)
        .unwrap_or(0);
    (index, (target - lengths[index]).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize, step: f64) -> Vec<[f64; 3]> {
        (0..n).map(|i| [i as f64 * step, 0.0, 0.0]).collect()
    }

    #[test]
    fn segment_offset_boundaries() {
        let points = line(5, 2.5);
        assert_eq!(segment_offset(&points, 0.0), (0, 0.0));
        let (seg, off) = segment_offset(&points, 1.0);
        assert_eq!(seg, 4);
        assert!(off.abs() < 1e-12);
        let (seg, off) = segment_offset(&points, 0.3);
        assert_eq!(seg, 1);
        assert!((off - 0.5).abs() < 1e-12);
        assert_eq!(segment_offset(&[], 0.5), (0, 0.0));
    }

    #[test]
    fn names_classify_sections() {
        assert_eq!(SectionType::from_name("Cell[0].axon[2]"), SectionType::Axon);
        assert_eq!(SectionType::from_name("Cell[0].apic[0]"), SectionType::Apical);
        assert_eq!(SectionType::from_name("Cell[0].dend[11]"), SectionType::Basal);
        assert_eq!(SectionType::from_name("Cell[0].soma[0]"), SectionType::Soma);
        assert_eq!(SectionType::from_name("Cell[0].myelin[0]"), SectionType::Undefined);
    }

    #[test]
    fn swc_round_trip_merges_unbranched_chains() {
        let mut graph = MorphologyGraph::new();
        graph.soma.points = vec![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        graph.soma.diameters = vec![4.0, 4.0];
        let apic = graph.append_root_section(
            vec![[0.0, 2.0, 0.0], [0.0, 10.0, 0.0]],
            vec![2.0, 2.0],
            SectionType::Apical,
        );
        let dend = graph.append_root_section(
            vec![[1.0, 0.0, 0.0], [5.0, 0.0, 0.0]],
            vec![1.0, 1.0],
            SectionType::Basal,
        );
        // single child: merged on reload
        let cont = graph
            .append_section(dend, vec![[5.0, 0.0, 0.0], [9.0, 0.0, 0.0]], vec![1.0, 1.0])
            .unwrap();
        graph
            .append_section(cont, vec![[9.0, 0.0, 0.0], [9.0, 4.0, 0.0]], vec![1.0, 1.0])
            .unwrap();
        graph
            .append_section(cont, vec![[9.0, 0.0, 0.0], [9.0, -4.0, 0.0]], vec![1.0, 1.0])
            .unwrap();
        assert_eq!(graph.section(apic).unwrap().kind, SectionType::Apical);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.swc");
        graph.write_swc(&path).unwrap();
        let back = MorphologyGraph::read_swc(&path).unwrap();

        assert_eq!(back.soma, graph.soma);
        let kinds: Vec<_> = back
            .iter_depth_first()
            .iter()
            .map(|id| back.section(*id).unwrap().kind)
            .collect();
        // basal ranks before apical, dend+cont merged into one section
        assert_eq!(
            kinds,
            vec![
                SectionType::Basal,
                SectionType::Basal,
                SectionType::Basal,
                SectionType::Apical
            ]
        );
        let merged = back.section(0).unwrap();
        assert_eq!(merged.points.len(), 3);
        assert_eq!(merged.children, vec![1, 2]);
        assert_eq!(back.section(1).unwrap().points[0], [9.0, 0.0, 0.0]);
        assert_eq!(back.sonata_section_count(), 5);
    }
}
