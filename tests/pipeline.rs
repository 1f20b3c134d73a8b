use std::{fs, path::Path};

use sonata_reduce::{
    cell::{CellTree, SectionId, Synapse},
    circuit::{Attribute, CircuitStore, EdgeColumns, EdgeTable, MemoryCircuit, DYNAMICS_PREFIX},
    edges::{SECTION_ID, SECTION_POS, SEGMENT_ID, SEGMENT_OFFSET},
    err::{bail, NodeError, ReductionError, Result},
    identity::{ordered_children, parse_section_name, SectionList},
    morph::{segment_offset, MorphologyGraph, SectionType},
    network::{reduce_population, DriverOptions},
    node::{NodeReducer, EDGES_DIR},
    reductor::{IdentityReductor, Reduction, ReductionOptions, SubtreeReductor},
    simulator::BuiltinSimulator,
    Map,
};

const HOC: &str = r#"begintemplate Pyr
public init
proc biophys() {
  forsec CellRef.all {
    insert pas
    g_pas = 0.0001
    e_pas = -70
    cm = 1
    Ra = 100
  }
}
endtemplate Pyr
"#;

/// Folds every neurite hanging off the soma into a single section. Synapses
/// move to the middle of their new section. Connections are carried over
/// unless `fresh`, in input order unless `reverse`.
#[derive(Default)]
struct Collapse {
    reverse: bool,
    fresh: bool,
}

impl SubtreeReductor for Collapse {
    fn reduce(&self, input: Reduction, _options: &ReductionOptions) -> Result<Reduction> {
        let old = &input.cell;
        let mut cell = CellTree::new();
        let soma_name = old.name(input.root).to_string();
        let prefix = soma_name.split('.').next().unwrap().to_string();
        let soma = cell.create_section(&soma_name);
        cell.section_mut(soma)?.points = old.section(input.root)?.points.clone();
        cell.section_mut(soma)?.segments = old.section(input.root)?.segments.clone();

        let mut placed: Map<SectionId, SectionId> = Map::new();
        placed.insert(input.root, soma);
        let mut counters: Map<SectionList, usize> = Map::new();
        for child in ordered_children(old, input.root) {
            let (list, _) = parse_section_name(old.name(child))?;
            let index = counters.entry(list).or_default();
            let sec = cell.create_section(&format!("{prefix}.{}[{index}]", list.array()));
            *index += 1;
            cell.connect(sec, soma)?;
            let subtree = old.wholetree(child);
            let mut length = 0.0;
            for s in &subtree {
                length += old.section(*s)?.length();
                placed.insert(*s, sec);
            }
            let first = old.section(child)?;
            let start = first.points[0];
            let mut end = start;
            end.x += length;
            let section = cell.section_mut(sec)?;
            section.points = vec![start, end];
            section.segments = vec![first.segments[0].clone()];
            section.set_nseg(3);
        }

        let mut order = input.connections.clone();
        if self.reverse {
            order.reverse();
        }
        let mut synapses = Vec::new();
        let mut connections = Vec::new();
        for id in &order {
            let con = old.connection(*id)?;
            let syn = old.synapse(con.synapse)?;
            let synapse = cell.add_synapse(Synapse {
                class: syn.class.clone(),
                section: placed[&syn.section],
                x: 0.5,
                parameters: syn.parameters.clone(),
            })?;
            connections.push(if self.fresh {
                cell.connect_synapse(synapse, con.delay, con.weight)?
            } else {
                cell.adopt_connection(*id, synapse, con.delay, con.weight)?
            });
            synapses.push(synapse);
        }
        Ok(Reduction {
            cell,
            root: soma,
            synapses,
            connections,
        })
    }
}

struct Broken;

impl SubtreeReductor for Broken {
    fn reduce(&self, _input: Reduction, _options: &ReductionOptions) -> Result<Reduction> {
        bail!("no convergence")
    }
}

fn seg(from: [f64; 3], to: [f64; 3]) -> Vec<[f64; 3]> {
    vec![from, to]
}

/// Soma, a twice bifurcating basal tree, a forked apical and one axon.
fn branching() -> MorphologyGraph {
    let mut g = MorphologyGraph::new();
    g.soma.points = vec![[0.0, 0.0, 0.0]];
    g.soma.diameters = vec![10.0];
    g.append_root_section(seg([0.0, -5.0, 0.0], [0.0, -60.0, 0.0]), vec![1.0, 1.0], SectionType::Axon);
    let b0 = g.append_root_section(seg([5.0, 0.0, 0.0], [50.0, 0.0, 0.0]), vec![2.0, 2.0], SectionType::Basal);
    let b1 = g.append_section(b0, seg([50.0, 0.0, 0.0], [80.0, 20.0, 0.0]), vec![1.5, 1.5]).unwrap();
    g.append_section(b1, seg([80.0, 20.0, 0.0], [100.0, 40.0, 0.0]), vec![1.0, 1.0]).unwrap();
    g.append_section(b1, seg([80.0, 20.0, 0.0], [110.0, 20.0, 0.0]), vec![1.0, 1.0]).unwrap();
    g.append_section(b0, seg([50.0, 0.0, 0.0], [80.0, -20.0, 0.0]), vec![1.5, 1.5]).unwrap();
    let a0 = g.append_root_section(seg([0.0, 5.0, 0.0], [0.0, 100.0, 0.0]), vec![3.0, 3.0], SectionType::Apical);
    g.append_section(a0, seg([0.0, 100.0, 0.0], [-20.0, 150.0, 0.0]), vec![2.0, 2.0]).unwrap();
    g.append_section(a0, seg([0.0, 100.0, 0.0], [20.0, 150.0, 0.0]), vec![2.0, 2.0]).unwrap();
    g
}

/// Nothing but the axon branches.
fn unbranched() -> MorphologyGraph {
    let mut g = MorphologyGraph::new();
    g.soma.points = vec![[0.0, 0.0, 0.0]];
    g.soma.diameters = vec![10.0];
    let x0 = g.append_root_section(seg([0.0, -5.0, 0.0], [0.0, -60.0, 0.0]), vec![1.0, 1.0], SectionType::Axon);
    g.append_section(x0, seg([0.0, -60.0, 0.0], [10.0, -90.0, 0.0]), vec![0.5, 0.5]).unwrap();
    g.append_section(x0, seg([0.0, -60.0, 0.0], [-10.0, -90.0, 0.0]), vec![0.5, 0.5]).unwrap();
    g.append_root_section(
        vec![[5.0, 0.0, 0.0], [30.0, 5.0, 0.0], [60.0, 5.0, 0.0], [90.0, 0.0, 0.0]],
        vec![2.0, 2.0, 1.5, 1.0],
        SectionType::Basal,
    );
    g.append_root_section(
        vec![[0.0, 5.0, 0.0], [0.0, 50.0, 0.0], [5.0, 120.0, 0.0]],
        vec![3.0, 2.5, 2.0],
        SectionType::Apical,
    );
    g
}

fn edge_row(section: i64, pos: f64) -> Map<String, Attribute> {
    let mut row = Map::new();
    row.insert(SECTION_ID.to_string(), Attribute::Int(section));
    row.insert(SECTION_POS.to_string(), Attribute::Float(pos));
    row.insert("model_template".to_string(), Attribute::String("Exp2Syn".into()));
    row.insert(format!("{DYNAMICS_PREFIX}tau1"), Attribute::Float(1.0));
    row.insert("delay".to_string(), Attribute::Float(2.0));
    row.insert("syn_weight".to_string(), Attribute::Float(0.005));
    row
}

fn node(morphology: &str) -> Map<String, Attribute> {
    let mut attrs = Map::new();
    attrs.insert("morphology".to_string(), Attribute::String(morphology.into()));
    attrs.insert("model_template".to_string(), Attribute::String("hoc:Pyr".into()));
    attrs.insert("model_type".to_string(), Attribute::String("biophysical".into()));
    attrs
}

/// A circuit of `cells` cortex cells on `graph` with `per_cell` inputs
/// each, spread over all sections, plus one virtual cell.
fn circuit(dir: &Path, graph: &MorphologyGraph, cells: u64, per_cell: usize) -> MemoryCircuit {
    let morph = dir.join("components/morphologies");
    let bio = dir.join("components/biophysical_neuron_models");
    fs::create_dir_all(&morph).unwrap();
    fs::create_dir_all(&bio).unwrap();
    graph.write_swc(&morph.join("pyr.swc")).unwrap();
    fs::write(bio.join("Pyr.hoc"), HOC).unwrap();

    let mut circuit = MemoryCircuit::new(&morph, &bio);
    let sections = graph.sonata_section_count() as i64;
    let mut table = EdgeTable::new("lgn", "cortex");
    for id in 0..cells {
        circuit.add_node("cortex", id, node("pyr"));
        for k in 0..per_cell {
            let pos = 0.1 + 0.8 * (k as f64 / per_cell as f64);
            table.push(k as u64, id, edge_row(k as i64 % sections, pos));
        }
    }
    let mut virtual_cell = Map::new();
    virtual_cell.insert("model_type".to_string(), Attribute::String("virtual".into()));
    circuit.add_node("cortex", cells, virtual_cell);
    circuit.edges.insert("lgn_to_cortex".into(), table);
    circuit
}

fn output_of(input: &MemoryCircuit, dir: &Path) -> MemoryCircuit {
    let mut output = input.clone();
    output.morphologies_dir = dir.join("out/morphologies");
    output.biophysics_dir = dir.join("out/biophys");
    output
}

#[test]
fn collapsing_reduction_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = circuit(dir.path(), &branching(), 2, 12);
    let mut output = output_of(&input, dir.path());
    let staging = tempfile::tempdir().unwrap();
    let options = ReductionOptions::default();
    let collapse = Collapse::default();
    let reducer = NodeReducer {
        store: &input,
        simulator: &BuiltinSimulator,
        reductor: &collapse,
        options: &options,
        biophys_name: None,
    };
    let summary = reduce_population(
        &input,
        &mut output,
        "cortex",
        &reducer,
        staging.path(),
        &DriverOptions {
            jobs: Some(2),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(summary.skipped, vec![2]);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.reduced.len(), 2);
    for report in &summary.reduced {
        assert_eq!(report.sections_before, 10);
        assert_eq!(report.sections_after, 4);
        assert_eq!(report.edges_after, 12);

        let node = output.node("cortex", report.node_id).unwrap();
        let expected = format!("pyr_{}", report.node_id);
        assert_eq!(node.morphology(), Some(expected.as_str()));
        assert_eq!(node.model_template(), Some(format!("hoc:Pyr_{}", report.node_id).as_str()));
        assert!(output.morphologies_dir.join(format!("{expected}.swc")).is_file());
        assert!(output.biophysics_dir.join(format!("Pyr_{}.hoc", report.node_id)).is_file());

        let reread = MorphologyGraph::read_swc(&output.morphologies_dir.join(format!("{expected}.swc"))).unwrap();
        assert_eq!(reread.sonata_section_count(), 4);
        assert_eq!(reread.soma.points, vec![[0.0, 0.0, 0.0]]);

        let edges = output.afferent_edges("cortex", report.node_id).unwrap();
        assert_eq!(edges.len(), 12);
        for edge in edges {
            let id = edge.get_i64(SECTION_ID).unwrap();
            assert!((0..4).contains(&id), "section {id} out of range");
            assert!(edge.get_i64(SEGMENT_ID).is_some());
            assert!(edge.get_f64(SEGMENT_OFFSET).unwrap() >= 0.0);
        }
    }
    // the input circuit is read only
    assert_eq!(input.node("cortex", 0).unwrap().morphology(), Some("pyr"));
}

#[test]
fn rebuilt_cells_must_carry_connections_over_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = circuit(dir.path(), &branching(), 1, 3);
    let options = ReductionOptions::default();
    let cases = [
        (Collapse { reverse: true, fresh: false }, "reversed"),
        (Collapse { reverse: false, fresh: true }, "fresh"),
        (Collapse { reverse: true, fresh: true }, "reversed-fresh"),
    ];
    for (reductor, name) in &cases {
        let reducer = NodeReducer {
            store: &input,
            simulator: &BuiltinSimulator,
            reductor,
            options: &options,
            biophys_name: None,
        };
        let out = dir.path().join(name);
        let err = reducer.reduce("cortex", 0, &out).unwrap_err();
        assert!(
            matches!(err, NodeError::ReductionContractViolation { index: 0, .. }),
            "{name}: {err}"
        );
        assert!(!out.exists());
    }
}

#[test]
fn identity_reduction_keeps_edges_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let graph = unbranched();
    let mut input = circuit(dir.path(), &graph, 1, 10);
    // give every row the segment columns its position implies
    for row in &mut input.edges.get_mut("lgn_to_cortex").unwrap().rows {
        let id = row[SECTION_ID].as_i64().unwrap();
        let pos = row[SECTION_POS].as_f64().unwrap();
        let points = if id == 0 {
            graph.soma.points.clone()
        } else {
            graph.section(id as usize - 1).unwrap().points.clone()
        };
        let (segment, offset) = segment_offset(&points, pos);
        row.insert(SEGMENT_ID.to_string(), Attribute::Int(segment as i64));
        row.insert(SEGMENT_OFFSET.to_string(), Attribute::Float(offset));
    }
    let before = input.afferent_edges("cortex", 0).unwrap();

    let options = ReductionOptions::default();
    let reducer = NodeReducer {
        store: &input,
        simulator: &BuiltinSimulator,
        reductor: &IdentityReductor,
        options: &options,
        biophys_name: Some("Dry"),
    };
    let out = dir.path().join("staged");
    let report = reducer.reduce("cortex", 0, &out).unwrap();
    assert_eq!(report.sections_before, report.sections_after);
    assert_eq!(report.biophysics, "Dry_0.hoc");

    let rd = fs::File::open(out.join(EDGES_DIR).join("lgn_to_cortex.json")).unwrap();
    let staged: EdgeColumns = serde_json::from_reader(rd).unwrap();
    let after = staged.into_rows("lgn_to_cortex").unwrap();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(b.edge_id, a.edge_id);
        assert_eq!(b.get_i64(SECTION_ID), a.get_i64(SECTION_ID));
        assert_eq!(b.get_i64(SEGMENT_ID), a.get_i64(SEGMENT_ID));
        for column in [SECTION_POS, SEGMENT_OFFSET] {
            let (x, y) = (b.get_f64(column).unwrap(), a.get_f64(column).unwrap());
            assert!((x - y).abs() < 1e-9, "{column}: {x} ./. {y}");
        }
    }
}

#[test]
fn failing_reductions_abort_the_population() {
    let dir = tempfile::tempdir().unwrap();
    let input = circuit(dir.path(), &branching(), 9, 3);
    let mut output = output_of(&input, dir.path());
    let staging = tempfile::tempdir().unwrap();
    let options = ReductionOptions::default();
    let reducer = NodeReducer {
        store: &input,
        simulator: &BuiltinSimulator,
        reductor: &Broken,
        options: &options,
        biophys_name: None,
    };
    let err = reduce_population(
        &input,
        &mut output,
        "cortex",
        &reducer,
        staging.path(),
        &DriverOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ReductionError::FailureBudgetExhausted { budget: 5, .. }
    ));
    assert!(!output.morphologies_dir.exists());
    assert_eq!(output.node("cortex", 0).unwrap().morphology(), Some("pyr"));
}
