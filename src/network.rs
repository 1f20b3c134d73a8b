//! Fan out node reductions over populations and merge the results.
//!
//! Workers only ever read the input circuit and write their own staging
//! directory. The output circuit is touched after all workers of a
//! population have returned, from a single thread.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    circuit::{CircuitStore, CircuitWriter, EdgeColumns},
    err::{anyhow, Context, NodeError, NodeResult, ReductionError, Result},
    node::{
        partial_dir, read_staged_node, read_staged_report, NodeReducer, NodeReport, BIOPHYS_DIR, EDGES_DIR,
        MORPHOLOGY_DIR,
    },
    raw::CircuitConfig,
    reductor::ReductionOptions,
};

pub const FAILURE_BUDGET: usize = 5;
pub const NODE_TIMEOUT: Duration = Duration::from_secs(3600);
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverOptions {
    /// worker count, `None` for one per core
    pub jobs: Option<usize>,
    pub timeout: Duration,
    /// node failures tolerated per population
    pub failure_budget: usize,
    pub validate: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            jobs: None,
            timeout: NODE_TIMEOUT,
            failure_budget: FAILURE_BUDGET,
            validate: false,
        }
    }
}

/// Reduces one node into `out`. Calls for different nodes may run
/// concurrently.
pub trait NodeWorker: Sync {
    fn reduce(&self, population: &str, node_id: u64, out: &Path) -> NodeResult<NodeReport>;
}

/// Reduces in the calling process. Only sound for cable substrates without
/// process wide state, like the builtin one.
impl NodeWorker for NodeReducer<'_> {
    fn reduce(&self, population: &str, node_id: u64, out: &Path) -> NodeResult<NodeReport> {
        NodeReducer::reduce(self, population, node_id, out)
    }
}

/// Runs every node in a fresh `<program> node ...` process, optionally
/// through a launcher such as `srun`.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    pub launcher: Vec<String>,
    pub program: PathBuf,
    pub config: PathBuf,
    /// reduction flags passed on to the `node` command
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ProcessWorker {
    pub fn new(config: &Path, options: &ReductionOptions, timeout: Duration) -> Result<Self> {
        let program = std::env::current_exe().context("Locating the running executable")?;
        let mut args = vec![
            "--reduction-frequency".to_string(),
            options.reduction_frequency.to_string(),
            "--mapping".to_string(),
            serde_json::to_value(options.mapping)?
                .as_str()
                .unwrap_or("section")
                .to_string(),
        ];
        if let Some(total) = options.total_segments_manual {
            args.push("--total-segments-manual".into());
            args.push(total.to_string());
        }
        Ok(Self {
            launcher: Vec::new(),
            program,
            config: config.to_path_buf(),
            args,
            timeout,
        })
    }
}

impl NodeWorker for ProcessWorker {
    fn reduce(&self, population: &str, node_id: u64, out: &Path) -> NodeResult<NodeReport> {
        let mut command = match self.launcher.split_first() {
            Some((launcher, args)) => {
                let mut command = Command::new(launcher);
                command.args(args).arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        let mut child = command
            .arg("node")
            .arg(&self.config)
            .args(["--population", population, "--node-id", &node_id.to_string()])
            .arg("--output")
            .arg(out)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Starting worker for {population}[{node_id}]"))?;
        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() > self.timeout {
                child.kill()?;
                child.wait()?;
                discard_partial(out);
                return Err(NodeError::Timeout {
                    node_id,
                    timeout: self.timeout,
                });
            }
            thread::sleep(POLL);
        };
        if !status.success() {
            discard_partial(out);
            return Err(NodeError::Worker {
                node_id,
                message: format!("exited with {status}"),
            });
        }
        read_staged_report(out)
    }
}

/// Remove what a killed or crashed worker left in staging.
fn discard_partial(out: &Path) {
    let partial = partial_dir(out);
    if partial.exists() {
        if let Err(e) = fs::remove_dir_all(&partial) {
            warn!("Could not clear {partial:?}: {e}");
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopulationSummary {
    pub population: String,
    pub reduced: Vec<NodeReport>,
    pub skipped: Vec<u64>,
    pub failed: Vec<u64>,
    pub warnings: Vec<String>,
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_err() {
        fs::copy(from, to).with_context(|| format!("Copying {from:?} to {to:?}"))?;
        fs::remove_file(from).with_context(|| format!("Removing {from:?}"))?;
    }
    Ok(())
}

fn files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Listing {dir:?}"))? {
        let path = entry?.path();
        if path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Apply the staged results of one node to `output`.
pub fn merge_node(output: &mut dyn CircuitWriter, staged: &Path, node_id: u64) -> Result<()> {
    let node = read_staged_node(staged, node_id)?;
    output.write_node(&node)?;
    for path in files(&staged.join(EDGES_DIR))? {
        let population = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("Odd staged edge file {path:?}"))?;
        let rd = fs::File::open(&path).with_context(|| format!("Opening {path:?}"))?;
        let columns: EdgeColumns = serde_json::from_reader(rd)?;
        output.write_edges(population, &columns.into_rows(population)?)?;
    }
    for (sub, target) in [
        (MORPHOLOGY_DIR, output.morphologies_dir()?),
        (BIOPHYS_DIR, output.biophysics_dir()?),
    ] {
        fs::create_dir_all(&target).with_context(|| format!("Creating {target:?}"))?;
        for path in files(&staged.join(sub))? {
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("Odd staged file {path:?}"))?;
            move_file(&path, &target.join(name))?;
        }
    }
    Ok(())
}

/// Reduce every eligible node of `population`, staging below `staging`,
/// then merge into `output`.
pub fn reduce_population(
    input: &dyn CircuitStore,
    output: &mut dyn CircuitWriter,
    population: &str,
    worker: &dyn NodeWorker,
    staging: &Path,
    options: &DriverOptions,
) -> std::result::Result<PopulationSummary, ReductionError> {
    let mut summary = PopulationSummary {
        population: population.to_string(),
        ..Default::default()
    };
    let mut eligible = Vec::new();
    for node_id in input.node_ids(population)? {
        if input.node(population, node_id)?.is_reducible() {
            eligible.push(node_id);
        } else {
            let message = format!("{population}[{node_id}] has no biophysics, skipped");
            debug!("{message}");
            summary.warnings.push(message);
            summary.skipped.push(node_id);
        }
    }
    info!(
        "{population}: reducing {} of {} nodes",
        eligible.len(),
        eligible.len() + summary.skipped.len()
    );

    let dir = staging.join(population);
    fs::create_dir_all(&dir).with_context(|| format!("Creating {dir:?}"))?;
    let failures = AtomicUsize::new(0);
    let warnings = Mutex::new(Vec::new());
    let budget = options.failure_budget;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.unwrap_or(0))
        .build()
        .map_err(|e| anyhow!("Building worker pool: {e}"))?;
    let results = pool.install(|| {
        eligible
            .par_iter()
            .map(|node_id| {
                if failures.load(Ordering::SeqCst) >= budget {
                    return (*node_id, None);
                }
                match worker.reduce(population, *node_id, &dir.join(node_id.to_string())) {
                    Ok(report) => (*node_id, Some(report)),
                    Err(err) => {
                        let seen = failures.fetch_add(1, Ordering::SeqCst) + 1;
                        let message = format!("{population}[{node_id}] failed ({seen}/{budget}): {err}");
                        warn!("{message}");
                        warnings.lock().push(message);
                        (*node_id, None)
                    }
                }
            })
            .collect::<Vec<_>>()
    });
    summary.warnings.extend(warnings.into_inner());
    let failed = failures.into_inner();
    if failed >= budget && failed > 0 {
        return Err(ReductionError::FailureBudgetExhausted {
            population: population.to_string(),
            failures: failed,
            budget,
        });
    }

    for (node_id, report) in results {
        let Some(report) = report else {
            summary.failed.push(node_id);
            continue;
        };
        merge_node(output, &dir.join(node_id.to_string()), node_id)
            .with_context(|| format!("Merging {population}[{node_id}]"))?;
        summary
            .warnings
            .extend(report.warnings.iter().map(|w| format!("{population}[{node_id}]: {w}")));
        summary.reduced.push(report);
    }
    info!(
        "{population}: {} reduced, {} skipped, {} failed",
        summary.reduced.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(summary)
}

fn copy_tree(from: &Path, to: &Path, exclude: &[PathBuf]) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("Creating {to:?}"))?;
    for entry in fs::read_dir(from).with_context(|| format!("Listing {from:?}"))? {
        let path = entry?.path();
        let real = path.canonicalize().unwrap_or_else(|_| path.clone());
        if exclude.contains(&real) {
            debug!("Not copying {path:?}");
            continue;
        }
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("Odd path {path:?}"))?;
        if path.is_dir() {
            copy_tree(&path, &to.join(name), exclude)?;
        } else {
            fs::copy(&path, to.join(name)).with_context(|| format!("Copying {path:?}"))?;
        }
    }
    Ok(())
}

/// Copy the circuit of `config` to `out`, without morphologies and
/// biophysics, and return the path of the copied configuration.
pub fn prepare_output(
    config: &CircuitConfig,
    out: &Path,
    validate: bool,
) -> std::result::Result<PathBuf, ReductionError> {
    if validate {
        config
            .validate()
            .map_err(|e| ReductionError::InvalidCircuit(format!("{e:#}")))?;
    }
    if out.exists() {
        return Err(ReductionError::OutputExists(out.display().to_string()));
    }
    let assets = [config.morphologies_dir()?, config.biophysics_dir()?];
    let exclude = assets
        .iter()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
        .collect::<Vec<_>>();
    copy_tree(config.base_dir()?, out, &exclude)?;
    for asset in &assets {
        let target = config.relocate(asset, out)?;
        fs::create_dir_all(&target).with_context(|| format!("Creating {target:?}"))?;
    }
    Ok(config.relocate(&config.path, out)?)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub populations: Vec<PopulationSummary>,
}

impl NetworkSummary {
    pub fn warnings(&self) -> impl Iterator<Item = &String> {
        self.populations.iter().flat_map(|p| p.warnings.iter())
    }
}

/// Reduce all populations of `input` into `output`, which must already hold
/// a copy of the circuit.
pub fn reduce_populations(
    input: &dyn CircuitStore,
    output: &mut dyn CircuitWriter,
    worker: &dyn NodeWorker,
    staging: &Path,
    options: &DriverOptions,
) -> std::result::Result<NetworkSummary, ReductionError> {
    let mut summary = NetworkSummary::default();
    for population in input.node_populations()? {
        summary.populations.push(reduce_population(
            input,
            output,
            &population,
            worker,
            staging,
            options,
        )?);
    }
    Ok(summary)
}

/// Reduce the whole circuit of `config` into a new circuit at `out`.
#[cfg(feature = "hdf5")]
pub fn reduce_network(
    config: &Path,
    out: &Path,
    worker: &dyn NodeWorker,
    options: &DriverOptions,
) -> std::result::Result<NetworkSummary, ReductionError> {
    use crate::circuit::h5::H5Circuit;

    let input = H5Circuit::open(config)?;
    let out_config = prepare_output(input.config(), out, options.validate)?;
    let mut output = H5Circuit::open(&out_config)?;
    let staging = tempfile::Builder::new()
        .prefix(".staging")
        .tempdir_in(out)
        .with_context(|| format!("Creating staging directory in {out:?}"))?;
    info!("Reducing {config:?} into {out:?}");
    reduce_populations(&input, &mut output, worker, staging.path(), options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Attribute, MemoryCircuit};

    struct Failing;

    impl NodeWorker for Failing {
        fn reduce(&self, _: &str, node_id: u64, _: &Path) -> NodeResult<NodeReport> {
            Err(NodeError::Worker {
                node_id,
                message: "boom".into(),
            })
        }
    }

    fn circuit(n: u64) -> MemoryCircuit {
        let mut circuit = MemoryCircuit::default();
        for id in 0..n {
            let mut attrs = crate::Map::new();
            attrs.insert("model_type".to_string(), Attribute::String("biophysical".into()));
            circuit.add_node("cortex", id, attrs);
        }
        circuit.add_node("lgn", 0, Default::default());
        circuit
    }

    #[test]
    fn exhausted_budget_aborts_before_merging() {
        let input = circuit(9);
        let mut output = input.clone();
        let staging = tempfile::tempdir().unwrap();
        let err = reduce_population(
            &input,
            &mut output,
            "cortex",
            &Failing,
            staging.path(),
            &DriverOptions {
                jobs: Some(2),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReductionError::FailureBudgetExhausted { budget: 5, .. }
        ));
    }

    #[test]
    fn ineligible_nodes_are_skipped() {
        let input = circuit(0);
        let mut output = input.clone();
        let staging = tempfile::tempdir().unwrap();
        let summary = reduce_population(
            &input,
            &mut output,
            "lgn",
            &Failing,
            staging.path(),
            &DriverOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.skipped, vec![0]);
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.reduced.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn slow_worker_processes_are_killed() {
        let dir = tempfile::tempdir().unwrap();
        // $9 is the --output argument
        let script = dir.path().join("worker.sh");
        fs::write(&script, "mkdir -p \"$9.partial\"\nexec sleep 30\n").unwrap();
        let worker = ProcessWorker {
            launcher: vec!["sh".to_string(), script.display().to_string()],
            program: PathBuf::from("sonata-reduce"),
            config: dir.path().join("circuit_config.json"),
            args: Vec::new(),
            timeout: Duration::from_millis(500),
        };
        let input = circuit(1);
        let mut output = input.clone();
        let staging = dir.path().join("staging");
        let started = Instant::now();
        let summary = reduce_population(
            &input,
            &mut output,
            "cortex",
            &worker,
            &staging,
            &DriverOptions {
                jobs: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(summary.failed, vec![0]);
        assert!(summary.reduced.is_empty());
        assert!(summary.warnings.iter().any(|w| w.contains("timed out")));
        let out = staging.join("cortex").join("0");
        assert!(!out.exists());
        assert!(!partial_dir(&out).exists());
    }

    #[test]
    fn output_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("circuit").join("circuit_config.json");
        fs::create_dir_all(dir.path().join("circuit/morphologies")).unwrap();
        fs::create_dir_all(dir.path().join("circuit/biophys")).unwrap();
        fs::create_dir_all(dir.path().join("circuit/network")).unwrap();
        fs::write(dir.path().join("circuit/morphologies/a.swc"), "").unwrap();
        fs::write(dir.path().join("circuit/network/nodes.h5"), "").unwrap();
        fs::write(
            &cfg,
            r#"{"components": {"morphologies_dir": "./morphologies",
                               "biophysical_neuron_models_dir": "./biophys"},
                "networks": {"nodes": [{"nodes_file": "./network/nodes.h5"}]}}"#,
        )
        .unwrap();
        let config = CircuitConfig::from_file(&cfg).unwrap();
        let out = dir.path().join("reduced");
        let copied = prepare_output(&config, &out, true).unwrap();
        assert_eq!(copied, out.join("circuit_config.json"));
        assert!(out.join("network/nodes.h5").is_file());
        assert!(out.join("morphologies").is_dir());
        assert!(!out.join("morphologies/a.swc").exists());
        assert!(matches!(
            prepare_output(&config, &out, false),
            Err(ReductionError::OutputExists(_))
        ));
    }
}
