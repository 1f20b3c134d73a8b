use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{self, Args, Parser, Subcommand};
use sonata_reduce::{
    circuit::h5::H5Circuit,
    err::{bail, Context, Result},
    network::{self, DriverOptions, NodeWorker, ProcessWorker},
    node::NodeReducer,
    reductor::{ExternalReductor, IdentityReductor, MappingMode, ReductionOptions, SubtreeReductor},
    simulator::BuiltinSimulator,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sonata-reduce", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args, Debug, Clone)]
struct ReduceArgs {
    /// Frequency [Hz] at which the transfer impedance is kept
    #[arg(long, default_value_t = 0.0)]
    reduction_frequency: f64,
    /// Total number of segments of the reduced cell; -1 picks by length
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    total_segments_manual: i64,
    #[arg(long, value_enum, default_value_t = MappingMode::Section)]
    mapping: MappingMode,
    /// Base name of the generated biophysics templates
    #[arg(long)]
    biophys_name: Option<String>,
    /// Reduction program, or `identity`
    #[arg(long, default_value = "identity")]
    reductor: String,
}

impl ReduceArgs {
    fn options(&self) -> ReductionOptions {
        ReductionOptions {
            reduction_frequency: self.reduction_frequency,
            total_segments_manual: usize::try_from(self.total_segments_manual).ok(),
            mapping: self.mapping,
        }
    }

    fn reductor(&self) -> Box<dyn SubtreeReductor> {
        if self.reductor == "identity" {
            Box::new(IdentityReductor)
        } else {
            Box::new(ExternalReductor::new(&self.reductor))
        }
    }

    /// Flags a `node` worker needs beyond the reduction options.
    fn worker_args(&self) -> Vec<String> {
        let mut args = vec!["--reductor".to_string(), self.reductor.clone()];
        if let Some(name) = &self.biophys_name {
            args.push("--biophys-name".into());
            args.push(name.clone());
        }
        args
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Reduce every biophysical node of a circuit into a new circuit
    Network {
        config: PathBuf,
        out: PathBuf,
        #[command(flatten)]
        reduce: ReduceArgs,
        /// Number of concurrent workers
        #[arg(long, short)]
        jobs: Option<usize>,
        /// Seconds a single node may take
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
        /// Node failures tolerated per population
        #[arg(long, default_value_t = network::FAILURE_BUDGET)]
        failure_budget: usize,
        /// Check the circuit before starting
        #[arg(long)]
        validate: bool,
        /// Reduce in worker threads instead of worker processes
        #[arg(long)]
        in_process: bool,
    },
    /// Reduce one node, staging the results in a directory
    Node {
        config: PathBuf,
        #[arg(long)]
        population: String,
        #[arg(long)]
        node_id: u64,
        #[arg(long)]
        output: PathBuf,
        #[command(flatten)]
        reduce: ReduceArgs,
    },
    /// Reduce one node and write it back into its circuit
    NodeInPlace {
        config: PathBuf,
        #[arg(long)]
        population: String,
        #[arg(long)]
        node_id: u64,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
        #[command(flatten)]
        reduce: ReduceArgs,
    },
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N] ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn reduce_node(
    circuit: &H5Circuit,
    population: &str,
    node_id: u64,
    out: &Path,
    reduce: &ReduceArgs,
) -> Result<()> {
    let options = reduce.options();
    let reductor = reduce.reductor();
    let reducer = NodeReducer {
        store: circuit,
        simulator: &BuiltinSimulator,
        reductor: reductor.as_ref(),
        options: &options,
        biophys_name: reduce.biophys_name.as_deref(),
    };
    let report = reducer.reduce(population, node_id, out)?;
    for warning in &report.warnings {
        warn!("{population}[{node_id}]: {warning}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.cmd {
        Cmd::Network {
            config,
            out,
            reduce,
            jobs,
            timeout,
            failure_budget,
            validate,
            in_process,
        } => {
            let driver = DriverOptions {
                jobs,
                timeout: Duration::from_secs(timeout),
                failure_budget,
                validate,
            };
            let options = reduce.options();
            let circuit;
            let reductor;
            let reducer;
            let process;
            let worker: &dyn NodeWorker = if in_process {
                circuit = H5Circuit::open(&config)?;
                reductor = reduce.reductor();
                reducer = NodeReducer {
                    store: &circuit,
                    simulator: &BuiltinSimulator,
                    reductor: reductor.as_ref(),
                    options: &options,
                    biophys_name: reduce.biophys_name.as_deref(),
                };
                &reducer
            } else {
                let mut worker = ProcessWorker::new(&config, &options, driver.timeout)?;
                worker.args.extend(reduce.worker_args());
                if cli.verbose > 0 {
                    worker.args.push(format!("-{}", "v".repeat(cli.verbose as usize)));
                }
                process = worker;
                &process
            };
            let summary = network::reduce_network(&config, &out, worker, &driver)
                .with_context(|| format!("Reducing {config:?}"))?;
            for population in &summary.populations {
                for id in &population.skipped {
                    warn!("{}[{id}] has no biophysics, skipped", population.population);
                }
                info!(
                    "{}: {} reduced, {} skipped, {} failed",
                    population.population,
                    population.reduced.len(),
                    population.skipped.len(),
                    population.failed.len()
                );
            }
        }
        Cmd::Node {
            config,
            population,
            node_id,
            output,
            reduce,
        } => {
            let circuit = H5Circuit::open(&config)?;
            reduce_node(&circuit, &population, node_id, &output, &reduce)
                .with_context(|| format!("Reducing {population}[{node_id}]"))?;
        }
        Cmd::NodeInPlace {
            config,
            population,
            node_id,
            yes,
            reduce,
        } => {
            if !yes && !confirm(&format!("Overwrite {population}[{node_id}] in {config:?}?"))? {
                bail!("Not confirmed, circuit left alone");
            }
            let mut circuit = H5Circuit::open(&config)?;
            let staging = tempfile::Builder::new()
                .prefix(".staging")
                .tempdir_in(circuit.config().base_dir()?)?;
            let out = staging.path().join(node_id.to_string());
            reduce_node(&circuit, &population, node_id, &out, &reduce)
                .with_context(|| format!("Reducing {population}[{node_id}]"))?;
            network::merge_node(&mut circuit, &out, node_id)
                .with_context(|| format!("Writing {population}[{node_id}] back"))?;
            info!("Reduced {population}[{node_id}] in place");
        }
    }
    Ok(())
}
