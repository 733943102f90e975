use std::path::PathBuf;

use clap::Parser;
use humantime::Duration;

use crate::crash::CrashReport;
use crate::graph::GraphParams;
use crate::settings::Settings;
use crate::{checkpoint, fuzzer};

#[derive(Parser)]
#[clap(name = "topfuzz", about = "Directional gradient-guided coverage fuzzer")]
pub(crate) struct Opts {
    #[clap(subcommand)]
    subcmd: Subcommand,
}

#[derive(Parser)]
pub(crate) enum Subcommand {
    /// Fuzz a target under the instrumentation driver.
    Fuzz(FuzzOpts),
    /// Decode and print a crash record.
    ShowCrash { file: PathBuf },
    /// Decode and summarize a knowledge checkpoint.
    ShowKnowledge { file: PathBuf },
}

#[derive(Debug, Parser, Clone)]
pub(crate) struct FuzzOpts {
    /// Path to the target program.
    #[clap(long)]
    pub target: String,

    // Input size policy: thread t fuzzes inputs of clamp(min + t*step, min, max) bytes.
    #[clap(long)]
    pub min_length: u32,
    #[clap(long)]
    pub max_length: u32,
    #[clap(long)]
    pub step_length: u32,

    #[clap(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub thread_count: u32,
    #[clap(long, default_value = "100", value_parser = clap::value_parser!(u32).range(2..))]
    pub max_history_count: u32,

    /// Path to the tracer client library.
    #[clap(long, default_value = "./build/libtracer.so")]
    pub tracer: String,
    /// Path to the instrumentation driver.
    #[clap(long, default_value = "drrun")]
    pub driver: String,
    /// Directory for checkpoints and crash records.
    #[clap(long, default_value = "./fuzzer_output")]
    pub work_dir: String,
    /// Where the traced child's stdout/stderr go.
    #[clap(long, default_value = "/dev/null")]
    pub stdout_redirect: String,
    /// Directory of seed inputs to run before fuzzing starts.
    #[clap(long)]
    pub seed_path: Option<String>,

    #[clap(long, default_value = "2s")]
    pub status_interval: Duration,
    /// Seed for the graph's walk RNG (fixed default keeps restarts reproducible).
    #[clap(long)]
    pub rng_seed: Option<u64>,
}

impl FuzzOpts {
    fn to_settings(&self) -> Settings {
        Settings {
            min_length: self.min_length,
            max_length: self.max_length,
            step_length: self.step_length,
            thread_count: self.thread_count,
            max_history_count: self.max_history_count,
            target_program: self.target.clone(),
            tracer_lib: self.tracer.clone(),
            driver_path: self.driver.clone(),
            work_dir: self.work_dir.clone(),
            stdout_redirect: self.stdout_redirect.clone(),
            seed_path: self.seed_path.clone(),
        }
    }
}

pub(crate) fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    match opts.subcmd {
        Subcommand::Fuzz(opts) => {
            if opts.min_length == 0 || opts.max_length < opts.min_length {
                eprintln!("invalid input size policy: need 0 < min-length <= max-length");
                std::process::exit(2);
            }
            std::fs::create_dir_all(&opts.work_dir).expect("failed to create work directory");

            let mut graph_params = GraphParams::default();
            if let Some(seed) = opts.rng_seed {
                graph_params.rng_seed = seed;
            }
            fuzzer::fuzz(opts.to_settings(), graph_params, *opts.status_interval);
        }
        Subcommand::ShowCrash { file } => {
            let report = CrashReport::load(&file).expect("failed to read crash record");
            println!("signal:      {}", report.signal);
            println!(
                "endianness:  {}",
                if report.little_endian { "little" } else { "big" }
            );
            println!("target args: {:?}", report.target_args);
            println!("trace:       {} basic blocks", report.trace.len());
            println!(
                "graph:       {} nodes, {} embeddings",
                report.graph.nodes.len(),
                report.graph.embeddings.len()
            );
            println!("input:       {} bytes", report.input.len());
            for chunk in report.input.chunks(16) {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("  {}", hex.join(" "));
            }
        }
        Subcommand::ShowKnowledge { file } => {
            let checkpoint = checkpoint::load(&file).expect("failed to read checkpoint");
            let valid = checkpoint
                .history
                .iter()
                .filter(|slot| slot.is_valid())
                .count();
            println!("target:        {}", checkpoint.settings.target_program);
            println!(
                "history:       {valid}/{} slots, next write at {}",
                checkpoint.history.len(),
                checkpoint.history_index
            );
            println!(
                "graph:         {} nodes, {} embeddings (dim {})",
                checkpoint.graph.nodes.len(),
                checkpoint.graph.embeddings.len(),
                checkpoint.graph.params.dim
            );
            let edges: usize = checkpoint
                .graph
                .nodes
                .iter()
                .map(|(_, neighbors)| neighbors.len())
                .sum();
            println!("edges:         {edges}");
        }
    }
}
