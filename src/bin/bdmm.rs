use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;

use bdmm_rs::io::model::{load_model, tree_name};
use bdmm_rs::progress;
use bdmm_rs::report::{EvaluationSummary, TreeReport, write_results_json, write_results_tsv};

#[derive(Parser, Debug)]
#[command(name = "bdmm")]
#[command(about = "Multi-type birth-death-migration tree likelihood", long_about = None)]
struct Cli {
    /// JSON model file (schedule, frequencies, config, trees); may be gzipped.
    input_file: PathBuf,
    #[arg(long, help = "Write per-tree results as TSV")]
    output: Option<PathBuf>,
    #[arg(long, help = "Write per-tree results as JSON")]
    json: Option<PathBuf>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long)]
    no_parallel: bool,
    #[arg(long)]
    no_progress: bool,
    #[arg(long)]
    rel_tol: Option<f64>,
    #[arg(long)]
    abs_tol: Option<f64>,
    #[arg(long, help = "Integrate numerically even for single-type models")]
    general_engine: bool,
    #[arg(long, help = "Condition on the root time instead of the origin")]
    condition_on_root: bool,
    #[arg(long, help = "Do not condition on at least one sampled descendant")]
    no_survival: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.threads == Some(0) {
        bail!("--threads must be >= 1");
    }
    let show_progress = !cli.no_progress;

    let pb = progress::spinner("IO", "Reading model", show_progress);
    let model = load_model(&cli.input_file)
        .with_context(|| format!("failed to read model {:?}", cli.input_file))?;
    let trees = model.trees()?;
    pb.finish_with_message(format!("Read {} trees", trees.len()));

    let mut config = model.config.clone();
    if let Some(n) = cli.threads {
        config.threads = Some(n);
    }
    if cli.no_parallel {
        config.parallelize = false;
    }
    if let Some(v) = cli.rel_tol {
        config.rel_tolerance = v;
    }
    if let Some(v) = cli.abs_tol {
        config.abs_tolerance = v;
    }
    if cli.general_engine {
        config.use_single_type_closed_form = false;
    }
    if cli.condition_on_root {
        config.condition_on_root = true;
    }
    if cli.no_survival {
        config.condition_on_survival = false;
    }

    let mut likelihood = model.likelihood(config)?;
    let engine = likelihood.engine();
    log::info!("scoring {} trees with the {engine:?} engine", trees.len());

    let pb = progress::bar(trees.len() as u64, "LL", "Scoring trees", show_progress);
    let mut reports = Vec::with_capacity(trees.len());
    for (i, tree) in trees.iter().enumerate() {
        let name = tree_name(&model.trees[i], i);
        let evaluation = likelihood
            .evaluate(tree)
            .with_context(|| format!("failed to evaluate {name}"))?;
        reports.push(TreeReport::new(name, &evaluation));
        pb.inc(1);
    }
    pb.finish_with_message("Scoring trees done");

    for r in &reports {
        match (r.log_likelihood, r.rejection) {
            (Some(ll), _) => println!("{}\t{}", r.tree, ll),
            (None, Some(reason)) => println!("{}\t-inf\t({reason})", r.tree),
            (None, None) => println!("{}\t-inf", r.tree),
        }
    }

    let summary = EvaluationSummary {
        type_names: likelihood.schedule().type_names().to_vec(),
        engine,
        trees: reports,
    };
    if let Some(path) = &cli.output {
        write_results_tsv(path, &summary)?;
        println!("Results TSV: {}", path.display());
    }
    if let Some(path) = &cli.json {
        write_results_json(path, &summary)?;
        println!("Results JSON: {}", path.display());
    }
    Ok(())
}
