use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use fade_config::{ConfigLayering, LayeredConfig};
use fade_hpo::{LoggingTracker, Objective, ReplayTrial, Strategy, Study};
use fade_nn::{Module, TinyLm, TinyLmConfig, TokenDataset, TokenLoss};
use fade_unlearn::{
    compute_circuit, repro, Circuit, CircuitTransform, SearchSpaceConfig, TrialData,
    TrialOrchestrator, TrialReport, UnlearnConfig, UnlearnResult,
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Gradient-masked unlearning searches over small language models"
)]
struct Cli {
    /// Base configuration (TOML)
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Run-level override merged over the base configuration (JSON)
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    run: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) a hyperparameter search
    Search(SearchArgs),

    /// Re-run one recorded configuration offline
    Replay(ReplayArgs),

    /// Derive a circuit from forget batches
    Circuit(CircuitArgs),

    /// Print the summary of a study store
    Summary(SummaryArgs),
}

#[derive(Args)]
struct DataArgs {
    /// Directory holding forget_train.json, retain_train.json, forget_val.json
    /// and retain_val.json
    #[arg(long, value_hint = ValueHint::DirPath)]
    data: PathBuf,

    /// Starting checkpoint; a freshly initialised model is used otherwise
    #[arg(long, value_hint = ValueHint::FilePath)]
    model: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Random,
    Bayesian,
    Population,
}

#[derive(Args)]
struct SearchArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Circuit file (.json or bincode)
    #[arg(long, value_hint = ValueHint::FilePath)]
    circuit: PathBuf,

    /// Study store, created if missing
    #[arg(long, value_hint = ValueHint::FilePath)]
    study: PathBuf,

    /// Study name recorded in the store
    #[arg(long, default_value = "unlearning")]
    name: String,

    /// Directory receiving the best model
    #[arg(long, value_hint = ValueHint::DirPath)]
    out: PathBuf,

    #[arg(long, default_value_t = 1000)]
    trials: usize,

    #[arg(long, value_enum, default_value_t = StrategyArg::Random)]
    strategy: StrategyArg,

    #[arg(long, default_value_t = 0)]
    sampler_seed: u64,

    /// Where dated config snapshots are written
    #[arg(long, default_value = "results", value_hint = ValueHint::DirPath)]
    results: PathBuf,
}

#[derive(Args)]
struct ReplayArgs {
    #[command(flatten)]
    data: DataArgs,

    #[arg(long, value_hint = ValueHint::FilePath)]
    circuit: PathBuf,

    /// Flat JSON object of knob values
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: PathBuf,

    /// Optional destination for the unlearned model
    #[arg(long, value_hint = ValueHint::FilePath)]
    save: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransformArg {
    Identity,
    Abs,
    NegAbs,
    ReciprocalAbs,
}

#[derive(Args)]
struct CircuitArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Number of forget batches averaged
    #[arg(long, default_value_t = 32)]
    batches: usize,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long, value_enum, default_value_t = TransformArg::Identity)]
    transform: TransformArg,

    /// Floor used by the reciprocal transform
    #[arg(long, default_value_t = 1e-6)]
    floor: f32,

    /// Zero this fraction of the smallest entries of every parameter
    #[arg(long)]
    sparsify: Option<f64>,

    #[arg(long, value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Args)]
struct SummaryArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    study: PathBuf,
}

/// Everything a run reads from its configuration layers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    model: TinyLmConfig,
    unlearn: UnlearnConfig,
    space: SearchSpaceConfig,
}

fn main() {
    if let Err(err) = fade_config::tracing::init_tracing() {
        eprintln!("warning: tracing disabled: {err}");
    }
    let result = try_main();
    fade_config::tracing::flush_chrome_trace();
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Search(args) => run_search(&cli, args),
        Command::Replay(args) => run_replay(&cli, args),
        Command::Circuit(args) => run_circuit(&cli, args),
        Command::Summary(args) => run_summary(args),
    }
}

fn load_config(cli: &Cli) -> Result<RunConfig> {
    let mut layering = ConfigLayering::from_env();
    if let Some(path) = cli.config.as_ref() {
        layering = layering.with_base(path);
    }
    if let Some(path) = cli.run.as_ref() {
        layering = layering.with_run(path);
    }
    let layered = LayeredConfig::load(layering)?;
    for event in layered.events() {
        tracing::debug!(layer = ?event.layer, path = %event.path, "config override");
    }
    let config: RunConfig = layered.typed()?;
    config.unlearn.validate()?;
    Ok(config)
}

fn load_data(dir: &Path) -> Result<TrialData> {
    let split = |name: &str| -> Result<TokenDataset> {
        let path = dir.join(format!("{name}.json"));
        let dataset = TokenDataset::load_json(&path)?;
        if dataset.is_empty() {
            return Err(Box::new(io::Error::new(
                ErrorKind::InvalidData,
                format!("{} holds no sequences", path.display()),
            )));
        }
        Ok(dataset)
    };
    Ok(TrialData {
        forget_train: split("forget_train")?,
        retain_train: split("retain_train")?,
        forget_val: split("forget_val")?,
        retain_val: split("retain_val")?,
    })
}

fn model_factory(
    shape: TinyLmConfig,
    checkpoint: Option<PathBuf>,
) -> impl FnMut() -> UnlearnResult<TinyLm> {
    move || {
        let mut model = TinyLm::new(shape.clone())?;
        if let Some(path) = checkpoint.as_ref() {
            load_checkpoint(&mut model, path)?;
        }
        Ok(model)
    }
}

fn load_checkpoint(model: &mut TinyLm, path: &Path) -> fade_nn::PureResult<()> {
    if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        fade_nn::load_json(model, path)
    } else {
        fade_nn::load_bincode(model, path)
    }
}

fn run_search(cli: &Cli, args: &SearchArgs) -> Result<()> {
    let commit = repro::ensure_clean(".")?;
    let config = load_config(cli)?;
    if let Some(path) = cli.config.as_ref() {
        repro::snapshot_script(path, &args.results)?;
    }

    let strategy = match args.strategy {
        StrategyArg::Random => Strategy::random(args.sampler_seed),
        StrategyArg::Bayesian => Strategy::bayesian(args.sampler_seed, 0.2),
        StrategyArg::Population => Strategy::population(args.sampler_seed, 8, 0.25, 0.3),
    };
    let mut study = Study::load_or_create(
        &args.study,
        args.name.as_str(),
        Objective::Maximize,
        strategy,
        args.sampler_seed,
    )?
    .with_tracker(Box::new(LoggingTracker));
    repro::record_provenance(&mut study, &commit, &config.unlearn)?;

    let circuit = Circuit::load(&args.circuit)?;
    let data = load_data(&args.data.data)?;
    let factory = model_factory(config.model.clone(), args.data.model.clone());
    let mut orchestrator = TrialOrchestrator::new(
        factory,
        config.unlearn,
        config.space,
        circuit,
        data,
        study,
        &args.out,
    )?
    .with_release_cache(|| tracing::debug!("released trial caches"));
    orchestrator.run_search(args.trials)?;

    let summary = orchestrator.study().summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_replay(cli: &Cli, args: &ReplayArgs) -> Result<()> {
    let config = load_config(cli)?;
    let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&args.params)?)?;
    let trial = ReplayTrial::from_json(&raw)?;
    let circuit = Circuit::load(&args.circuit)?;
    let data = load_data(&args.data.data)?;
    let factory = model_factory(config.model.clone(), args.data.model.clone());
    // Replays never record, so the study stays in memory.
    let study = Study::new("replay", Objective::Maximize, Strategy::random(0), 0);
    let scratch = std::env::temp_dir();
    let mut orchestrator = TrialOrchestrator::new(
        factory,
        config.unlearn,
        config.space,
        circuit,
        data,
        study,
        scratch,
    )?;
    match orchestrator.replay(trial)? {
        TrialReport::Completed {
            fitness,
            model,
            relearn,
            ..
        } => {
            println!("fitness: {fitness}");
            println!("{}", serde_json::to_string_pretty(&relearn)?);
            if let Some(path) = args.save.as_ref() {
                fade_nn::save_bincode(&model, path)?;
            }
        }
        TrialReport::Pruned { reason, step, .. } => {
            println!("pruned at step {step}: {reason}");
        }
    }
    Ok(())
}

fn run_circuit(cli: &Cli, args: &CircuitArgs) -> Result<()> {
    let config = load_config(cli)?;
    let data = load_data(&args.data.data)?;
    let mut model = model_factory(config.model.clone(), args.data.model.clone())()?;
    let seed = fade_config::determinism::derive_seed(config.unlearn.seed, "circuit");
    let mut forget = data.forget_train.batches(args.batch_size, Some(seed))?;
    let mut circuit =
        compute_circuit(&mut model, &mut forget, args.batches, TokenLoss::CorrectLogit)?;
    let transform = match args.transform {
        TransformArg::Identity => CircuitTransform::Identity,
        TransformArg::Abs => CircuitTransform::Abs,
        TransformArg::NegAbs => CircuitTransform::NegAbs,
        TransformArg::ReciprocalAbs => CircuitTransform::ReciprocalAbs { floor: args.floor },
    };
    circuit = circuit.transform(transform);
    if let Some(quantile) = args.sparsify {
        circuit = circuit.sparsify_per_parameter(quantile)?;
    }
    circuit.save(&args.output)?;
    tracing::info!(
        entries = circuit.len(),
        parameters = model.parameter_names()?.len(),
        output = %args.output.display(),
        "circuit written"
    );
    Ok(())
}

fn run_summary(args: &SummaryArgs) -> Result<()> {
    let state = Study::read_state(&args.study)?;
    let summary = fade_hpo::TrialSummary::from_state(&state);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if let Some(commit) = state.user_attrs.get("commit_hash") {
        println!("commit: {commit}");
    }
    Ok(())
}
