use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use knn_crossval::{
    cross_validate, generate_labeled_points, CrossValidationConfig, CrossValidationRun,
    DataLoader, Dataset, DistanceMetric, ExecutionMode, KnnError, Record,
    Result as KnnResult,
};

#[derive(Parser, Debug)]
#[command(name = "knn-crossval")]
#[command(about = "k-NN classifier evaluated with stratified k-fold cross-validation", long_about = None)]
struct Args {
    /// Number of nearest neighbours taking part in each vote
    #[arg(short = 'k', long, default_value_t = 1)]
    neighbors: usize,

    /// Number of stratified folds
    #[arg(short, long, default_value_t = 10)]
    folds: usize,

    /// Distance metric: euclidean, manhattan or corrected-euclidean[:i,j,...]
    #[arg(short, long, value_parser = parse_metric, default_value = "euclidean")]
    metric: DistanceMetric,

    /// Feature indices kept by corrected-euclidean (comma separated)
    #[arg(long, value_delimiter = ',')]
    features: Option<Vec<usize>>,

    /// Classify held-out records sequentially or on the rayon pool
    #[arg(long, value_parser = parse_mode, default_value = "parallel")]
    mode: ExecutionMode,

    /// Input dataset (CSV or Parquet); the last column is the label
    #[arg(long)]
    input: Option<PathBuf>,

    /// Explicitly specify the input file format (default: auto-detect from extension)
    #[arg(long, value_enum)]
    format: Option<InputFormat>,

    /// Number of labels to generate when not using --input
    #[arg(long, default_value_t = 3)]
    labels: usize,

    /// Records generated per label when not using --input
    #[arg(long, default_value_t = 200)]
    points_per_label: usize,

    /// Dimensionality of generated records
    #[arg(short, long, default_value_t = 4)]
    dim: usize,

    /// Standard deviation of generated records around their label centre
    #[arg(long, default_value_t = 1.5)]
    spread: f64,

    /// RNG seed for generated data
    #[arg(long, default_value_t = 42u64)]
    seed: u64,

    /// Optional JSON summary of the run
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override Rayon global thread pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity: set RUST_LOG style level (info, debug, warn)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum InputFormat {
    Csv,
    Parquet,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(args) {
        error!(error = %err, "cross-validation run failed");
        process::exit(1);
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}

fn run(args: Args) -> KnnResult<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| {
                KnnError::InvalidConfig(format!("failed to configure rayon threadpool: {err}"))
            })?;
        info!(threads, "configured rayon global thread pool");
    }

    let records = load_records(&args)?;
    let dataset = Dataset::from_records(records)?;
    info!(
        unique = dataset.unique_count(),
        duplicates = dataset.duplicate_count(),
        labels = dataset.labels().count(),
        "loaded dataset"
    );

    let config = CrossValidationConfig {
        folds: args.folds,
        neighbors: args.neighbors,
        metric: resolve_metric(args.metric.clone(), args.features.clone()),
        mode: args.mode,
    };

    let start = Instant::now();
    let run = cross_validate(&dataset, &config)?;
    let elapsed = start.elapsed();
    info!(took_seconds = elapsed.as_secs_f64(), "elapsed wall time");
    info!(?run.fold_sizes, "fold sizes");

    println!("Confusion matrix ({}):", config.metric);
    println!("{}", run.matrix);

    if let Some(path) = args.output.as_ref() {
        write_summary(path, &args, &dataset, &config, &run, elapsed.as_secs_f64())?;
    }
    Ok(())
}

fn resolve_metric(metric: DistanceMetric, features: Option<Vec<usize>>) -> DistanceMetric {
    match (metric, features) {
        (DistanceMetric::CorrectedEuclidean { .. }, Some(features)) => {
            DistanceMetric::CorrectedEuclidean { features }
        }
        (metric, Some(_)) => {
            warn!(%metric, "ignoring --features because the metric uses every feature");
            metric
        }
        (metric, None) => metric,
    }
}

fn load_records(args: &Args) -> KnnResult<Vec<Record>> {
    if let Some(path) = args.input.as_deref() {
        let format_to_use = args
            .format
            .unwrap_or_else(|| infer_format(path).unwrap_or(InputFormat::Csv));
        info!(path = ?path, ?format_to_use, "loading input data");
        match format_to_use {
            InputFormat::Csv => DataLoader::load_csv(path),
            InputFormat::Parquet => DataLoader::load_parquet(path),
        }
    } else {
        if let Some(requested) = args.format {
            info!(
                ?requested,
                "ignoring --format because synthetic data will be generated"
            );
        }
        info!(
            labels = args.labels,
            per_label = args.points_per_label,
            dim = args.dim,
            spread = args.spread,
            "generating synthetic labelled data"
        );
        let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
        generate_labeled_points(
            args.labels,
            args.points_per_label,
            args.dim,
            args.spread,
            &mut rng,
        )
    }
}

fn infer_format(path: &Path) -> Option<InputFormat> {
    path.extension().and_then(|ext| ext.to_str()).map(|ext| {
        match ext.to_ascii_lowercase().as_str() {
            "parquet" | "pq" => InputFormat::Parquet,
            _ => InputFormat::Csv,
        }
    })
}

fn write_summary(
    path: &Path,
    args: &Args,
    dataset: &Dataset,
    config: &CrossValidationConfig,
    run: &CrossValidationRun,
    elapsed_secs: f64,
) -> KnnResult<()> {
    let dump = json!({
        "config": config,
        "metric": config.metric.to_string(),
        "unique_records": dataset.unique_count(),
        "duplicate_records": dataset.duplicate_count(),
        "label_counts": dataset
            .label_counts()
            .into_iter()
            .map(|(label, count)| json!({ "label": label, "count": count }))
            .collect::<Vec<_>>(),
        "fold_sizes": run.fold_sizes,
        "classified": run.classified,
        "labels": run.matrix.labels(),
        "confusion_matrix": run.matrix.rows(),
        "correct": run.matrix.correct(),
        "incorrect": run.matrix.incorrect(),
        "accuracy": run.matrix.accuracy(),
        "elapsed_seconds": elapsed_secs,
        "data_source": if let Some(input) = args.input.as_ref() {
            let fmt = args
                .format
                .or_else(|| infer_format(input))
                .unwrap_or(InputFormat::Csv);
            json!({
                "type": "file",
                "path": input.display().to_string(),
                "format": format!("{fmt:?}").to_lowercase(),
            })
        } else {
            json!({
                "type": "synthetic",
                "labels": args.labels,
                "points_per_label": args.points_per_label,
                "dim": args.dim,
                "spread": args.spread,
                "seed": args.seed,
            })
        },
    });

    std::fs::write(path, serde_json::to_string_pretty(&dump)?)?;
    info!(path = ?path, "wrote cross-validation summary");
    Ok(())
}

fn parse_metric(raw: &str) -> Result<DistanceMetric, String> {
    DistanceMetric::from_str(raw).map_err(|err| err.to_string())
}

fn parse_mode(raw: &str) -> Result<ExecutionMode, String> {
    ExecutionMode::from_str(raw).map_err(|err| err.to_string())
}
