// Command-line runner: grows chains by extraction from a directory of labeled images,
// trains the reference classifier on their outputs and prints the scores.
//
// The directory layout is one sub-directory per category:
//   shapes/circle/*.png
//   shapes/square/*.png

use anyhow::{Context, Result, bail};
use chain_vision::classifier_job::{JobSpec, ScoreRecord, Tally};
use chain_vision::core_modules::extraction::grow_by_extraction;
use chain_vision::core_modules::feature_map::feature_map::{FeatureMap, Size};
use chain_vision::core_modules::image_cache::CacheGeneration;
use chain_vision::core_modules::image_repository::{Image, ImageRepository};
use chain_vision::core_modules::loader::{FileImageLoader, ImageLoader};
use chain_vision::core_modules::trainer::CentroidTrainer;
use chain_vision::core_modules::transform_chain::TransformChain;
use chain_vision::{ChainError, EngineConfig, JobSupervisor, PipelineOrchestrator};
use clap::Parser;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp"];
const CHAIN_ATTEMPTS_PER_CHAIN: usize = 10;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory with one sub-directory of images per category
    images: PathBuf,

    /// Number of chains to grow
    #[arg(long, default_value_t = 4)]
    chains: usize,

    /// Extracted operators per chain
    #[arg(long, default_value_t = 1)]
    depth: usize,

    /// Edge length of the square base size chains start from
    #[arg(long, default_value_t = 32)]
    base_size: u32,

    /// Edge length of the square canonical output size
    #[arg(long)]
    canonical_size: Option<u32>,

    /// Training images drawn per category
    #[arg(long)]
    train_per_category: Option<usize>,

    /// Trainer time budget in seconds
    #[arg(long)]
    max_seconds: Option<f64>,

    /// Take absolute values of chain outputs
    #[arg(long)]
    positive_only: bool,

    /// Leave the raw resized image out of the feature vectors
    #[arg(long)]
    no_raw: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// JSON config file; CHAIN_VISION_* environment variables are used otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the score record as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::from_env(),
    };
    if let Some(edge) = args.canonical_size {
        config.canonical_size = Size::square(edge.max(1));
    }
    if let Some(n) = args.train_per_category {
        config.train_per_category = n;
    }
    if let Some(seconds) = args.max_seconds {
        config.max_seconds = seconds;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.positive_only |= args.positive_only;
    config.include_raw &= !args.no_raw;
    info!("Engine config: {:?}", config);

    let repository = scan_categories(&args.images)?;
    if repository.is_empty() {
        bail!("no images found under {}", args.images.display());
    }
    info!(
        "Loaded {} images in {} categories",
        repository.len(),
        repository.categories().len()
    );

    let loader: Arc<dyn ImageLoader> = Arc::new(FileImageLoader::default());
    let orchestrator = Arc::new(PipelineOrchestrator::new(loader.clone(), config.worker_count));
    let images = repository.to_vec();

    let base_size = Size::square(args.base_size.max(1));
    let generation = orchestrator
        .cache()
        .ensure(&images, &BTreeSet::from([base_size]), loader)
        .await;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let sources = extraction_sources(&generation, &images, base_size);
    info!("{} of {} images usable as extraction sources", sources.len(), images.len());
    let chains = grow_chains(&sources, args.chains, args.depth, &config, &mut rng);
    if chains.is_empty() && !config.include_raw {
        bail!("no chains could be grown and the raw slot is disabled");
    }
    info!("Grew {} chains", chains.len());

    let mut supervisor = JobSupervisor::new(orchestrator, Arc::new(CentroidTrainer));
    let spec = JobSpec::from_config("cli", images, chains, &config);
    supervisor.submit(spec);

    let mut states = supervisor
        .subscribe("cli")
        .context("job vanished right after submission")?;
    loop {
        let state = states.borrow_and_update().clone();
        println!("job: {state}");
        if state.is_terminal() || states.changed().await.is_err() {
            break;
        }
    }

    let report = supervisor
        .take("cli")
        .context("job vanished before it finished")?
        .wait()
        .await;
    println!("final state: {}", report.state);
    if let Some(score) = &report.score {
        if args.json {
            println!("{}", serde_json::to_string_pretty(score)?);
        } else {
            print_scores(score);
        }
    }
    Ok(())
}

fn scan_categories(root: &Path) -> Result<ImageRepository> {
    let mut repository = ImageRepository::new();
    let mut categories: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    categories.sort();

    for dir in categories {
        let Some(label) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        files.sort();
        for file in files {
            repository.add(label.clone(), file);
        }
    }
    Ok(repository)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Base maps of every image that decoded at `base_size`.
fn extraction_sources(generation: &CacheGeneration, images: &[Image], base_size: Size) -> Vec<Arc<FeatureMap>> {
    images
        .iter()
        .filter_map(|image| generation.get(image.id(), base_size).cloned())
        .collect()
}

/// Grows up to `count` chains of `depth` extracted operators each, drawing source
/// maps at random. Recoverable failures are retried with another source.
fn grow_chains(
    sources: &[Arc<FeatureMap>],
    count: usize,
    depth: usize,
    config: &EngineConfig,
    rng: &mut StdRng,
) -> Vec<Arc<TransformChain>> {
    if sources.is_empty() {
        warn!("no decoded images to extract chains from");
        return Vec::new();
    }
    let mut chains = Vec::with_capacity(count);
    for index in 0..count {
        let mut grown = None;
        for _ in 0..CHAIN_ATTEMPTS_PER_CHAIN {
            match grow_one(sources, depth, config, rng) {
                Ok(chain) => {
                    grown = Some(chain);
                    break;
                }
                Err(e @ (ChainError::ChainTooSmall { .. } | ChainError::DegenerateExtract { .. })) => {
                    info!("chain {} attempt failed: {}", index, e);
                }
                Err(e) => {
                    warn!("chain {} abandoned: {}", index, e);
                    break;
                }
            }
        }
        match grown {
            Some(chain) => chains.push(Arc::new(chain)),
            None => warn!("could not grow chain {}", index),
        }
    }
    chains
}

/// One chain of at least one operator. `sources` must not be empty.
fn grow_one(
    sources: &[Arc<FeatureMap>],
    depth: usize,
    config: &EngineConfig,
    rng: &mut StdRng,
) -> Result<TransformChain, ChainError> {
    let source = &sources[rng.gen_range(0..sources.len())];
    let mut chain = grow_by_extraction(None, source, &config.extraction, rng)?;
    for _ in 1..depth {
        let source = &sources[rng.gen_range(0..sources.len())];
        chain = grow_by_extraction(Some(&chain), source, &config.extraction, rng)?;
    }
    Ok(chain)
}

fn print_scores(score: &ScoreRecord) {
    let row = |name: &str, tally: &Tally| {
        println!(
            "  {:<12} n={:<4} avg distance={:.4} accuracy={:.1}%",
            name,
            tally.count,
            tally.average(),
            tally.accuracy() * 100.0
        );
    };
    for category in &score.categories {
        println!("{}:", category.category);
        row("all", &category.scores.all);
        row("trained", &category.scores.trained);
        row("untrained", &category.scores.untrained);
    }
    println!("total:");
    row("all", &score.total.all);
    row("trained", &score.total.trained);
    row("untrained", &score.total.untrained);
}
