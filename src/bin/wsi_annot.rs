use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use wsi_annotations::backend::{HttpTransport, RemoteDataClient};
use wsi_annotations::cache::{CachePort, FileCache, NoCache};
use wsi_annotations::config::{ConfigLoader, ResolvedConfig};
use wsi_annotations::datasets::{
    DatasetBuilder, binarize_cell_labels, binarize_wsi_labels, join_cells_with_wsi,
};
use wsi_annotations::error::AnnotError;
use wsi_annotations::export::write_csv;
use wsi_annotations::images::{self, measure_images};
use wsi_annotations::labels::normalize_wsi_labels;
use wsi_annotations::domain::WsiRecord;
use wsi_annotations::output::{
    CacheClearSummary, CutoutSummary, ExportSummary, JsonOutput, LogSink, NormalizeSummary,
    OutputMode,
};
use wsi_annotations::repository::DataRepository;

#[derive(Parser)]
#[command(name = "wsi-annot")]
#[command(about = "Build WSI and cell label tables from an annotation backend")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load the repository and write cell, WSI and combined CSV tables")]
    Export(ExportArgs),
    #[command(about = "Cut missing cell images out of their parent WSI images")]
    Cutout(SessionArgs),
    #[command(about = "Print the label set derived from a WSI filename")]
    Normalize(NormalizeArgs),
    #[command(about = "Manage the persistent request cache")]
    Cache(CacheArgs),
}

#[derive(Args, Clone)]
struct SessionArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    no_cache: bool,

    #[arg(long)]
    skip_image_download: bool,
}

#[derive(Args, Clone)]
struct ExportArgs {
    #[command(flatten)]
    session: SessionArgs,

    #[arg(long, help = "Directory for the CSV files (defaults to the data dir)")]
    out_dir: Option<String>,

    #[arg(long, default_value_t = 1, help = "Cell label id counted as the positive class")]
    cell_label: i64,

    #[arg(long, default_value = "m3", help = "WSI label counted as the positive class")]
    wsi_label: String,
}

#[derive(Args)]
struct NormalizeArgs {
    dataset_id: i64,
    img_name: String,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Remove every cached entry")]
    Clear {
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<AnnotError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AnnotError) -> u8 {
    match error {
        AnnotError::InvalidWsiName { .. }
        | AnnotError::MissingConfig
        | AnnotError::ConfigRead(_)
        | AnnotError::ConfigParse(_)
        | AnnotError::InvalidConfig(_)
        | AnnotError::UnknownLabel(_) => 2,
        AnnotError::BackendHttp(_)
        | AnnotError::BackendStatus { .. }
        | AnnotError::BackendParse { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Export(args) => run_export(args, output_mode),
        Commands::Cutout(args) => run_cutout(args, output_mode),
        Commands::Normalize(args) => run_normalize(args, output_mode),
        Commands::Cache(CacheArgs {
            command: CacheCommand::Clear { config },
        }) => run_cache_clear(config, output_mode),
    }
}

fn resolve(args: &SessionArgs) -> miette::Result<ResolvedConfig> {
    let mut resolved = ConfigLoader::resolve(args.config.as_deref())?;
    if args.skip_image_download {
        resolved.repository.skip_image_download = true;
    }
    Ok(resolved)
}

fn load_repository<C: CachePort>(
    resolved: &ResolvedConfig,
    cache: C,
) -> miette::Result<DataRepository> {
    let transport = HttpTransport::new(resolved.accept_invalid_certs)?;
    let client = RemoteDataClient::new(&resolved.repository.backend_url, transport, cache)
        .with_ttl(resolved.cache_ttl);
    let repo = DataRepository::load(resolved.repository.clone(), &client, &LogSink)?;
    Ok(repo)
}

fn run_export(args: ExportArgs, output_mode: OutputMode) -> miette::Result<()> {
    let resolved = resolve(&args.session)?;
    if args.session.no_cache {
        export_tables(&args, &resolved, NoCache, output_mode)
    } else {
        let cache = FileCache::new(resolved.cache_dir.clone());
        export_tables(&args, &resolved, &cache, output_mode)
    }
}

fn export_tables<C: CachePort + Copy>(
    args: &ExportArgs,
    resolved: &ResolvedConfig,
    cache: C,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let repo = load_repository(resolved, cache)?;
    let builder = DatasetBuilder::new(&repo, cache).with_ttl(resolved.cache_ttl);

    let cell_rows = builder.build_cell_label_table();
    let wsi_rows = builder.build_wsi_label_table()?;
    let cells = measure_images(binarize_cell_labels(&cell_rows, args.cell_label));
    let wsis = measure_images(binarize_wsi_labels(&wsi_rows, &args.wsi_label));
    let combined = join_cells_with_wsi(&cells, &wsis);

    let out_dir = args
        .out_dir
        .as_ref()
        .map(camino::Utf8PathBuf::from)
        .unwrap_or_else(|| resolved.data_dir.clone());
    let files = vec![
        out_dir.join("cell_df.csv"),
        out_dir.join("wsi_df.csv"),
        out_dir.join("combined_df.csv"),
    ];
    write_csv(&files[0], &cells)?;
    write_csv(&files[1], &wsis)?;
    write_csv(&files[2], &combined)?;

    let summary = ExportSummary {
        cell_rows: cells.len(),
        wsi_rows: wsis.len(),
        combined_rows: combined.len(),
        files,
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print(&summary).into_diagnostic()?,
        OutputMode::Interactive => {
            println!(
                "exported {} cells, {} WSIs, {} combined rows",
                summary.cell_rows, summary.wsi_rows, summary.combined_rows
            );
            for file in &summary.files {
                println!("  {file}");
            }
        }
    }
    Ok(())
}

fn run_cutout(args: SessionArgs, output_mode: OutputMode) -> miette::Result<()> {
    let resolved = resolve(&args)?;
    let repo = if args.no_cache {
        load_repository(&resolved, NoCache)?
    } else {
        load_repository(&resolved, FileCache::new(resolved.cache_dir.clone()))?
    };

    let cells: Vec<_> = repo
        .cells()
        .filter(|cell| cell.bbox.is_some())
        .cloned()
        .collect();
    let report = images::cutout_cells(&cells, repo.cell_dir(), &repo.wsi_image_paths());
    let summary = CutoutSummary {
        cells_with_bbox: cells.len(),
        report,
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print(&summary).into_diagnostic()?,
        OutputMode::Interactive => println!(
            "cut {} cells ({} already present, {} failed)",
            summary.report.written, summary.report.present, summary.report.failed
        ),
    }
    Ok(())
}

fn run_normalize(args: NormalizeArgs, output_mode: OutputMode) -> miette::Result<()> {
    let record = WsiRecord {
        id: 0,
        img_name: args.img_name,
        dataset_id: args.dataset_id,
        pixel_diameter_in_micrometer: None,
        resource_url: None,
    };
    let labels = normalize_wsi_labels(&record)?;
    let summary = NormalizeSummary {
        dataset_id: record.dataset_id,
        img_name: record.img_name,
        labels: labels.into_iter().collect(),
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print(&summary).into_diagnostic()?,
        OutputMode::Interactive => println!("{}", summary.labels.join(", ")),
    }
    Ok(())
}

fn run_cache_clear(config: Option<String>, output_mode: OutputMode) -> miette::Result<()> {
    let cache_dir = match ConfigLoader::resolve(config.as_deref()) {
        Ok(resolved) => resolved.cache_dir,
        Err(AnnotError::MissingConfig) => FileCache::default_root()?,
        Err(err) => return Err(err.into()),
    };
    let cache = FileCache::new(cache_dir.clone());
    let removed = cache.clear()?;
    let summary = CacheClearSummary { cache_dir, removed };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print(&summary).into_diagnostic()?,
        OutputMode::Interactive => {
            println!("removed {} entries from {}", summary.removed, summary.cache_dir)
        }
    }
    Ok(())
}
