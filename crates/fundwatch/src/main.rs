use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, CommandFactory, Parser, Subcommand};
use fundwatch_core::bulk::{BULK_ARCHIVE_URL, download_archive, prime_cache, scan};
use fundwatch_core::cache::DiskCache;
use fundwatch_core::config::{FundwatchConfig, load_config, normalize_registrant_id, parse_iso_date};
use fundwatch_core::driver::{RunOptions, run, write_outputs};
use fundwatch_core::fetch::FetchClient;
use fundwatch_core::history::{changes_for_series, find_series_by_name, history};
use fundwatch_core::registry::Registry;
use fundwatch_core::rollup::rollup;
use fundwatch_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, resolve_paths,
};
use fundwatch_core::store::Store;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "fundwatch",
    version,
    about = "Incremental fund registration tracker over the public filing archive"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the runtime layout and a commented config")]
    Init(InitArgs),
    #[command(about = "Bulk index archive download and scan")]
    Bulk(BulkArgs),
    #[command(about = "Inspect or edit the tracked registrants")]
    Registry(RegistryArgs),
    #[command(about = "Incremental extraction over tracked registrants")]
    Run(RunArgs),
    #[command(about = "Recompute fund status from stored rows (no network)")]
    Rollup(RollupArgs),
    #[command(about = "Recompute name history from stored rows (no network)")]
    History(HistoryArgs),
    #[command(about = "Fetch URLs through the cache-backed batch client")]
    Fetch(FetchArgs),
    #[command(about = "Incremental processing manifest")]
    Manifest(ManifestArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct BulkArgs {
    #[command(subcommand)]
    command: BulkSubcommand,
}

#[derive(Debug, Subcommand)]
enum BulkSubcommand {
    Download {
        #[arg(long, value_name = "PATH")]
        dest: PathBuf,
        #[arg(long, default_value = BULK_ARCHIVE_URL)]
        url: String,
    },
    Scan {
        #[arg(long, value_name = "PATH")]
        archive: PathBuf,
        #[arg(long = "prefix", value_name = "PREFIX", help = "Target form prefix (repeatable)")]
        prefixes: Vec<String>,
        #[arg(long, help = "Copy matching index documents into the cache")]
        prime: bool,
        #[arg(long = "import", help = "Add matching registrants to the registry")]
        import_matches: bool,
    },
}

#[derive(Debug, Args)]
struct RegistryArgs {
    #[command(subcommand)]
    command: RegistrySubcommand,
}

#[derive(Debug, Subcommand)]
enum RegistrySubcommand {
    List,
    Add { id: String, name: String },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long = "cik", value_name = "ID", help = "Limit the run to a registrant (repeatable)")]
    ciks: Vec<String>,
    #[arg(long, value_name = "YYYY-MM-DD", value_parser = parse_date_arg)]
    since: Option<NaiveDate>,
    #[arg(long, value_name = "YYYY-MM-DD", value_parser = parse_date_arg)]
    until: Option<NaiveDate>,
    #[arg(long = "form", value_name = "PREFIX", help = "Only filings whose form starts with PREFIX")]
    forms: Vec<String>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, help = "Warm the index cache with the async batch client first")]
    prefetch: bool,
    #[arg(long, help = "Clear the manifest and reprocess every filing")]
    force: bool,
}

#[derive(Debug, Args)]
struct CikArgs {
    #[arg(long, value_name = "ID")]
    cik: String,
}

#[derive(Debug, Args)]
struct RollupArgs {
    #[arg(long, value_name = "ID", help = "Registrant to recompute; every stored registrant when omitted")]
    cik: Option<String>,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long, value_name = "ID")]
    cik: String,
    #[arg(long, value_name = "SERIES_ID")]
    series: Option<String>,
    #[arg(long, value_name = "TEXT")]
    search: Option<String>,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(required = true)]
    urls: Vec<String>,
}

#[derive(Debug, Args)]
struct ManifestArgs {
    #[command(subcommand)]
    command: ManifestSubcommand,
}

#[derive(Debug, Subcommand)]
enum ManifestSubcommand {
    Clear(CikArgs),
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Bulk(BulkArgs { command })) => match command {
            BulkSubcommand::Download { dest, url } => run_bulk_download(&runtime, &url, &dest),
            BulkSubcommand::Scan {
                archive,
                prefixes,
                prime,
                import_matches,
            } => run_bulk_scan(&runtime, &archive, prefixes, prime, import_matches),
        },
        Some(Commands::Registry(RegistryArgs { command })) => match command {
            RegistrySubcommand::List => run_registry_list(&runtime),
            RegistrySubcommand::Add { id, name } => run_registry_add(&runtime, &id, &name),
        },
        Some(Commands::Run(args)) => run_extraction(&runtime, args),
        Some(Commands::Rollup(RollupArgs { cik })) => run_rollup(&runtime, cik.as_deref()),
        Some(Commands::History(args)) => run_history(&runtime, args),
        Some(Commands::Fetch(FetchArgs { urls })) => run_fetch(&runtime, urls),
        Some(Commands::Manifest(ManifestArgs { command })) => match command {
            ManifestSubcommand::Clear(CikArgs { cik }) => run_manifest_clear(&runtime, &cik),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized fundwatch runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("cache_dir: {}", normalize_path(&paths.cache_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("registry_path: {}", normalize_path(&paths.registry_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_registry: {}", report.wrote_registry);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_bulk_download(runtime: &RuntimeOptions, url: &str, dest: &Path) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let bytes = download_archive(url, dest, &config.fetch_settings())?;

    println!("bulk download");
    println!("dest: {}", normalize_path(dest));
    println!("bytes: {bytes}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_bulk_scan(
    runtime: &RuntimeOptions,
    archive: &Path,
    prefixes: Vec<String>,
    prime: bool,
    import_matches: bool,
) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let prefixes = if prefixes.is_empty() {
        config.pipeline_settings()?.target_prefixes
    } else {
        prefixes
    };
    let report = scan(archive, &prefixes)?;

    println!("bulk scan");
    println!("archive: {}", normalize_path(archive));
    println!("prefixes: {}", prefixes.join(", "));
    println!("registrants_scanned: {}", report.registrants_scanned);
    println!("overflow_entries: {}", report.overflow_entries);
    println!("skipped_entries: {}", report.skipped_entries);
    println!("matches: {}", report.matches.len());

    if prime {
        let cache = DiskCache::new(&paths.cache_dir, config.fetch_settings().refresh_max_age);
        let primed = prime_cache(archive, &report.matches, &cache)?;
        println!("primed_documents: {primed}");
    }
    if import_matches {
        let mut registry = Registry::load(&paths.registry_path)?;
        let added = registry.import_matches(&report.matches)?;
        println!("registry_added: {added}");
        println!("registry_total: {}", registry.entries().len());
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_registry_list(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let registry = Registry::load(&paths.registry_path)?;
    println!("registry: {}", normalize_path(registry.path()));
    println!("registrants: {}", registry.entries().len());
    for entry in registry.entries() {
        println!("  {}\t{}", entry.id, entry.name);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_registry_add(runtime: &RuntimeOptions, id: &str, name: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let mut registry = Registry::load(&paths.registry_path)?;
    if registry.add_entry(id, name)? {
        println!("added {} ({})", normalize_registrant_id(id), name.trim());
    } else {
        println!("already tracked: {}", normalize_registrant_id(id));
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_extraction(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let registry = Registry::load(&paths.registry_path)?;
    if registry.entries().is_empty() && args.ciks.is_empty() {
        bail!(
            "no registrants to process; add some with `fundwatch registry add` or pass --cik ({})",
            normalize_path(&paths.registry_path)
        );
    }

    let summary = run(
        &paths,
        &registry,
        &config.fetch_settings(),
        &config.pipeline_settings()?,
        &RunOptions {
            registrant_ids: args.ciks,
            since: args.since,
            until: args.until,
            form_prefixes: args.forms,
            workers: args.workers,
            force: args.force,
            prefetch: args.prefetch,
        },
    )?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_rollup(runtime: &RuntimeOptions, cik: Option<&str>) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let store = Store::open(&paths.db_path)?;

    let Some(cik) = cik else {
        let registrant_ids = store.registrant_ids()?;
        for registrant_id in &registrant_ids {
            let rows = store.load_rows(registrant_id)?;
            let outputs = write_outputs(&paths, registrant_id, &rows)?;
            println!(
                "{registrant_id}\tfunds: {}\tnames: {}",
                outputs.funds, outputs.name_history_entries
            );
        }
        println!("registrants: {}", registrant_ids.len());
        print_diagnostics(runtime, &paths);
        return Ok(());
    };

    let registrant_id = normalize_registrant_id(cik);
    let rows = store.load_rows(&registrant_id)?;
    let outputs = write_outputs(&paths, &registrant_id, &rows)?;

    println!("{}", serde_json::to_string_pretty(&rollup(&rows))?);
    eprintln!(
        "wrote {} ({} funds)",
        normalize_path(&outputs.fund_status_path),
        outputs.funds
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_history(runtime: &RuntimeOptions, args: HistoryArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let registrant_id = normalize_registrant_id(&args.cik);
    let store = Store::open(&paths.db_path)?;
    let rows = store.load_rows(&registrant_id)?;
    let entries = history(&rows);

    if let Some(query) = args.search.as_deref() {
        println!(
            "{}",
            serde_json::to_string_pretty(&find_series_by_name(&entries, query))?
        );
    } else if let Some(series_id) = args.series.as_deref() {
        println!(
            "{}",
            serde_json::to_string_pretty(&changes_for_series(&entries, series_id))?
        );
    } else {
        let outputs = write_outputs(&paths, &registrant_id, &rows)?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        eprintln!(
            "wrote {} ({} names)",
            normalize_path(&outputs.name_history_path),
            outputs.name_history_entries
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_fetch(runtime: &RuntimeOptions, urls: Vec<String>) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let client = FetchClient::new(config.fetch_settings(), &paths.cache_dir)?;
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let results = tokio_runtime.block_on(client.fetch_many(&urls));

    let mut failed = 0usize;
    for (url, result) in &results {
        match result {
            Ok(body) => println!("{url}\t{} bytes", body.len()),
            Err(error) => {
                failed += 1;
                println!("{url}\terror: {error}");
            }
        }
    }
    println!("requests: {}", client.request_count());
    print_diagnostics(runtime, &paths);
    if failed > 0 {
        bail!("{failed} of {} fetches failed", results.len());
    }
    Ok(())
}

fn run_manifest_clear(runtime: &RuntimeOptions, cik: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let registrant_id = normalize_registrant_id(cik);
    let mut store = Store::open(&paths.db_path)?;
    let cleared = store.clear_manifest(&registrant_id)?;
    println!("cleared {cleared} manifest entries for {registrant_id}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn parse_date_arg(value: &str) -> Result<NaiveDate, String> {
    parse_iso_date(value).ok_or_else(|| format!("expected YYYY-MM-DD, got {value}"))
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<FundwatchConfig> {
    load_config(&paths.config_path)
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        eprintln!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
