use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use dialoguer::Input;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wikigg_core::config::{HarvestConfig, load_config};
use wikigg_core::crawler::{CrawlOptions, crawl_graph, crawl_pages};
use wikigg_core::dataset::{HttpLogoSource, SiteBody, logo_is_cached, read_directory};
use wikigg_core::directory::{DirectoryClient, DirectoryClientConfig};
use wikigg_core::harvest::{HarvestMode, HarvestOptions, HarvestReport, run_harvest, site_progress};
use wikigg_core::index::{
    IndexStats, load_index_stats, query_backlinks, query_orphans, query_outgoing,
    rebuild_graph_index,
};
use wikigg_core::mediawiki::{MediaWikiClient, api_url};
use wikigg_core::model::WikiRecord;
use wikigg_core::runtime::{DatasetLayout, PathOverrides, normalize_for_display, resolve_layout};
use wikigg_core::search::{DEFAULT_SEARCH_LIMIT, find_wiki, search_wikis};

const AUTHORIZATION_ENV: &str = "WIKIGG_AUTHORIZATION";

#[derive(Debug, Parser)]
#[command(
    name = "wikigg",
    version,
    about = "Harvest the wiki.gg directory and crawl each wiki's MediaWiki API"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    output_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "VALUE",
        help = "Directory API authorization header (falls back to WIKIGG_AUTHORIZATION, then a prompt)"
    )]
    authorization: Option<String>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log errors and hide progress bars
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    output_root: Option<PathBuf>,
    config: Option<PathBuf>,
    authorization: Option<String>,
    diagnostics: bool,
    quiet: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            output_root: cli.output_root.clone(),
            config: cli.config.clone(),
            authorization: cli.authorization.clone(),
            diagnostics: cli.diagnostics,
            quiet: cli.quiet,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Write the directory listing only")]
    Directory,
    #[command(about = "Directory plus parsed content of every page per wiki")]
    Pages(HarvestArgs),
    #[command(about = "Directory plus wikitext and link graph per wiki")]
    Graph(HarvestArgs),
    #[command(name = "crawl-site", about = "Crawl a single wiki without the directory")]
    CrawlSite(CrawlSiteArgs),
    Index(IndexArgs),
    #[command(about = "Fuzzy-search the harvested directory by wiki name")]
    Search(SearchArgs),
    #[command(about = "Show one wiki of the harvested directory")]
    Show(ShowArgs),
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(value_name = "QUERY", default_value = "")]
    query: String,
    #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(value_name = "ID")]
    id: String,
}

#[derive(Debug, Args, Default)]
struct HarvestArgs {
    #[arg(long, help = "Crawl wikis without a logo (no logo is fetched for them)")]
    include_logoless: bool,
    #[arg(long, value_name = "ID", help = "Only crawl these wiki ids")]
    only: Vec<String>,
}

#[derive(Debug, Args)]
struct CrawlSiteArgs {
    #[arg(value_name = "HOST", help = "Wiki base URL, e.g. https://terraria.wiki.gg")]
    host: String,
    #[arg(long, help = "Collect wikitext and links instead of parsed pages")]
    graph: bool,
    #[arg(long, value_name = "FILE", help = "Write JSON here instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct IndexArgs {
    #[command(subcommand)]
    command: IndexSubcommand,
}

#[derive(Debug, Subcommand)]
enum IndexSubcommand {
    Rebuild,
    Stats,
    Backlinks { wiki: String, title: String },
    Links { wiki: String, title: String },
    Orphans { wiki: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Directory) => {
            run_harvest_command(&runtime, HarvestMode::DirectoryOnly, HarvestArgs::default())
        }
        Some(Commands::Pages(args)) => run_harvest_command(&runtime, HarvestMode::Pages, args),
        Some(Commands::Graph(args)) => run_harvest_command(&runtime, HarvestMode::Graph, args),
        Some(Commands::CrawlSite(args)) => run_crawl_site(&runtime, args),
        Some(Commands::Index(IndexArgs { command })) => match command {
            IndexSubcommand::Rebuild => run_index_rebuild(&runtime),
            IndexSubcommand::Stats => run_index_stats(&runtime),
            IndexSubcommand::Backlinks { wiki, title } => {
                run_index_links(&runtime, &wiki, &title, LinkDirection::Inbound)
            }
            IndexSubcommand::Links { wiki, title } => {
                run_index_links(&runtime, &wiki, &title, LinkDirection::Outbound)
            }
            IndexSubcommand::Orphans { wiki } => run_index_orphans(&runtime, &wiki),
        },
        Some(Commands::Search(args)) => run_search(&runtime, args),
        Some(Commands::Show(ShowArgs { id })) => run_show(&runtime, &id),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let default_filter = if quiet {
        "error"
    } else {
        match verbose {
            0 => "wikigg=info,wikigg_core=info,warn",
            1 => "wikigg=debug,wikigg_core=debug,info",
            _ => "trace",
        }
    };
    let filter = match env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => EnvFilter::new(value),
        _ => EnvFilter::new(default_filter),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_harvest_command(runtime: &RuntimeOptions, mode: HarvestMode, args: HarvestArgs) -> Result<()> {
    let (layout, config) = resolve_runtime(runtime)?;
    let authorization = resolve_authorization(runtime.authorization.as_deref())?;
    layout.ensure_output_dirs()?;

    let http = config.http_settings();
    let directory = DirectoryClient::new(DirectoryClientConfig::from_config(&config), authorization)?;
    let site = MediaWikiClient::new(&http)?;
    let logos = HttpLogoSource::new(&http)?;
    let options = HarvestOptions {
        mode,
        include_logoless: args.include_logoless,
        only: args.only,
        page_delay: config.page_delay(),
        show_progress: !runtime.quiet,
    };

    let report = run_harvest(&directory, &site, &logos, &layout, &options)?;

    println!("harvest {}", mode.as_str());
    println!("output_root: {}", normalize_for_display(&layout.output_root));
    print_harvest_report(&report);
    println!("api_requests: {}", site.request_count());
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.diagnostics());
    }
    Ok(())
}

fn print_harvest_report(report: &HarvestReport) {
    println!("directory_path: {}", report.directory_path);
    println!("wikis_listed: {}", report.wikis_listed);
    println!("crawled: {}", report.crawled);
    println!("skipped_no_logo: {}", report.skipped_no_logo);
    println!("skipped_cached: {}", report.skipped_cached);
    println!("skipped_filtered: {}", report.skipped_filtered);
    println!("logos_downloaded: {}", report.logos_downloaded);
    println!("items_written: {}", report.items_written);
    for path in &report.site_outputs {
        println!("  - {path}");
    }
}

fn run_crawl_site(runtime: &RuntimeOptions, args: CrawlSiteArgs) -> Result<()> {
    let (layout, config) = resolve_runtime(runtime)?;
    let site = MediaWikiClient::new(&config.http_settings())?;
    let options = CrawlOptions {
        page_delay: config.page_delay(),
        progress: site_progress(&args.host, !runtime.quiet)?,
    };

    let mut writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let items = if args.graph {
        let graph = crawl_graph(&site, &args.host, options).collect::<Result<Vec<_>>>()?;
        serde_json::to_writer(&mut writer, &SiteBody::Graph(&graph))
            .context("failed to serialize graph crawl")?;
        graph.len()
    } else {
        let pages = crawl_pages(&site, &args.host, options).collect::<Result<Vec<_>>>()?;
        serde_json::to_writer(&mut writer, &SiteBody::Pages(&pages))
            .context("failed to serialize page crawl")?;
        pages.len()
    };
    writeln!(writer).context("failed to write crawl output")?;
    writer.flush().context("failed to write crawl output")?;

    match &args.output {
        Some(path) => {
            println!("crawl-site");
            println!("host: {}", args.host);
            println!("mode: {}", if args.graph { "graph" } else { "pages" });
            println!("output: {}", normalize_for_display(path));
            println!("items: {items}");
            println!("api_requests: {}", site.request_count());
            if runtime.diagnostics {
                println!("\n[diagnostics]\n{}", layout.diagnostics());
            }
        }
        None => info!(host = %args.host, items, requests = site.request_count(), "crawl finished"),
    }
    Ok(())
}

fn run_index_rebuild(runtime: &RuntimeOptions) -> Result<()> {
    let (layout, _) = resolve_runtime(runtime)?;
    let report = rebuild_graph_index(&layout)?;

    println!("index rebuild");
    println!("pages_dir: {}", normalize_for_display(&layout.pages_dir));
    println!("db_path: {}", report.db_path);
    println!("scanned_files: {}", report.scanned_files);
    println!("skipped_files: {}", report.skipped_files);
    println!("inserted_wikis: {}", report.inserted_wikis);
    println!("inserted_pages: {}", report.inserted_pages);
    println!("inserted_links: {}", report.inserted_links);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.diagnostics());
    }
    Ok(())
}

fn run_index_stats(runtime: &RuntimeOptions) -> Result<()> {
    let (layout, _) = resolve_runtime(runtime)?;

    println!("index stats");
    println!("db_path: {}", normalize_for_display(&layout.index_path));
    match load_index_stats(&layout)? {
        Some(stats) => print_index_stats("index", &stats),
        None => println!("index.storage: <not built> (run `wikigg index rebuild`)"),
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.diagnostics());
    }
    Ok(())
}

fn print_index_stats(prefix: &str, stats: &IndexStats) {
    println!("{prefix}.wikis: {}", stats.wikis);
    println!("{prefix}.pages: {}", stats.pages);
    println!("{prefix}.links: {}", stats.links);
    if stats.pages_by_wiki.is_empty() {
        println!("{prefix}.by_wiki: <empty>");
    } else {
        for (wiki, count) in &stats.pages_by_wiki {
            println!("{prefix}.wiki.{wiki}: {count}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LinkDirection {
    Inbound,
    Outbound,
}

fn run_index_links(
    runtime: &RuntimeOptions,
    wiki: &str,
    title: &str,
    direction: LinkDirection,
) -> Result<()> {
    let (layout, _) = resolve_runtime(runtime)?;
    let (label, titles) = match direction {
        LinkDirection::Inbound => ("backlinks", query_backlinks(&layout, wiki, title)?),
        LinkDirection::Outbound => ("links", query_outgoing(&layout, wiki, title)?),
    };
    let Some(titles) = titles else {
        bail!("graph index is not built; run `wikigg index rebuild` first");
    };

    println!("index {label}");
    println!("wiki: {wiki}");
    println!("title: {title}");
    println!("count: {}", titles.len());
    for entry in titles {
        println!("  - {entry}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.diagnostics());
    }
    Ok(())
}

fn run_index_orphans(runtime: &RuntimeOptions, wiki: &str) -> Result<()> {
    let (layout, _) = resolve_runtime(runtime)?;
    let Some(orphans) = query_orphans(&layout, wiki)? else {
        bail!("graph index is not built; run `wikigg index rebuild` first");
    };

    println!("index orphans");
    println!("wiki: {wiki}");
    println!("count: {}", orphans.len());
    for title in orphans {
        println!("  - {title}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.diagnostics());
    }
    Ok(())
}

fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let (layout, _) = resolve_runtime(runtime)?;
    let records = load_directory(&layout)?;
    let hits = search_wikis(&records, &args.query, args.limit);

    println!("search");
    println!("query: {}", args.query);
    println!("directory_size: {}", records.len());
    println!("count: {}", hits.len());
    for hit in &hits {
        println!(
            "  - {} ({}) {} distance={}",
            hit.wiki.id, hit.wiki.name, hit.wiki.host, hit.distance
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.diagnostics());
    }
    Ok(())
}

fn run_show(runtime: &RuntimeOptions, id: &str) -> Result<()> {
    let (layout, _) = resolve_runtime(runtime)?;
    let records = load_directory(&layout)?;
    let Some(wiki) = find_wiki(&records, id) else {
        bail!("wiki `{id}` is not in {}", normalize_for_display(&layout.directory_file));
    };

    println!("wiki {}", wiki.id);
    println!("name: {}", wiki.name);
    println!("host: {}", wiki.host);
    println!("api: {}", api_url(&wiki.host)?);
    println!("logo: {}", wiki.logo.as_deref().unwrap_or("<none>"));
    println!("logo_cached: {}", format_flag(logo_is_cached(&layout, wiki)));
    println!(
        "site_output: {}",
        format_flag(layout.site_output_path(&wiki.id).is_file())
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.diagnostics());
    }
    Ok(())
}

fn load_directory(layout: &DatasetLayout) -> Result<Vec<WikiRecord>> {
    match read_directory(layout)? {
        Some(records) => Ok(records),
        None => bail!(
            "no directory listing at {}; run `wikigg directory` first",
            normalize_for_display(&layout.directory_file)
        ),
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Flag, then `WIKIGG_AUTHORIZATION`, then an interactive prompt.
fn resolve_authorization(flag: Option<&str>) -> Result<String> {
    if let Some(value) = flag.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(value.to_string());
    }
    if let Ok(value) = env::var(AUTHORIZATION_ENV) {
        let value = value.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
    }

    let value: String = Input::new()
        .with_prompt("wiki.gg directory authorization")
        .interact_text()
        .context("failed to read directory authorization")?;
    let value = value.trim();
    if value.is_empty() {
        bail!("directory authorization is required");
    }
    Ok(value.to_string())
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(DatasetLayout, HarvestConfig)> {
    let overrides = PathOverrides {
        output_root: runtime.output_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_layout(&overrides)?;
    let root_env = initial.output_root.join(".env");
    if root_env.exists() {
        let _ = dotenvy::from_path_override(&root_env);
    }

    let layout = resolve_layout(&overrides)?;
    let config = load_config(&layout.config_path)?;
    Ok((layout, config))
}
