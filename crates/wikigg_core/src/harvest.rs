use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::DEFAULT_PAGE_DELAY_MS;
use crate::crawler::{CrawlOptions, crawl_graph, crawl_pages};
use crate::dataset::{
    LogoOutcome, LogoSource, SiteBody, fetch_logo, logo_is_cached, write_directory,
    write_site_output,
};
use crate::directory::{DirectoryApi, list_wikis};
use crate::mediawiki::SiteApi;
use crate::model::{GraphItem, WikiRecord};
use crate::runtime::{DatasetLayout, normalize_for_display};

const PROGRESS_TEMPLATE: &str = "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestMode {
    /// Directory listing only.
    DirectoryOnly,
    /// Directory plus parsed page content per wiki.
    Pages,
    /// Directory plus page wikitext and the link graph per wiki.
    Graph,
}

impl HarvestMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectoryOnly => "directory",
            Self::Pages => "pages",
            Self::Graph => "graph",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub mode: HarvestMode,
    /// Crawl wikis that have no logo (their logo step is still skipped).
    pub include_logoless: bool,
    /// Restrict crawling to these wiki ids; empty means all.
    pub only: Vec<String>,
    pub page_delay: Duration,
    pub show_progress: bool,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            mode: HarvestMode::Pages,
            include_logoless: false,
            only: Vec::new(),
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub mode: HarvestMode,
    pub directory_path: String,
    pub wikis_listed: usize,
    pub crawled: usize,
    pub skipped_no_logo: usize,
    pub skipped_cached: usize,
    pub skipped_filtered: usize,
    pub logos_downloaded: usize,
    pub items_written: usize,
    pub site_outputs: Vec<String>,
}

impl HarvestReport {
    fn new(mode: HarvestMode, directory_path: String, wikis_listed: usize) -> Self {
        Self {
            mode,
            directory_path,
            wikis_listed,
            crawled: 0,
            skipped_no_logo: 0,
            skipped_cached: 0,
            skipped_filtered: 0,
            logos_downloaded: 0,
            items_written: 0,
            site_outputs: Vec::new(),
        }
    }
}

/// Full harvest: list the directory, persist it, then crawl every wiki whose
/// logo is not yet cached, writing its output before fetching its logo.
pub fn run_harvest<D, S, L>(
    directory: D,
    site: &S,
    logos: &L,
    layout: &DatasetLayout,
    options: &HarvestOptions,
) -> Result<HarvestReport>
where
    D: DirectoryApi,
    S: SiteApi + ?Sized,
    L: LogoSource + ?Sized,
{
    let wikis = list_wikis(directory)
        .collect::<Result<Vec<_>>>()
        .context("failed to list wikis from the directory")?;
    info!("processing {} wikis from the directory", wikis.len());

    let directory_path = write_directory(layout, &wikis)?;
    let mut report = HarvestReport::new(
        options.mode,
        normalize_for_display(&directory_path),
        wikis.len(),
    );
    if options.mode == HarvestMode::DirectoryOnly {
        return Ok(report);
    }

    for wiki in &wikis {
        if !options.only.is_empty() && !options.only.contains(&wiki.id) {
            report.skipped_filtered += 1;
            continue;
        }
        if wiki.logo.is_none() && !options.include_logoless {
            debug!(wiki = %wiki.id, "skipping wiki without logo");
            report.skipped_no_logo += 1;
            continue;
        }
        if logo_is_cached(layout, wiki) {
            debug!(wiki = %wiki.id, "skipping wiki with cached logo");
            report.skipped_cached += 1;
            continue;
        }

        let written = harvest_site(site, layout, wiki, options)?;
        report.items_written += written.items;
        report
            .site_outputs
            .push(normalize_for_display(&layout.site_output_path(&wiki.id)));
        report.crawled += 1;

        if let LogoOutcome::Downloaded { bytes, .. } = fetch_logo(logos, layout, wiki)? {
            debug!(wiki = %wiki.id, bytes, "logo downloaded");
            report.logos_downloaded += 1;
        }
    }

    info!(
        crawled = report.crawled,
        skipped_cached = report.skipped_cached,
        skipped_no_logo = report.skipped_no_logo,
        "harvest finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Copy)]
pub struct SiteWrite {
    pub items: usize,
}

/// Crawl one wiki to completion and write its output file. Nothing is
/// written when the crawl fails.
pub fn harvest_site<S: SiteApi + ?Sized>(
    site: &S,
    layout: &DatasetLayout,
    wiki: &WikiRecord,
    options: &HarvestOptions,
) -> Result<SiteWrite> {
    info!(wiki = %wiki.id, host = %wiki.host, mode = options.mode.as_str(), "crawling wiki");
    let crawl_options = CrawlOptions {
        page_delay: options.page_delay,
        progress: site_progress(&wiki.host, options.show_progress)?,
    };

    let items = match options.mode {
        HarvestMode::DirectoryOnly => 0,
        HarvestMode::Pages => {
            let pages = crawl_pages(site, &wiki.host, crawl_options)
                .collect::<Result<Vec<Value>>>()
                .with_context(|| format!("failed to crawl pages of {}", wiki.id))?;
            write_site_output(layout, wiki, SiteBody::Pages(&pages))?;
            pages.len()
        }
        HarvestMode::Graph => {
            let graph = crawl_graph(site, &wiki.host, crawl_options)
                .collect::<Result<Vec<GraphItem>>>()
                .with_context(|| format!("failed to crawl graph of {}", wiki.id))?;
            write_site_output(layout, wiki, SiteBody::Graph(&graph))?;
            graph.len()
        }
    };
    Ok(SiteWrite { items })
}

pub fn site_progress(host: &str, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
        .context("invalid progress template")?
        .progress_chars("#>-");
    Ok(ProgressBar::new(0)
        .with_style(style)
        .with_message(host.to_string()))
}
