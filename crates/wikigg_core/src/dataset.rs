use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::HttpSettings;
use crate::model::{GraphItem, WikiRecord};
use crate::runtime::DatasetLayout;

/// Crawl output attached to a wiki record on disk.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum SiteBody<'a> {
    #[serde(rename = "pages")]
    Pages(&'a [Value]),
    #[serde(rename = "graph")]
    Graph(&'a [GraphItem]),
}

impl SiteBody<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Pages(pages) => pages.len(),
            Self::Graph(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Serialize)]
struct SiteOutput<'a> {
    #[serde(flatten)]
    wiki: &'a WikiRecord,
    #[serde(flatten)]
    body: SiteBody<'a>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoOutcome {
    NoLogo,
    AlreadyCached(PathBuf),
    Downloaded { path: PathBuf, bytes: u64 },
}

/// Streams a remote image into a writer.
pub trait LogoSource {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64>;
}

impl<T: LogoSource + ?Sized> LogoSource for &T {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        (**self).download(url, sink)
    }
}

pub struct HttpLogoSource {
    client: Client,
}

impl HttpLogoSource {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        Ok(Self {
            client: settings.build_client()?,
        })
    }
}

impl LogoSource for HttpLogoSource {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to request logo {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("logo request {url} failed with HTTP {status}");
        }
        response
            .copy_to(sink)
            .with_context(|| format!("failed to stream logo {url}"))
    }
}

/// Overwrite the aggregate directory listing.
pub fn write_directory(layout: &DatasetLayout, records: &[WikiRecord]) -> Result<PathBuf> {
    write_json(&layout.directory_file, &records)?;
    info!(
        wikis = records.len(),
        path = %layout.directory_file.display(),
        "directory listing written"
    );
    Ok(layout.directory_file.clone())
}

/// The listing written by the last harvest, `None` before the first one.
pub fn read_directory(layout: &DatasetLayout) -> Result<Option<Vec<WikiRecord>>> {
    let path = &layout.directory_file;
    if !path.is_file() {
        return Ok(None);
    }
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let records = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse directory listing {}", path.display()))?;
    Ok(Some(records))
}

/// Overwrite `<pages_dir>/<id>.json` with the record merged with its crawl output.
pub fn write_site_output(
    layout: &DatasetLayout,
    wiki: &WikiRecord,
    body: SiteBody<'_>,
) -> Result<PathBuf> {
    let path = layout.site_output_path(&wiki.id);
    write_json(&path, &SiteOutput { wiki, body })?;
    debug!(wiki = %wiki.id, items = body.len(), path = %path.display(), "site output written");
    Ok(path)
}

pub fn logo_is_cached(layout: &DatasetLayout, wiki: &WikiRecord) -> bool {
    layout.logo_path(&wiki.id).is_file()
}

/// Download a wiki's logo unless it has none or a file is already in place.
/// An existing file counts as cached whatever its contents.
pub fn fetch_logo<L: LogoSource + ?Sized>(
    source: &L,
    layout: &DatasetLayout,
    wiki: &WikiRecord,
) -> Result<LogoOutcome> {
    let Some(url) = wiki.logo.as_deref() else {
        return Ok(LogoOutcome::NoLogo);
    };
    let path = layout.logo_path(&wiki.id);
    if path.is_file() {
        return Ok(LogoOutcome::AlreadyCached(path));
    }

    ensure_parent_dir(&path)?;
    let partial = path.with_extension("png.part");
    let bytes = match stream_to_file(source, url, &partial) {
        Ok(bytes) => bytes,
        Err(error) => {
            let _ = fs::remove_file(&partial);
            return Err(error);
        }
    };
    fs::rename(&partial, &path)
        .with_context(|| format!("failed to move logo into {}", path.display()))?;
    Ok(LogoOutcome::Downloaded { path, bytes })
}

fn stream_to_file<L: LogoSource + ?Sized>(source: &L, url: &str, path: &Path) -> Result<u64> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let bytes = source.download(url, &mut writer)?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(bytes)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}
