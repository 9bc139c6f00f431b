use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::model::GraphItem;
use crate::runtime::{DatasetLayout, normalize_for_display};

const INDEX_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS graph_wikis (
    wiki_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    host TEXT NOT NULL,
    source_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS graph_pages (
    wiki_id TEXT NOT NULL,
    title TEXT NOT NULL,
    page_id INTEGER NOT NULL,
    content_bytes INTEGER,
    PRIMARY KEY (wiki_id, title),
    FOREIGN KEY (wiki_id) REFERENCES graph_wikis(wiki_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_graph_pages_page_id ON graph_pages(wiki_id, page_id);

CREATE TABLE IF NOT EXISTS graph_links (
    wiki_id TEXT NOT NULL,
    source_title TEXT NOT NULL,
    target_title TEXT NOT NULL,
    PRIMARY KEY (wiki_id, source_title, target_title),
    FOREIGN KEY (wiki_id) REFERENCES graph_wikis(wiki_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_graph_links_target ON graph_links(wiki_id, target_title);
"#;

const GRAPH_TABLE_COUNT: i64 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub db_path: String,
    pub scanned_files: usize,
    pub skipped_files: usize,
    pub inserted_wikis: usize,
    pub inserted_pages: usize,
    pub inserted_links: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub wikis: usize,
    pub pages: usize,
    pub links: usize,
    pub pages_by_wiki: BTreeMap<String, usize>,
}

/// Graph-variant site output as read back from disk. Content-variant files
/// have no `graph` key and are skipped.
#[derive(Debug, Deserialize)]
struct StoredSite {
    id: String,
    name: String,
    host: String,
    #[serde(default)]
    graph: Option<Vec<GraphItem>>,
}

/// Drop and reload every graph table from the site outputs under `pages_dir`.
pub fn rebuild_graph_index(layout: &DatasetLayout) -> Result<IndexReport> {
    let files = scan_site_outputs(&layout.pages_dir)?;
    let mut connection = create_index(&layout.index_path)?;

    let transaction = connection
        .transaction()
        .context("failed to start graph index rebuild transaction")?;
    transaction
        .execute("DELETE FROM graph_wikis", [])
        .context("failed to clear graph_wikis table")?;

    let mut wiki_statement = transaction
        .prepare(
            "INSERT OR REPLACE INTO graph_wikis (wiki_id, name, host, source_path)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .context("failed to prepare graph_wikis insert")?;
    let mut page_statement = transaction
        .prepare(
            "INSERT OR IGNORE INTO graph_pages (wiki_id, title, page_id, content_bytes)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .context("failed to prepare graph_pages insert")?;
    let mut link_statement = transaction
        .prepare(
            "INSERT OR IGNORE INTO graph_links (wiki_id, source_title, target_title)
             VALUES (?1, ?2, ?3)",
        )
        .context("failed to prepare graph_links insert")?;

    let mut report = IndexReport {
        db_path: normalize_for_display(&layout.index_path),
        scanned_files: files.len(),
        skipped_files: 0,
        inserted_wikis: 0,
        inserted_pages: 0,
        inserted_links: 0,
    };
    for path in &files {
        let site = read_site_output(path)?;
        let Some(graph) = site.graph else {
            debug!(path = %path.display(), "no graph in site output");
            report.skipped_files += 1;
            continue;
        };

        wiki_statement
            .execute(params![
                site.id,
                site.name,
                site.host,
                normalize_for_display(path)
            ])
            .with_context(|| format!("failed to insert wiki {}", site.id))?;
        report.inserted_wikis += 1;

        for item in &graph {
            match item {
                GraphItem::Page(page) => {
                    let content_bytes = page
                        .content
                        .as_ref()
                        .map(|content| i64::try_from(content.len()))
                        .transpose()
                        .context("content length does not fit into i64")?;
                    report.inserted_pages += page_statement
                        .execute(params![
                            site.id,
                            normalize_title(&page.title),
                            page.page_id,
                            content_bytes
                        ])
                        .with_context(|| {
                            format!("failed to insert page {} of {}", page.title, site.id)
                        })?;
                }
                GraphItem::Link(edge) => {
                    report.inserted_links += link_statement
                        .execute(params![
                            site.id,
                            normalize_title(&edge.source),
                            normalize_title(&edge.target)
                        ])
                        .with_context(|| {
                            format!("failed to insert link {} of {}", edge.source, site.id)
                        })?;
                }
            }
        }
    }
    drop(link_statement);
    drop(page_statement);
    drop(wiki_statement);

    transaction
        .commit()
        .context("failed to commit graph index rebuild transaction")?;
    info!(
        wikis = report.inserted_wikis,
        pages = report.inserted_pages,
        links = report.inserted_links,
        "graph index rebuilt"
    );
    Ok(report)
}

pub fn load_index_stats(layout: &DatasetLayout) -> Result<Option<IndexStats>> {
    let Some(connection) = open_built_index(&layout.index_path)? else {
        return Ok(None);
    };

    let wikis = row_count(&connection, "graph_wikis")?;
    let pages = row_count(&connection, "graph_pages")?;
    let links = row_count(&connection, "graph_links")?;
    let pages_by_wiki = pages_by_wiki(&connection)?;

    Ok(Some(IndexStats {
        wikis,
        pages,
        links,
        pages_by_wiki,
    }))
}

/// Titles of pages in `wiki` linking to `title`.
pub fn query_backlinks(
    layout: &DatasetLayout,
    wiki: &str,
    title: &str,
) -> Result<Option<Vec<String>>> {
    let Some(connection) = open_built_index(&layout.index_path)? else {
        return Ok(None);
    };
    let normalized = normalize_title(title);
    if normalized.is_empty() {
        return Ok(Some(Vec::new()));
    }
    Ok(Some(query_titles(
        &connection,
        "SELECT source_title
         FROM graph_links
         WHERE wiki_id = ?1 AND target_title = ?2
         ORDER BY source_title ASC",
        wiki,
        &normalized,
    )?))
}

/// Titles `title` links to within `wiki`.
pub fn query_outgoing(
    layout: &DatasetLayout,
    wiki: &str,
    title: &str,
) -> Result<Option<Vec<String>>> {
    let Some(connection) = open_built_index(&layout.index_path)? else {
        return Ok(None);
    };
    let normalized = normalize_title(title);
    if normalized.is_empty() {
        return Ok(Some(Vec::new()));
    }
    Ok(Some(query_titles(
        &connection,
        "SELECT target_title
         FROM graph_links
         WHERE wiki_id = ?1 AND source_title = ?2
         ORDER BY target_title ASC",
        wiki,
        &normalized,
    )?))
}

/// Pages of `wiki` that no other page links to. Self-links do not count.
pub fn query_orphans(layout: &DatasetLayout, wiki: &str) -> Result<Option<Vec<String>>> {
    let Some(connection) = open_built_index(&layout.index_path)? else {
        return Ok(None);
    };
    let mut statement = connection
        .prepare(
            "SELECT p.title
             FROM graph_pages p
             WHERE p.wiki_id = ?1
               AND NOT EXISTS (
                   SELECT 1
                   FROM graph_links l
                   WHERE l.wiki_id = p.wiki_id
                     AND l.target_title = p.title
                     AND l.source_title <> p.title
               )
             ORDER BY p.title ASC",
        )
        .context("failed to prepare orphan query")?;
    let rows = statement
        .query_map([wiki], |row| row.get::<_, String>(0))
        .context("failed to run orphan query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode orphan row")?);
    }
    Ok(Some(out))
}

fn query_titles(connection: &Connection, sql: &str, wiki: &str, title: &str) -> Result<Vec<String>> {
    let mut statement = connection
        .prepare(sql)
        .context("failed to prepare link query")?;
    let rows = statement
        .query_map(params![wiki, title], |row| row.get::<_, String>(0))
        .context("failed to run link query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode link row")?);
    }
    Ok(out)
}

fn scan_site_outputs(pages_dir: &Path) -> Result<Vec<PathBuf>> {
    if !pages_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(pages_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry =
            entry.with_context(|| format!("failed to walk {}", pages_dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn read_site_output(path: &Path) -> Result<StoredSite> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse site output {}", path.display()))
}

/// MediaWiki treats underscores and spaces in titles as the same character.
fn normalize_title(title: &str) -> String {
    title.trim().replace('_', " ")
}

/// Foreign keys must be on for the per-wiki cascade in a rebuild.
fn connect(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open graph index {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to configure graph index busy timeout")?;
    for (pragma, value) in [("foreign_keys", "ON"), ("journal_mode", "WAL")] {
        connection
            .pragma_update(None, pragma, value)
            .with_context(|| format!("failed to set {pragma}={value} on graph index"))?;
    }
    Ok(connection)
}

/// Create the database file and its tables if a rebuild runs for the first time.
fn create_index(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let connection = connect(db_path)?;
    connection
        .execute_batch(INDEX_SCHEMA_SQL)
        .context("failed to initialize graph index schema")?;
    Ok(connection)
}

/// `None` until a rebuild has created every graph table.
fn open_built_index(db_path: &Path) -> Result<Option<Connection>> {
    if !db_path.is_file() {
        return Ok(None);
    }
    let connection = connect(db_path)?;
    let present: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('graph_wikis', 'graph_pages', 'graph_links')",
            [],
            |row| row.get(0),
        )
        .context("failed to inspect graph index tables")?;
    Ok((present == GRAPH_TABLE_COUNT).then_some(connection))
}

fn row_count(connection: &Connection, table: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("failed to count rows of {table}"))?;
    usize::try_from(count).with_context(|| format!("{table} row count is negative"))
}

fn pages_by_wiki(connection: &Connection) -> Result<BTreeMap<String, usize>> {
    let mut statement = connection
        .prepare(
            "SELECT w.wiki_id, COUNT(p.title)
             FROM graph_wikis w
             LEFT JOIN graph_pages p ON p.wiki_id = w.wiki_id
             GROUP BY w.wiki_id
             ORDER BY w.wiki_id ASC",
        )
        .context("failed to prepare per-wiki page count query")?;
    let rows = statement
        .query_map([], |row| {
            let wiki: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((wiki, count))
        })
        .context("failed to run per-wiki page count query")?;

    let mut out = BTreeMap::new();
    for row in rows {
        let (wiki, count) = row.context("failed to read per-wiki page count row")?;
        let count = usize::try_from(count).context("page count does not fit into usize")?;
        out.insert(wiki, count);
    }
    Ok(out)
}
