use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const DIRECTORY_FILE: &str = "src/assets/wiki.gg.json";
pub const PAGES_DIR: &str = "src/assets/wiki.gg";
pub const LOGOS_DIR: &str = "public/wiki.gg";
pub const STATE_DIR: &str = ".wikigg";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const INDEX_FILENAME: &str = "graph.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub output_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// Where every artifact of a harvest lives on disk.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub output_root: PathBuf,
    pub directory_file: PathBuf,
    pub pages_dir: PathBuf,
    pub logos_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub index_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl DatasetLayout {
    pub fn under(output_root: &Path) -> Self {
        let state_dir = output_root.join(STATE_DIR);
        Self {
            output_root: output_root.to_path_buf(),
            directory_file: output_root.join(DIRECTORY_FILE),
            pages_dir: output_root.join(PAGES_DIR),
            logos_dir: output_root.join(LOGOS_DIR),
            config_path: state_dir.join(CONFIG_FILENAME),
            index_path: state_dir.join(INDEX_FILENAME),
            state_dir,
            root_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn site_output_path(&self, wiki_id: &str) -> PathBuf {
        self.pages_dir.join(format!("{}.json", file_stem(wiki_id)))
    }

    pub fn logo_path(&self, wiki_id: &str) -> PathBuf {
        self.logos_dir.join(format!("{}.png", file_stem(wiki_id)))
    }

    /// Create the output directories a harvest writes into.
    pub fn ensure_output_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        let directory_parent = self
            .directory_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_root.clone());
        for dir in [&directory_parent, &self.pages_dir, &self.logos_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                created.push(dir.clone());
            }
        }
        Ok(created)
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "output_root={} ({})\ndirectory_file={}\npages_dir={}\nlogos_dir={}\nconfig_path={} ({})\nindex_path={}",
            normalize_for_display(&self.output_root),
            self.root_source.as_str(),
            normalize_for_display(&self.directory_file),
            normalize_for_display(&self.pages_dir),
            normalize_for_display(&self.logos_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.index_path),
        )
    }
}

/// Resolve the layout: flag > WIKIGG_OUTPUT_ROOT > current directory.
pub fn resolve_layout(overrides: &PathOverrides) -> Result<DatasetLayout> {
    let cwd = env::current_dir().context("failed to read current directory")?;
    let (output_root, root_source) = match &overrides.output_root {
        Some(path) => (absolutize(&cwd, path), ValueSource::Flag),
        None => match env::var("WIKIGG_OUTPUT_ROOT") {
            Ok(value) if !value.trim().is_empty() => {
                (absolutize(&cwd, Path::new(value.trim())), ValueSource::Env)
            }
            _ => (cwd.clone(), ValueSource::Default),
        },
    };

    let mut layout = DatasetLayout::under(&output_root);
    layout.root_source = root_source;
    if let Some(config) = &overrides.config {
        layout.config_path = absolutize(&cwd, config);
        layout.config_source = ValueSource::Flag;
    }
    Ok(layout)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Wiki ids come from the directory; keep them to one path component.
fn file_stem(wiki_id: &str) -> String {
    wiki_id.replace(['/', '\\'], "_")
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
