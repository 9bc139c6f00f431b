use serde::{Deserialize, Serialize};

/// One wiki registered in the wiki.gg directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WikiRecord {
    pub id: String,
    pub name: String,
    /// Base URL of the wiki; `api.php` lives directly under it.
    pub host: String,
    pub logo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_id: i64,
    pub title: String,
    #[serde(rename = "page_content")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEdge {
    pub source: String,
    pub target: String,
}

/// Element of the graph stream: pages interleaved with the edges leaving them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GraphItem {
    Page(PageRecord),
    Link(LinkEdge),
}

impl GraphItem {
    pub fn as_page(&self) -> Option<&PageRecord> {
        match self {
            Self::Page(page) => Some(page),
            Self::Link(_) => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkEdge> {
        match self {
            Self::Link(edge) => Some(edge),
            Self::Page(_) => None,
        }
    }
}
