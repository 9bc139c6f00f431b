//! Lookup over the harvested directory listing.

use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use serde::Serialize;

use crate::model::WikiRecord;

pub const DEFAULT_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit<'a> {
    pub wiki: &'a WikiRecord,
    /// Edit distance between the wiki name and the raw query.
    pub distance: usize,
}

pub struct WikiSearch {
    matcher: SkimMatcherV2,
}

impl Default for WikiSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl WikiSearch {
    pub fn new() -> Self {
        Self {
            matcher: SkimMatcherV2::default(),
        }
    }

    /// True when every character of `query` occurs in `name` in order,
    /// ignoring case. An empty query matches everything.
    pub fn matches(&self, name: &str, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }
        self.matcher
            .fuzzy_match(&name.to_lowercase(), &query.to_lowercase())
            .is_some()
    }

    /// Matching wikis, closest name first. The `limit` cut happens before
    /// wikis without a logo are dropped, so they still take up a slot.
    pub fn search<'a>(
        &self,
        records: &'a [WikiRecord],
        query: &str,
        limit: usize,
    ) -> Vec<SearchHit<'a>> {
        let mut hits: Vec<SearchHit<'a>> = records
            .iter()
            .filter(|wiki| self.matches(&wiki.name, query))
            .map(|wiki| SearchHit {
                wiki,
                distance: strsim::levenshtein(&wiki.name, query),
            })
            .collect();
        // Stable: equal distances keep directory order.
        hits.sort_by_key(|hit| hit.distance);
        hits.truncate(limit);
        hits.retain(|hit| hit.wiki.logo.is_some());
        hits
    }
}

pub fn search_wikis<'a>(records: &'a [WikiRecord], query: &str, limit: usize) -> Vec<SearchHit<'a>> {
    WikiSearch::new().search(records, query, limit)
}

pub fn find_wiki<'a>(records: &'a [WikiRecord], id: &str) -> Option<&'a WikiRecord> {
    records.iter().find(|wiki| wiki.id == id)
}
