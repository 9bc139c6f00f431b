//! Per-wiki crawls over the MediaWiki API.
//!
//! Both crawls are lazy: nothing is requested until the iterator is polled,
//! and each `next()` issues at most the requests needed for one item. The
//! first error ends the crawl.

use std::collections::VecDeque;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use indicatif::ProgressBar;
use serde_json::Value;
use tracing::debug;

use crate::config::DEFAULT_PAGE_DELAY_MS;
use crate::mediawiki::{
    ListedPage, SiteApi, fetch_allpages, fetch_links, fetch_parsed_page, fetch_revision_content,
};
use crate::model::{GraphItem, LinkEdge, PageRecord};
use crate::pager::{BoxedPager, Items, paginate_boxed};

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Pause after each page of the content crawl, before the next request.
    pub page_delay: Duration,
    pub progress: ProgressBar,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            progress: ProgressBar::hidden(),
        }
    }
}

impl CrawlOptions {
    pub fn unthrottled() -> Self {
        Self {
            page_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Outer `list=allpages` walk shared by both crawls.
struct Listing<'a> {
    batches: BoxedPager<'a, ListedPage, String>,
    pending: VecDeque<ListedPage>,
    progress: ProgressBar,
}

impl<'a> Listing<'a> {
    fn new<A: SiteApi + ?Sized>(api: &'a A, host: String, progress: ProgressBar) -> Self {
        let batches = paginate_boxed(move |cursor: Option<&String>| {
            fetch_allpages(api, &host, cursor.map(String::as_str))
        });
        if progress.length().is_none() {
            progress.set_length(0);
        }
        Self {
            batches,
            pending: VecDeque::new(),
            progress,
        }
    }

    /// Next listed page, pulling another batch when the current one is spent.
    /// The total grows as batches arrive since the page count is unknown upfront.
    fn next_page(&mut self) -> Option<Result<ListedPage>> {
        loop {
            if let Some(page) = self.pending.pop_front() {
                return Some(Ok(page));
            }
            match self.batches.next() {
                Some(Ok(batch)) => {
                    debug!(pages = batch.len(), "allpages batch fetched");
                    self.progress.inc_length(batch.len() as u64);
                    self.pending.extend(batch);
                }
                Some(Err(error)) => return Some(Err(error)),
                None => {
                    self.progress.finish();
                    return None;
                }
            }
        }
    }
}

/// Content crawl: one raw `action=parse` response per page.
pub struct PageCrawl<'a, A: ?Sized> {
    api: &'a A,
    host: String,
    listing: Listing<'a>,
    page_delay: Duration,
    fetched_any: bool,
    failed: bool,
}

pub fn crawl_pages<'a, A: SiteApi + ?Sized>(
    api: &'a A,
    host: &str,
    options: CrawlOptions,
) -> PageCrawl<'a, A> {
    PageCrawl {
        api,
        host: host.to_string(),
        listing: Listing::new(api, host.to_string(), options.progress),
        page_delay: options.page_delay,
        fetched_any: false,
        failed: false,
    }
}

impl<A: SiteApi + ?Sized> Iterator for PageCrawl<'_, A> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        // The pause follows every yielded page, whichever request comes next.
        if self.fetched_any && !self.page_delay.is_zero() {
            sleep(self.page_delay);
        }
        let page = match self.listing.next_page()? {
            Ok(page) => page,
            Err(error) => return Some(Err(self.fail(error))),
        };

        match fetch_parsed_page(self.api, &self.host, &page.title) {
            Ok(parsed) => {
                self.fetched_any = true;
                self.listing.progress.inc(1);
                Some(Ok(parsed))
            }
            Err(error) => Some(Err(self.fail(error))),
        }
    }
}

impl<A: ?Sized> PageCrawl<'_, A> {
    fn fail(&mut self, error: anyhow::Error) -> anyhow::Error {
        self.failed = true;
        self.listing.progress.abandon();
        error.context(format!("page crawl of {} aborted", self.host))
    }
}

struct LinkDrain<'a> {
    source: String,
    targets: Items<BoxedPager<'a, String, String>, String>,
}

/// Graph crawl: each page record followed by every edge leaving it.
pub struct GraphCrawl<'a, A: ?Sized> {
    api: &'a A,
    host: String,
    listing: Listing<'a>,
    links: Option<LinkDrain<'a>>,
    failed: bool,
}

pub fn crawl_graph<'a, A: SiteApi + ?Sized>(
    api: &'a A,
    host: &str,
    options: CrawlOptions,
) -> GraphCrawl<'a, A> {
    GraphCrawl {
        api,
        host: host.to_string(),
        listing: Listing::new(api, host.to_string(), options.progress),
        links: None,
        failed: false,
    }
}

impl<'a, A: SiteApi + ?Sized + 'a> GraphCrawl<'a, A> {
    fn drain_links(&self, page: &ListedPage) -> LinkDrain<'a> {
        let api = self.api;
        let host = self.host.clone();
        let page_id = page.pageid;
        let targets = paginate_boxed(move |cursor: Option<&String>| {
            fetch_links(api, &host, page_id, cursor.map(String::as_str))
        })
        .items();
        LinkDrain {
            source: page.title.clone(),
            targets,
        }
    }

    fn fail(&mut self, error: anyhow::Error) -> anyhow::Error {
        self.failed = true;
        self.links = None;
        self.listing.progress.abandon();
        error.context(format!("graph crawl of {} aborted", self.host))
    }
}

impl<A: SiteApi + ?Sized> Iterator for GraphCrawl<'_, A> {
    type Item = Result<GraphItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if let Some(drain) = self.links.as_mut() {
            match drain.targets.next() {
                Some(Ok(target)) => {
                    return Some(Ok(GraphItem::Link(LinkEdge {
                        source: drain.source.clone(),
                        target,
                    })));
                }
                Some(Err(error)) => return Some(Err(self.fail(error))),
                None => self.links = None,
            }
        }

        let page = match self.listing.next_page()? {
            Ok(page) => page,
            Err(error) => return Some(Err(self.fail(error))),
        };
        match fetch_revision_content(self.api, &self.host, page.pageid) {
            Ok(content) => {
                self.links = Some(self.drain_links(&page));
                self.listing.progress.inc(1);
                Some(Ok(GraphItem::Page(PageRecord {
                    page_id: page.pageid,
                    title: page.title,
                    content,
                })))
            }
            Err(error) => Some(Err(self.fail(error))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    use anyhow::bail;
    use indicatif::ProgressBar;
    use serde_json::{Value, json};

    use super::{CrawlOptions, crawl_graph, crawl_pages};
    use crate::mediawiki::SiteApi;
    use crate::model::{GraphItem, LinkEdge, PageRecord};

    const HOST: &str = "https://example.wiki.gg";

    #[derive(Default)]
    struct ScriptedSite {
        allpages: BTreeMap<Option<String>, Value>,
        parses: BTreeMap<String, Value>,
        revisions: BTreeMap<String, Value>,
        links: BTreeMap<(String, Option<String>), Value>,
        log: RefCell<Vec<String>>,
        sent_at: RefCell<Vec<Instant>>,
    }

    impl ScriptedSite {
        fn log(&self) -> Vec<String> {
            self.log.borrow().clone()
        }

        fn listing(
            mut self,
            cursor: Option<&str>,
            pages: &[(i64, &str)],
            next: Option<&str>,
        ) -> Self {
            let allpages: Vec<Value> = pages
                .iter()
                .map(|(id, title)| json!({"pageid": id, "ns": 0, "title": title}))
                .collect();
            let mut payload = json!({"query": {"allpages": allpages}});
            if let Some(next) = next {
                payload["continue"] = json!({"apcontinue": next, "continue": "-||"});
            }
            self.allpages.insert(cursor.map(ToString::to_string), payload);
            self
        }

        fn revision(mut self, page_id: i64, content: &str) -> Self {
            self.revisions.insert(
                page_id.to_string(),
                json!({"query": {"pages": {page_id.to_string(): {
                    "revisions": [{"slots": {"main": {"contentmodel": "wikitext", "*": content}}}]
                }}}}),
            );
            self
        }

        fn page_links(
            mut self,
            page_id: i64,
            cursor: Option<&str>,
            targets: &[&str],
            next: Option<&str>,
        ) -> Self {
            let links: Vec<Value> = targets
                .iter()
                .map(|title| json!({"ns": 0, "title": title}))
                .collect();
            let mut payload = json!({"query": {"pages": {page_id.to_string(): {"links": links}}}});
            if let Some(next) = next {
                payload["continue"] = json!({"plcontinue": next, "continue": "||"});
            }
            self.links
                .insert((page_id.to_string(), cursor.map(ToString::to_string)), payload);
            self
        }
    }

    impl SiteApi for ScriptedSite {
        fn get_json(&self, host: &str, params: &[(&str, String)]) -> anyhow::Result<Value> {
            assert_eq!(host, HOST);
            let get = |key: &str| {
                params
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, value)| value.clone())
            };
            let action = get("action");
            let (entry, payload) = match (action.as_deref(), get("list"), get("prop").as_deref()) {
                (Some("query"), Some(list), _) if list == "allpages" => {
                    let cursor = get("apcontinue");
                    let entry = match &cursor {
                        Some(cursor) => format!("allpages:{cursor}"),
                        None => "allpages".to_string(),
                    };
                    (entry, self.allpages.get(&cursor).cloned())
                }
                (Some("parse"), _, _) => {
                    let title = get("page").unwrap_or_default();
                    (format!("parse:{title}"), self.parses.get(&title).cloned())
                }
                (Some("query"), _, Some("revisions")) => {
                    let id = get("pageids").unwrap_or_default();
                    (format!("revisions:{id}"), self.revisions.get(&id).cloned())
                }
                (Some("query"), _, Some("links")) => {
                    let id = get("pageids").unwrap_or_default();
                    let cursor = get("plcontinue");
                    let entry = match &cursor {
                        Some(cursor) => format!("links:{id}:{cursor}"),
                        None => format!("links:{id}"),
                    };
                    (entry, self.links.get(&(id, cursor)).cloned())
                }
                _ => bail!("unexpected request {params:?}"),
            };
            self.log.borrow_mut().push(entry.clone());
            self.sent_at.borrow_mut().push(Instant::now());
            match payload {
                Some(payload) => Ok(payload),
                None => bail!("no scripted response for {entry}"),
            }
        }
    }

    fn parse_response(title: &str) -> Value {
        json!({"parse": {"title": title, "pageid": 1, "text": {"*": format!("<p>{title}</p>")}}})
    }

    #[test]
    fn graph_crawl_yields_page_then_its_links() {
        let site = ScriptedSite::default()
            .listing(None, &[(1, "A")], None)
            .revision(1, "see [[B]]")
            .page_links(1, None, &["B"], None);

        let items = crawl_graph(&site, HOST, CrawlOptions::unthrottled())
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("crawl");

        assert_eq!(
            items,
            vec![
                GraphItem::Page(PageRecord {
                    page_id: 1,
                    title: "A".to_string(),
                    content: Some("see [[B]]".to_string()),
                }),
                GraphItem::Link(LinkEdge {
                    source: "A".to_string(),
                    target: "B".to_string(),
                }),
            ]
        );
    }

    #[test]
    fn link_pagination_drains_before_the_next_page() {
        let site = ScriptedSite::default()
            .listing(None, &[(1, "A")], Some("B"))
            .listing(Some("B"), &[(2, "B")], None)
            .revision(1, "a")
            .revision(2, "b")
            .page_links(1, None, &["B", "C"], Some("1|0|D"))
            .page_links(1, Some("1|0|D"), &["D", "B"], None)
            .page_links(2, None, &[], None);

        let items = crawl_graph(&site, HOST, CrawlOptions::unthrottled())
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("crawl");

        let targets: Vec<&str> = items
            .iter()
            .filter_map(GraphItem::as_link)
            .map(|edge| edge.target.as_str())
            .collect();
        assert_eq!(targets, vec!["B", "C", "D", "B"]);
        assert_eq!(items.iter().filter_map(GraphItem::as_page).count(), 2);
        assert_eq!(items.last().and_then(GraphItem::as_page).map(|p| p.page_id), Some(2));
        assert_eq!(
            site.log(),
            vec![
                "allpages",
                "revisions:1",
                "links:1",
                "links:1:1|0|D",
                "allpages:B",
                "revisions:2",
                "links:2",
            ]
        );
    }

    #[test]
    fn graph_crawl_tolerates_missing_revision_slots() {
        let mut site = ScriptedSite::default()
            .listing(None, &[(7, "Legacy")], None)
            .page_links(7, None, &[], None);
        site.revisions.insert(
            "7".to_string(),
            json!({"query": {"pages": {"7": {"revisions": [{"revid": 3}]}}}}),
        );

        let items = crawl_graph(&site, HOST, CrawlOptions::unthrottled())
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("crawl");
        assert_eq!(
            items,
            vec![GraphItem::Page(PageRecord {
                page_id: 7,
                title: "Legacy".to_string(),
                content: None,
            })]
        );
    }

    #[test]
    fn graph_crawl_is_lazy() {
        let site = ScriptedSite::default()
            .listing(None, &[(1, "A"), (2, "B")], None)
            .revision(1, "a")
            .page_links(1, None, &["B"], None);

        let mut crawl = crawl_graph(&site, HOST, CrawlOptions::unthrottled());
        assert!(site.log().is_empty());
        let first = crawl.next().expect("first").expect("page");
        assert!(first.as_page().is_some());
        assert_eq!(site.log(), vec!["allpages", "revisions:1"]);
    }

    #[test]
    fn link_error_aborts_the_graph_crawl() {
        let mut site = ScriptedSite::default()
            .listing(None, &[(1, "A"), (2, "B")], None)
            .revision(1, "a")
            .revision(2, "b");
        site.links.insert(
            ("1".to_string(), None),
            json!({"error": {"code": "badvalue", "info": "bad"}}),
        );

        let mut crawl = crawl_graph(&site, HOST, CrawlOptions::unthrottled());
        assert!(crawl.next().expect("page").is_ok());
        let error = crawl.next().expect("error").expect_err("must fail");
        assert!(format!("{error:#}").contains("badvalue"));
        assert!(crawl.next().is_none());
        assert!(!site.log().contains(&"revisions:2".to_string()));
    }

    #[test]
    fn page_crawl_yields_raw_parse_responses_in_listing_order() {
        let mut site = ScriptedSite::default()
            .listing(None, &[(1, "Alpha"), (2, "Beta")], Some("Gamma"))
            .listing(Some("Gamma"), &[(3, "Gamma")], None);
        for title in ["Alpha", "Beta", "Gamma"] {
            site.parses.insert(title.to_string(), parse_response(title));
        }

        let items = crawl_pages(&site, HOST, CrawlOptions::unthrottled())
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("crawl");

        assert_eq!(
            items,
            vec![
                parse_response("Alpha"),
                parse_response("Beta"),
                parse_response("Gamma"),
            ]
        );
        assert_eq!(
            site.log(),
            vec![
                "allpages",
                "parse:Alpha",
                "parse:Beta",
                "allpages:Gamma",
                "parse:Gamma",
            ]
        );
    }

    #[test]
    fn page_crawl_progress_total_grows_per_listing_batch() {
        let mut site = ScriptedSite::default()
            .listing(None, &[(1, "Alpha"), (2, "Beta")], Some("Gamma"))
            .listing(Some("Gamma"), &[(3, "Gamma")], None);
        for title in ["Alpha", "Beta", "Gamma"] {
            site.parses.insert(title.to_string(), parse_response(title));
        }
        let progress = ProgressBar::hidden();
        let options = CrawlOptions {
            progress: progress.clone(),
            ..CrawlOptions::unthrottled()
        };

        let mut crawl = crawl_pages(&site, HOST, options);
        crawl.next().expect("first").expect("ok");
        assert_eq!(progress.length(), Some(2));
        assert_eq!(progress.position(), 1);

        assert_eq!(crawl.by_ref().filter(Result::is_ok).count(), 2);
        assert_eq!(progress.length(), Some(3));
        assert_eq!(progress.position(), 3);
    }

    #[test]
    fn listing_terminates_only_when_continuation_is_absent() {
        let mut site = ScriptedSite::default()
            .listing(None, &[], Some("x"))
            .listing(Some("x"), &[], Some("y"))
            .listing(Some("y"), &[(1, "Alpha")], None);
        site.parses
            .insert("Alpha".to_string(), parse_response("Alpha"));

        let count = crawl_pages(&site, HOST, CrawlOptions::unthrottled())
            .filter(Result::is_ok)
            .count();
        assert_eq!(count, 1);
        assert_eq!(
            site.log(),
            vec!["allpages", "allpages:x", "allpages:y", "parse:Alpha"]
        );
    }

    #[test]
    fn empty_apcontinue_ends_the_listing() {
        let mut site = ScriptedSite::default()
            .listing(None, &[(1, "Alpha")], Some(""))
            .listing(Some(""), &[(1, "Alpha")], Some(""));
        site.parses
            .insert("Alpha".to_string(), parse_response("Alpha"));

        let count = crawl_pages(&site, HOST, CrawlOptions::unthrottled())
            .take(5)
            .filter(Result::is_ok)
            .count();
        assert_eq!(count, 1);
        assert_eq!(site.log(), vec!["allpages", "parse:Alpha"]);
    }

    #[test]
    fn empty_plcontinue_ends_the_link_walk() {
        let site = ScriptedSite::default()
            .listing(None, &[(1, "A")], None)
            .revision(1, "[[B]]")
            .page_links(1, None, &["B"], Some(""))
            .page_links(1, Some(""), &["B"], Some(""));

        let items = crawl_graph(&site, HOST, CrawlOptions::unthrottled())
            .take(6)
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("crawl");

        assert_eq!(items.len(), 2);
        assert_eq!(site.log(), vec!["allpages", "revisions:1", "links:1"]);
    }

    #[test]
    fn parse_error_stops_the_page_crawl() {
        let mut site =
            ScriptedSite::default().listing(None, &[(1, "Alpha"), (2, "Beta"), (3, "Gamma")], None);
        site.parses
            .insert("Alpha".to_string(), parse_response("Alpha"));
        site.parses.insert(
            "Beta".to_string(),
            json!({"error": {"code": "missingtitle", "info": "The page you specified doesn't exist."}}),
        );

        let mut crawl = crawl_pages(&site, HOST, CrawlOptions::unthrottled());
        assert!(crawl.next().expect("alpha").is_ok());
        let error = crawl.next().expect("beta").expect_err("must fail");
        let message = format!("{error:#}");
        assert!(message.contains("missingtitle"));
        assert!(message.contains(HOST));
        assert!(crawl.next().is_none());
        assert!(!site.log().contains(&"parse:Gamma".to_string()));
    }

    #[test]
    fn listing_error_stops_the_page_crawl() {
        let mut site = ScriptedSite::default();
        site.allpages.insert(
            None,
            json!({"error": {"code": "readapidenied", "info": "denied"}}),
        );

        let results: Vec<_> = crawl_pages(&site, HOST, CrawlOptions::unthrottled()).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn page_crawl_throttles_between_pages() {
        let mut site =
            ScriptedSite::default().listing(None, &[(1, "A"), (2, "B"), (3, "C")], None);
        for title in ["A", "B", "C"] {
            site.parses.insert(title.to_string(), parse_response(title));
        }
        let options = CrawlOptions {
            page_delay: Duration::from_millis(20),
            ..CrawlOptions::default()
        };

        let started = Instant::now();
        let count = crawl_pages(&site, HOST, options).filter(Result::is_ok).count();
        assert_eq!(count, 3);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn throttle_also_delays_the_next_listing_batch() {
        let mut site = ScriptedSite::default()
            .listing(None, &[(1, "A")], Some("B"))
            .listing(Some("B"), &[(2, "B")], None);
        for title in ["A", "B"] {
            site.parses.insert(title.to_string(), parse_response(title));
        }
        let delay = Duration::from_millis(25);
        let options = CrawlOptions {
            page_delay: delay,
            ..CrawlOptions::default()
        };

        let count = crawl_pages(&site, HOST, options).filter(Result::is_ok).count();
        assert_eq!(count, 2);
        assert_eq!(site.log(), vec!["allpages", "parse:A", "allpages:B", "parse:B"]);
        let sent_at = site.sent_at.borrow();
        assert!(sent_at[2].duration_since(sent_at[1]) >= delay);
    }
}
