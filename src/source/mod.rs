pub mod danbooru;
pub mod filter;
pub mod gelbooru;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::Rng;

use crate::db::models::{PendingImage, Rating};
use crate::db::Db;
use crate::error::Error;

/// A single image listing returned by a booru search, prior to any
/// filtering or download. `character_tags` is the subset of `tags` the
/// client could attribute to the `Character` category; Gelbooru's basic
/// search API does not expose tag categories, so its adapter approximates
/// this from the configured tag list (documented in DESIGN.md).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub md5: [u8; 16],
    pub file_url: String,
    pub rating: Rating,
    pub tags: Vec<String>,
    pub character_tags: Vec<String>,
}

/// Minimal surface an image board client must expose. Kept separate from
/// [`Source`] so tests can substitute an in-memory fake instead of making
/// real HTTP calls.
pub trait BooruClient: Send + Sync {
    /// Fetches one page of results for the composed tag expression.
    /// Gelbooru/Danbooru pagination is both accepted here as 0-indexed,
    /// matching their wire APIs; [`Source::fetch_one`] is the layer that
    /// tracks which indices have been consumed.
    fn search_page(&self, tag_expr: &str, page: u32) -> Result<Vec<Candidate>, Error>;

    /// Downloads the raw image bytes at `url`.
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, Error>;

    /// Composes the board-specific tag expression for a requested tag:
    /// Gelbooru prepends a fixed negative-filter prefix, Danbooru appends
    /// ` solo`.
    fn compose_tag_expression(&self, tag: &str) -> String;

    /// Upper bound on the board's useful pages, used to seed a tag's page
    /// cache the first time it is requested (300 for Danbooru, 200 for
    /// Gelbooru).
    fn initial_max_pages(&self) -> u32;

    /// Which [`crate::db::models::Source`] variant rows sourced through
    /// this client should be tagged with.
    fn source_kind(&self) -> crate::db::models::Source;
}

/// Hard-blacklist terms applied post-fetch regardless of board: any of
/// these appearing in a candidate's tag list blacklists its MD5 outright.
pub const HARD_BLACKLIST_TERMS: &[&str] = &[
    "photo",
    "monochrome",
    "multiple_girls",
    "couple",
    "multiple_boys",
    "cosplay",
    "objectification",
];

struct PageCacheEntry {
    pages_seen: HashSet<u32>,
    max_pages: u32,
}

/// Outcome of one [`Source::fetch_one`] call. `None` means nothing is
/// currently available and is not an error; the caller (fetch
/// scheduler) should just move on to the next tick.
pub enum FetchOutcome {
    /// A pending row was popped and its image downloaded; ready for the
    /// face pipeline.
    Candidate {
        bytes: Vec<u8>,
        pending: PendingImage,
    },
    /// Page fetched (possibly cached) but nothing new to pop yet.
    None,
    /// The tag has no matches at the remote at all; terminal.
    NoMatch,
    /// Every page up to `max_pages` has been consumed; terminal for now.
    AllFetched,
}

/// Wraps a [`BooruClient`] with the per-tag-expression page cache: which
/// page indices have been consumed and the adapter's current estimate of
/// `max_pages`. One `Source` instance is shared by the whole fetch
/// scheduler; a per-process mutex serializes access to the cache map, so
/// one adapter call serializes its own remote access.
pub struct Source {
    client: Box<dyn BooruClient>,
    cache: Mutex<HashMap<String, PageCacheEntry>>,
}

impl Source {
    pub fn new(client: Box<dyn BooruClient>) -> Self {
        Source {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Which [`crate::db::models::Source`] this adapter's rows are tagged
    /// with; the process runs exactly one adapter at a time (chosen by the
    /// `-source` flag), so this is also what the fetch scheduler uses when
    /// inserting/blacklisting image rows it pops through this adapter.
    pub fn kind(&self) -> crate::db::models::Source {
        self.client.source_kind()
    }

    /// Runs the page-selection rule and the pop-and-download step for
    /// `requested_tag`. `db` is needed because filtering writes directly to
    /// `pending_images`/blacklist rows, and the final step pops from the
    /// same table.
    pub async fn fetch_one(&self, db: &Db, requested_tag: &str) -> Result<FetchOutcome, Error> {
        let tag_expr = self.client.compose_tag_expression(requested_tag);

        loop {
            let page = {
                let mut cache = self.cache.lock().unwrap();
                let entry = cache
                    .entry(tag_expr.clone())
                    .or_insert_with(|| PageCacheEntry {
                        pages_seen: HashSet::new(),
                        max_pages: self.client.initial_max_pages(),
                    });

                if entry.max_pages == 0 {
                    return Ok(FetchOutcome::NoMatch);
                }
                if entry.pages_seen.len() as u32 >= entry.max_pages {
                    return Ok(FetchOutcome::AllFetched);
                }

                if entry.pages_seen.is_empty() {
                    0
                } else {
                    rand::rng().random_range(0..entry.max_pages)
                }
            };

            let already_seen = {
                let cache = self.cache.lock().unwrap();
                cache[&tag_expr].pages_seen.contains(&page)
            };
            if already_seen {
                // Cache hit: nothing new from re-fetching this page right
                // now; let the next scheduler tick pick a different one.
                return Ok(FetchOutcome::None);
            }

            let candidates = self.client.search_page(&tag_expr, page)?;

            if candidates.is_empty() {
                let mut cache = self.cache.lock().unwrap();
                let entry = cache.get_mut(&tag_expr).unwrap();
                if page == 0 {
                    entry.max_pages = 0;
                    return Ok(FetchOutcome::NoMatch);
                }
                entry.max_pages = page;
                entry.pages_seen.retain(|&p| p < page);
                continue;
            }

            filter::filter_page(db, self.client.source_kind(), requested_tag, candidates).await?;

            {
                let mut cache = self.cache.lock().unwrap();
                cache.get_mut(&tag_expr).unwrap().pages_seen.insert(page);
            }

            let Some(pending) = db.pop_random_pending(requested_tag).await? else {
                return Ok(FetchOutcome::None);
            };
            let bytes = self.client.fetch_bytes(&pending.url)?;
            return Ok(FetchOutcome::Candidate { bytes, pending });
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub struct FakeClient {
    pub pages: Mutex<HashMap<(String, u32), Vec<Candidate>>>,
    pub bytes: Vec<u8>,
    pub max_pages: u32,
}

#[cfg(any(test, feature = "test-support"))]
impl BooruClient for FakeClient {
    fn search_page(&self, tag_expr: &str, page: u32) -> Result<Vec<Candidate>, Error> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(tag_expr.to_string(), page))
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, Error> {
        Ok(self.bytes.clone())
    }

    fn compose_tag_expression(&self, tag: &str) -> String {
        tag.to_string()
    }

    fn initial_max_pages(&self) -> u32 {
        self.max_pages
    }

    fn source_kind(&self) -> crate::db::models::Source {
        crate::db::models::Source::Gelbooru
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u8, tag: &str) -> Candidate {
        Candidate {
            md5: [n; 16],
            file_url: format!("https://example.test/{n}.jpg"),
            rating: Rating::Safe,
            tags: vec![tag.to_string(), "solo".to_string()],
            character_tags: vec![tag.to_string()],
        }
    }

    #[tokio::test]
    async fn fetch_one_returns_no_match_on_empty_first_page() {
        let client = FakeClient {
            pages: Mutex::new(HashMap::new()),
            bytes: vec![],
            max_pages: 200,
        };
        let source = Source::new(Box::new(client));
        let db = Db::open_in_memory().unwrap();
        match source.fetch_one(&db, "nobody").await.unwrap() {
            FetchOutcome::NoMatch => {}
            _ => panic!("expected NoMatch"),
        }
    }

    #[tokio::test]
    async fn fetch_one_pops_a_candidate_from_first_page() {
        let mut pages = HashMap::new();
        pages.insert(("cirno".to_string(), 0), vec![candidate(1, "cirno")]);
        let client = FakeClient {
            pages: Mutex::new(pages),
            bytes: b"jpeg-bytes".to_vec(),
            max_pages: 200,
        };
        let source = Source::new(Box::new(client));
        let db = Db::open_in_memory().unwrap();

        match source.fetch_one(&db, "cirno").await.unwrap() {
            FetchOutcome::Candidate { bytes, pending } => {
                assert_eq!(bytes, b"jpeg-bytes");
                assert_eq!(pending.md5, [1u8; 16]);
            }
            _ => panic!("expected a candidate"),
        }
    }

    #[tokio::test]
    async fn fetch_one_no_match_when_initial_page_empty() {
        let client = FakeClient {
            pages: Mutex::new(HashMap::new()),
            bytes: vec![],
            max_pages: 1,
        };
        let source = Source::new(Box::new(client));
        let db = Db::open_in_memory().unwrap();

        match source.fetch_one(&db, "solo_tag").await.unwrap() {
            FetchOutcome::NoMatch => {}
            _ => panic!("expected NoMatch"),
        }
    }
}
