use std::io::Read as _;

use serde::Deserialize;

use crate::db::models::{hex_decode, Rating, Source as BooruSourceKind};
use crate::error::Error;

use super::{BooruClient, Candidate};

const API_BASE: &str = "https://danbooru.donmai.us/posts.json";
const PAGE_LIMIT: u32 = 100;

/// Upper bound on useful pages for Danbooru.
const INITIAL_MAX_PAGES: u32 = 300;

#[derive(Debug, Deserialize)]
struct Post {
    md5: Option<String>,
    file_url: Option<String>,
    rating: String,
    tag_string: String,
    #[serde(default)]
    tag_string_character: String,
}

/// Danbooru API client. Unlike Gelbooru, Danbooru omits `md5`/`file_url`
/// for posts it has no local copy of (banned or pending); those are
/// filtered out here rather than surfaced as unusable candidates. Danbooru
/// also exposes `tag_string_character` directly, so `character_tags` here
/// is exact rather than approximated.
pub struct DanbooruClient {
    agent: ureq::Agent,
}

impl DanbooruClient {
    pub fn new() -> Self {
        DanbooruClient {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl Default for DanbooruClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BooruClient for DanbooruClient {
    fn search_page(&self, tag_expr: &str, page: u32) -> Result<Vec<Candidate>, Error> {
        // Danbooru pages are 1-indexed server-side; `fetch_one` tracks
        // pages starting at 0.
        let url = format!(
            "{API_BASE}?limit={PAGE_LIMIT}&page={}&tags={tag_expr}",
            page + 1
        );

        let posts: Vec<Post> = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| Error::Transient(e.to_string()))?
            .body_mut()
            .read_json()
            .map_err(|e| Error::Transient(format!("invalid danbooru response: {e}")))?;

        Ok(posts
            .into_iter()
            .filter_map(|p| {
                let md5 = hex_decode(p.md5.as_deref()?)?;
                let file_url = p.file_url?;
                let rating = parse_rating(&p.rating);
                let tags = p
                    .tag_string
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                let character_tags = p
                    .tag_string_character
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                Some(Candidate {
                    md5,
                    file_url,
                    rating,
                    tags,
                    character_tags,
                })
            })
            .collect())
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, Error> {
        let mut response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| Error::Transient(e.to_string()))?;
        let mut bytes = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| Error::Transient(e.to_string()))?;
        Ok(bytes)
    }

    fn compose_tag_expression(&self, tag: &str) -> String {
        format!("{tag} solo")
    }

    fn initial_max_pages(&self) -> u32 {
        INITIAL_MAX_PAGES
    }

    fn source_kind(&self) -> BooruSourceKind {
        BooruSourceKind::Danbooru
    }
}

fn parse_rating(s: &str) -> Rating {
    match s {
        "e" => Rating::Explicit,
        "q" => Rating::Questionable,
        _ => Rating::Safe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rating_maps_danbooru_single_letter_codes() {
        assert_eq!(parse_rating("g"), Rating::Safe);
        assert_eq!(parse_rating("s"), Rating::Safe);
        assert_eq!(parse_rating("q"), Rating::Questionable);
        assert_eq!(parse_rating("e"), Rating::Explicit);
    }

    #[test]
    fn compose_tag_expression_appends_solo() {
        let client = DanbooruClient::new();
        assert_eq!(client.compose_tag_expression("cirno"), "cirno solo");
    }
}
