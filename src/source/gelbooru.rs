use std::io::Read as _;

use serde::Deserialize;

use crate::db::models::{hex_decode, Rating, Source as BooruSourceKind};
use crate::error::Error;

use super::{BooruClient, Candidate};

const API_BASE: &str = "https://gelbooru.com/index.php";
const PAGE_LIMIT: u32 = 100;

/// Fixed negative-filter expression Gelbooru-like sources prepend to every
/// search.
const NEGATIVE_FILTER: &str =
    "solo -photo -monochrome -multiple_girls -couple -multiple_boys -cosplay -objectification";

/// Upper bound on useful pages for Gelbooru.
const INITIAL_MAX_PAGES: u32 = 200;

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    post: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    md5: String,
    file_url: String,
    rating: String,
    tags: String,
}

/// Gelbooru API client (`posts & q=index` JSON endpoint). Pagination is
/// 0-indexed server-side, matching the page indices `Source::fetch_one`
/// already tracks.
///
/// Gelbooru's basic search response does not carry tag categories, so
/// `character_tags` is approximated: a post's tag list intersected with
/// the set of tags this service is configured to recognize as characters
/// (documented in DESIGN.md).
pub struct GelbooruClient {
    agent: ureq::Agent,
    known_tags: Vec<String>,
}

impl GelbooruClient {
    pub fn new(known_tags: Vec<String>) -> Self {
        GelbooruClient {
            agent: ureq::Agent::new_with_defaults(),
            known_tags,
        }
    }
}

impl BooruClient for GelbooruClient {
    fn search_page(&self, tag_expr: &str, page: u32) -> Result<Vec<Candidate>, Error> {
        let url = format!(
            "{API_BASE}?page=dapi&s=post&q=index&json=1&limit={PAGE_LIMIT}&pid={page}&tags={tag_expr}"
        );

        let body: PostsResponse = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| Error::Transient(e.to_string()))?
            .body_mut()
            .read_json()
            .map_err(|e| Error::Transient(format!("invalid gelbooru response: {e}")))?;

        Ok(body
            .post
            .into_iter()
            .filter_map(|p| {
                let md5 = hex_decode(&p.md5)?;
                let rating = parse_rating(&p.rating);
                let tags: Vec<String> = p.tags.split_whitespace().map(str::to_string).collect();
                let character_tags = tags
                    .iter()
                    .filter(|t| self.known_tags.iter().any(|k| k.eq_ignore_ascii_case(t)))
                    .cloned()
                    .collect();
                Some(Candidate {
                    md5,
                    file_url: p.file_url,
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
        format!("{NEGATIVE_FILTER} {tag}")
    }

    fn initial_max_pages(&self) -> u32 {
        INITIAL_MAX_PAGES
    }

    fn source_kind(&self) -> BooruSourceKind {
        BooruSourceKind::Gelbooru
    }
}

fn parse_rating(s: &str) -> Rating {
    match s {
        "explicit" | "e" => Rating::Explicit,
        "questionable" | "q" => Rating::Questionable,
        _ => Rating::Safe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rating_maps_short_and_long_forms() {
        assert_eq!(parse_rating("safe"), Rating::Safe);
        assert_eq!(parse_rating("q"), Rating::Questionable);
        assert_eq!(parse_rating("explicit"), Rating::Explicit);
        assert_eq!(parse_rating("unknown"), Rating::Safe);
    }

    #[test]
    fn compose_tag_expression_prepends_negative_filter() {
        let client = GelbooruClient::new(vec!["cirno".to_string()]);
        let expr = client.compose_tag_expression("cirno");
        assert!(expr.starts_with(NEGATIVE_FILTER));
        assert!(expr.ends_with("cirno"));
    }
}
