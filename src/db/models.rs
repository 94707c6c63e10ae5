use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Explicitness rating of a sourced image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rating {
    Safe = 0,
    Questionable = 1,
    Explicit = 2,
}

impl Rating {
    pub fn all() -> [Rating; 3] {
        [Rating::Safe, Rating::Questionable, Rating::Explicit]
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Rating::Safe => "safe",
            Rating::Questionable => "questionable",
            Rating::Explicit => "explicit",
        };
        write!(f, "{s}")
    }
}

impl ToSql for Rating {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as i64))
    }
}

impl FromSql for Rating {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(Rating::Safe),
            1 => Ok(Rating::Questionable),
            2 => Ok(Rating::Explicit),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// Remote booru a given image/tag row was sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Gelbooru = 0,
    Danbooru = 1,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Source::Gelbooru => "gelbooru",
            Source::Danbooru => "danbooru",
        };
        write!(f, "{s}")
    }
}

impl ToSql for Source {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as i64))
    }
}

impl FromSql for Source {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(Source::Gelbooru),
            1 => Ok(Source::Danbooru),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// Captcha lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptchaStatus {
    Unsolved = 0,
    Solved = 1,
    Failed = 2,
}

impl ToSql for CaptchaStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as i64))
    }
}

impl FromSql for CaptchaStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(CaptchaStatus::Unsolved),
            1 => Ok(CaptchaStatus::Solved),
            2 => Ok(CaptchaStatus::Failed),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// A fully ingested image: content-addressed by MD5, either a real row with
/// at least one tag or a blacklisted tombstone with zero tags.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: i64,
    pub md5: [u8; 16],
    pub rating: Rating,
    pub source: Source,
    pub target_tag: String,
    pub blacklisted: bool,
    pub tags: Vec<String>,
}

impl Image {
    pub fn is_tombstone(&self) -> bool {
        self.blacklisted && self.tags.is_empty()
    }
}

/// A candidate discovered by a source adapter, awaiting thumbnailing.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub md5: [u8; 16],
    pub rating: Rating,
    pub url: String,
    pub target_tag: String,
    pub tags: Vec<String>,
}

/// Filters applied when selecting images for captcha generation.
#[derive(Debug, Clone)]
pub struct Filters {
    pub tag: String,
    pub ratings: Vec<Rating>,
}

pub fn hex_encode(md5: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for b in md5 {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn hex_decode(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let md5 = [0xabu8; 16];
        let s = hex_encode(&md5);
        assert_eq!(s.len(), 32);
        assert_eq!(hex_decode(&s), Some(md5));
    }

    #[test]
    fn hex_decode_rejects_bad_length() {
        assert_eq!(hex_decode("abcd"), None);
    }
}
