use std::env;
use std::path::PathBuf;

use crate::db::models::{Rating, Source};

/// Minimum non-blacklisted image count per tag for the tag to be usable.
pub const POOL_FLOOR: i64 = 6;

/// Number of configured tags the pool manager warms up synchronously on
/// startup before backgrounding the remainder.
pub const SYNCHRONOUS_WARMUP_TAGS: usize = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub root_dir: PathBuf,
    pub tags: Vec<String>,
    pub ratings: Vec<Rating>,
    pub source: Source,
}

impl Config {
    /// Build configuration from environment variables, with defaults matching
    /// the original CLI's defaults (`-a :8512`, Safe-only ratings).
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let listen_addr = env::var("CAPTCHOULI_ADDR").unwrap_or_else(|_| ":8512".to_string());

        let root_dir = env::var("CAPTCHOULI_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_root_dir());

        let tags: Vec<String> = env::var("CAPTCHOULI_TAGS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let explicit = env::var("CAPTCHOULI_EXPLICIT")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);
        let ratings = if explicit {
            vec![Rating::Safe, Rating::Questionable, Rating::Explicit]
        } else {
            vec![Rating::Safe]
        };

        let source = match env::var("CAPTCHOULI_SOURCE")
            .unwrap_or_else(|_| "gelbooru".to_string())
            .to_lowercase()
            .as_str()
        {
            "danbooru" => Source::Danbooru,
            _ => Source::Gelbooru,
        };

        Ok(Config {
            listen_addr,
            root_dir,
            tags,
            ratings,
            source,
        })
    }

    /// Apply CLI flag overrides (`-a`, `-e`, `-t`) on top of env-derived
    /// defaults. Mirrors the original `cmd/captchouli` flag set.
    pub fn apply_cli_overrides(
        &mut self,
        addr: Option<String>,
        explicit: bool,
        tags: Option<Vec<String>>,
    ) {
        if let Some(addr) = addr {
            self.listen_addr = addr;
        }
        if explicit {
            self.ratings = vec![Rating::Safe, Rating::Questionable, Rating::Explicit];
        }
        if let Some(tags) = tags {
            self.tags = tags.into_iter().map(|t| t.trim().to_lowercase()).collect();
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root_dir.join("db.db")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root_dir.join("images")
    }
}

fn default_root_dir() -> PathBuf {
    if cfg!(windows) {
        let appdata = env::var("APPDATA").unwrap_or_default();
        PathBuf::from(appdata).join("captchouli")
    } else {
        let home = env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(".captchouli")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_cli_overrides_replaces_tags_and_ratings() {
        let mut cfg = Config {
            listen_addr: ":8512".to_string(),
            root_dir: PathBuf::from("/tmp/captchouli"),
            tags: vec!["cirno".to_string()],
            ratings: vec![Rating::Safe],
            source: Source::Gelbooru,
        };

        cfg.apply_cli_overrides(
            Some(":9000".to_string()),
            true,
            Some(vec!["Patchouli_Knowledge".to_string(), "Reimu".to_string()]),
        );

        assert_eq!(cfg.listen_addr, ":9000");
        assert_eq!(cfg.tags, vec!["patchouli_knowledge", "reimu"]);
        assert_eq!(
            cfg.ratings,
            vec![Rating::Safe, Rating::Questionable, Rating::Explicit]
        );
    }
}
