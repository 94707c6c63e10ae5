use rand::seq::SliceRandom;
use rand::{RngCore, TryRngCore};

use crate::config::Config;
use crate::db::models::{hex_encode, Filters, Rating};
use crate::db::Db;
use crate::error::Error;
use crate::fetch_scheduler::FetchScheduler;
use crate::thumbnail::ThumbnailStore;

/// Number of matching cells a generated captcha carries: 4 out of 9 grid cells.
const MATCHING_CELLS: usize = 4;
/// Number of non-matching "foil" cells: 5 out of 9.
const FOIL_CELLS: usize = 5;
/// Grid size: 3x3.
const GRID_SIZE: usize = MATCHING_CELLS + FOIL_CELLS;
/// Upper bound on how many distinct configured tags generation will try
/// before giving up ("bounded retry").
const MAX_TAG_RETRIES: usize = 8;

/// Outcome of a freshly generated captcha: the 64-byte id handed to the
/// client and the 9 thumbnail data URIs to embed in the HTML grid, in
/// shuffled order.
pub struct GeneratedCaptcha {
    pub id: [u8; 64],
    pub tag: String,
    pub images: [String; GRID_SIZE],
}

/// Result of [`CaptchaEngine::check_solution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Solved,
    WrongSolution,
    Expired,
}

/// The captcha lifecycle: generation, verification, status,
/// and anti-replay, layered on [`Db`] and [`ThumbnailStore`].
pub struct CaptchaEngine {
    db: Db,
    thumbnails: ThumbnailStore,
}

impl CaptchaEngine {
    pub fn new(db: Db, thumbnails: ThumbnailStore) -> Self {
        CaptchaEngine { db, thumbnails }
    }

    /// Direct storage access for callers (tests, future admin routes) that
    /// need to inspect captcha/image rows the engine's own API doesn't
    /// expose.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Generates a captcha for one tag drawn uniformly from `tags`,
    /// retrying with a different tag if the chosen
    /// tag's pool is too thin, up to [`MAX_TAG_RETRIES`] attempts. Any tag
    /// found too thin gets a fetch request enqueued so the pool manager's
    /// background replenishment can catch up.
    pub async fn generate_captcha(
        &self,
        config: &Config,
        tags: &[String],
        scheduler: &FetchScheduler,
    ) -> Result<GeneratedCaptcha, Error> {
        if tags.is_empty() {
            return Err(Error::InsufficientPool);
        }

        let mut order: Vec<&String> = tags.iter().collect();
        order.shuffle(&mut rand::rng());

        for tag in order.into_iter().take(MAX_TAG_RETRIES.min(tags.len())) {
            let filters = Filters {
                tag: tag.clone(),
                ratings: config.ratings.clone(),
            };

            let matching_count = self.db.count_matching(&filters).await?;
            if matching_count < crate::config::POOL_FLOOR {
                // Below the warmup floor: ask the scheduler to top this tag
                // back up, but still fall through to generation below if
                // there are enough matching cells. The floor is a warmup
                // target, not the generation precondition.
                let _ = scheduler.request(tag).await;
            }
            if matching_count < MATCHING_CELLS as i64 {
                continue;
            }

            if let Some(result) = self.try_generate_for_tag(tag, &config.ratings).await? {
                return Ok(result);
            }
        }

        Err(Error::InsufficientPool)
    }

    async fn try_generate_for_tag(
        &self,
        tag: &str,
        ratings: &[Rating],
    ) -> Result<Option<GeneratedCaptcha>, Error> {
        let filters = Filters {
            tag: tag.to_string(),
            ratings: ratings.to_vec(),
        };

        let mut matched = Vec::with_capacity(MATCHING_CELLS);
        let mut seen_ids = std::collections::HashSet::new();
        // Distinct matching images drawn by repeated random sampling; bail
        // out (retry a different tag) if the pool can't yield enough
        // distinct rows despite passing the floor check (e.g. a race with
        // concurrent blacklisting).
        for _ in 0..(MATCHING_CELLS * 4) {
            if matched.len() == MATCHING_CELLS {
                break;
            }
            let Some(img) = self.db.random_image(&filters).await? else {
                break;
            };
            if seen_ids.insert(img.id) {
                matched.push(img);
            }
        }
        if matched.len() != MATCHING_CELLS {
            return Ok(None);
        }

        let foils = self.db.random_foils(tag, ratings, FOIL_CELLS).await?;
        if foils.len() != FOIL_CELLS {
            return Ok(None);
        }

        let mut all_md5: Vec<[u8; 16]> = matched.iter().map(|img| img.md5).chain(foils.iter().map(|img| img.md5)).collect();
        let matched_set: std::collections::HashSet<[u8; 16]> =
            matched.iter().map(|img| img.md5).collect();

        // Captcha contents are a security boundary: shuffle with the OS CSPRNG,
        // never a non-cryptographic RNG.
        crypto_shuffle(&mut all_md5);

        // Single linear scan marking matches; matched images were deduped by
        // id above so no MD5 in all_md5 can repeat, ruling out a
        // duplicate-write here.
        let mut solution = Vec::with_capacity(MATCHING_CELLS);
        for (i, md5) in all_md5.iter().enumerate() {
            if matched_set.contains(md5) {
                solution.push(i);
            }
        }
        debug_assert_eq!(solution.len(), MATCHING_CELLS);

        let mut images: [String; GRID_SIZE] = Default::default();
        for (i, md5) in all_md5.iter().enumerate() {
            images[i] = self
                .thumbnails
                .data_uri(md5)
                .unwrap_or_else(|_| String::new());
        }

        let id = generate_captcha_id();
        self.db.insert_captcha(&id, tag, &solution).await?;

        Ok(Some(GeneratedCaptcha {
            id,
            tag: tag.to_string(),
            images,
        }))
    }

    /// Verifies `selection` (the set of checked grid indices) against the
    /// stored solution for `id`, transitioning status exactly once. At most
    /// one missed matching cell is tolerated; any false positive (a selected
    /// index not in the solution) fails it.
    pub async fn check_solution(
        &self,
        id: &[u8; 64],
        selection: &[usize],
    ) -> Result<VerifyOutcome, Error> {
        let selected: std::collections::HashSet<usize> = selection
            .iter()
            .copied()
            .filter(|i| *i < GRID_SIZE)
            .collect();

        let result = self
            .db
            .check_and_transition(id, |_tag, correct| {
                let correct: std::collections::HashSet<usize> = correct.iter().copied().collect();
                let false_positives = selected.difference(&correct).count();
                let matched = correct.intersection(&selected).count();
                false_positives == 0 && matched + 1 >= correct.len()
            })
            .await?;

        Ok(match result {
            crate::db::CheckResult::Expired => VerifyOutcome::Expired,
            crate::db::CheckResult::AlreadyDecided => VerifyOutcome::WrongSolution,
            crate::db::CheckResult::Decided { solved: true } => VerifyOutcome::Solved,
            crate::db::CheckResult::Decided { solved: false } => VerifyOutcome::WrongSolution,
        })
    }

    /// Anti-replay: atomically deletes the captcha row iff
    /// its status is `Solved`. Returns whether a row was removed.
    pub async fn consume_solved(&self, id: &[u8; 64]) -> Result<bool, Error> {
        self.db.delete_if_solved(id).await
    }
}

/// 64 cryptographically random bytes, unique and unguessable.
fn generate_captcha_id() -> [u8; 64] {
    let mut id = [0u8; 64];
    rand::rngs::OsRng
        .try_fill_bytes(&mut id)
        .expect("OS RNG failure generating captcha id");
    id
}

/// Fisher-Yates shuffle driven by the OS CSPRNG: the
/// final cell ordering is a security boundary, not just cosmetic.
fn crypto_shuffle<T>(items: &mut [T]) {
    let mut rng = rand::rngs::OsRng;
    for i in (1..items.len()).rev() {
        let mut buf = [0u8; 8];
        rng.try_fill_bytes(&mut buf)
            .expect("OS RNG failure during shuffle");
        let j = (u64::from_le_bytes(buf) % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

pub fn hex(md5: &[u8; 16]) -> String {
    hex_encode(md5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Source as BooruSource;
    use crate::face::FakeFaceDetector;
    use crate::source::{FakeClient, Source};
    use std::collections::HashMap;

    async fn seeded_db_and_thumbnails(tag: &str, matching: usize, foils: usize) -> (Db, ThumbnailStore, tempfile::TempDir) {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let thumbnails = ThumbnailStore::new(dir.path());

        for i in 0..matching {
            let md5 = [i as u8 + 1; 16];
            db.insert_image(&md5, Rating::Safe, BooruSource::Gelbooru, tag, &[tag.to_string()])
                .await
                .unwrap();
            thumbnails.store(&md5, b"fake-jpeg").unwrap();
        }
        for i in 0..foils {
            let md5 = [100 + i as u8; 16];
            db.insert_image(
                &md5,
                Rating::Safe,
                BooruSource::Gelbooru,
                "someone_else",
                &["someone_else".to_string()],
            )
            .await
            .unwrap();
            thumbnails.store(&md5, b"fake-jpeg").unwrap();
        }

        (db, thumbnails, dir)
    }

    fn scheduler(db: Db) -> FetchScheduler {
        let source = Source::new(Box::new(FakeClient {
            pages: std::sync::Mutex::new(HashMap::new()),
            bytes: vec![],
            max_pages: 1,
        }));
        let detector = FakeFaceDetector { faces: vec![] };
        let thumbs = ThumbnailStore::new(std::env::temp_dir());
        FetchScheduler::spawn(
            db,
            std::sync::Arc::new(source),
            std::sync::Arc::new(detector),
            thumbs,
        )
    }

    #[tokio::test]
    async fn generate_then_verify_correct_solution_is_solved() {
        let (db, thumbnails, _dir) = seeded_db_and_thumbnails("cirno", 6, 5).await;
        let engine = CaptchaEngine::new(db.clone(), thumbnails);
        let config = Config {
            listen_addr: ":8512".into(),
            root_dir: std::env::temp_dir(),
            tags: vec!["cirno".to_string()],
            ratings: vec![Rating::Safe],
            source: BooruSource::Gelbooru,
        };
        let sched = scheduler(db.clone());

        let generated = engine
            .generate_captcha(&config, &config.tags, &sched)
            .await
            .unwrap();
        assert_eq!(generated.tag, "cirno");
        assert_eq!(generated.images.len(), GRID_SIZE);

        let row = db.find_captcha(&generated.id).await.unwrap().unwrap();
        let correct = row.correct.clone();
        assert_eq!(correct.len(), MATCHING_CELLS);

        let outcome = engine.check_solution(&generated.id, &correct).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Solved);
    }

    #[tokio::test]
    async fn check_solution_tolerates_one_missed_cell() {
        let (db, thumbnails, _dir) = seeded_db_and_thumbnails("cirno", 6, 5).await;
        let engine = CaptchaEngine::new(db.clone(), thumbnails);
        let config = Config {
            listen_addr: ":8512".into(),
            root_dir: std::env::temp_dir(),
            tags: vec!["cirno".to_string()],
            ratings: vec![Rating::Safe],
            source: BooruSource::Gelbooru,
        };
        let sched = scheduler(db.clone());
        let generated = engine
            .generate_captcha(&config, &config.tags, &sched)
            .await
            .unwrap();
        let row = db.find_captcha(&generated.id).await.unwrap().unwrap();
        let mut almost = row.correct.clone();
        almost.pop();

        let outcome = engine.check_solution(&generated.id, &almost).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Solved);
    }

    #[tokio::test]
    async fn check_solution_rejects_false_positive() {
        let (db, thumbnails, _dir) = seeded_db_and_thumbnails("cirno", 6, 5).await;
        let engine = CaptchaEngine::new(db.clone(), thumbnails);
        let config = Config {
            listen_addr: ":8512".into(),
            root_dir: std::env::temp_dir(),
            tags: vec!["cirno".to_string()],
            ratings: vec![Rating::Safe],
            source: BooruSource::Gelbooru,
        };
        let sched = scheduler(db.clone());
        let generated = engine
            .generate_captcha(&config, &config.tags, &sched)
            .await
            .unwrap();
        let row = db.find_captcha(&generated.id).await.unwrap().unwrap();
        let wrong_index = (0..GRID_SIZE).find(|i| !row.correct.contains(i)).unwrap();
        let mut with_false_positive = row.correct.clone();
        with_false_positive.push(wrong_index);

        let outcome = engine
            .check_solution(&generated.id, &with_false_positive)
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::WrongSolution);
    }

    #[tokio::test]
    async fn verification_is_monotonic_after_first_check() {
        let (db, thumbnails, _dir) = seeded_db_and_thumbnails("cirno", 6, 5).await;
        let engine = CaptchaEngine::new(db.clone(), thumbnails);
        let config = Config {
            listen_addr: ":8512".into(),
            root_dir: std::env::temp_dir(),
            tags: vec!["cirno".to_string()],
            ratings: vec![Rating::Safe],
            source: BooruSource::Gelbooru,
        };
        let sched = scheduler(db.clone());
        let generated = engine
            .generate_captcha(&config, &config.tags, &sched)
            .await
            .unwrap();
        let row = db.find_captcha(&generated.id).await.unwrap().unwrap();

        let first = engine.check_solution(&generated.id, &row.correct).await.unwrap();
        assert_eq!(first, VerifyOutcome::Solved);
        let second = engine.check_solution(&generated.id, &row.correct).await.unwrap();
        assert_eq!(second, VerifyOutcome::WrongSolution);
    }

    #[tokio::test]
    async fn consume_solved_is_idempotent() {
        let (db, thumbnails, _dir) = seeded_db_and_thumbnails("cirno", 6, 5).await;
        let engine = CaptchaEngine::new(db.clone(), thumbnails);
        let config = Config {
            listen_addr: ":8512".into(),
            root_dir: std::env::temp_dir(),
            tags: vec!["cirno".to_string()],
            ratings: vec![Rating::Safe],
            source: BooruSource::Gelbooru,
        };
        let sched = scheduler(db.clone());
        let generated = engine
            .generate_captcha(&config, &config.tags, &sched)
            .await
            .unwrap();
        let row = db.find_captcha(&generated.id).await.unwrap().unwrap();
        engine.check_solution(&generated.id, &row.correct).await.unwrap();

        assert!(engine.consume_solved(&generated.id).await.unwrap());
        assert!(!engine.consume_solved(&generated.id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_id_is_expired() {
        let (db, thumbnails, _dir) = seeded_db_and_thumbnails("cirno", 6, 5).await;
        let engine = CaptchaEngine::new(db, thumbnails);
        let outcome = engine.check_solution(&[9u8; 64], &[0, 1, 2, 3]).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Expired);
    }

    #[tokio::test]
    async fn generates_below_the_warmup_floor_if_enough_matching_cells_exist() {
        // Exactly MATCHING_CELLS images: below POOL_FLOOR (6), but still
        // enough to fill the four matching grid cells.
        let (db, thumbnails, _dir) = seeded_db_and_thumbnails("cirno", MATCHING_CELLS, 5).await;
        let engine = CaptchaEngine::new(db.clone(), thumbnails);
        let config = Config {
            listen_addr: ":8512".into(),
            root_dir: std::env::temp_dir(),
            tags: vec!["cirno".to_string()],
            ratings: vec![Rating::Safe],
            source: BooruSource::Gelbooru,
        };
        let sched = scheduler(db);

        let generated = engine
            .generate_captcha(&config, &config.tags, &sched)
            .await
            .unwrap();
        assert_eq!(generated.tag, "cirno");
    }
}
