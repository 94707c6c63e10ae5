use std::sync::Arc;

use log::{info, warn};
use tokio::sync::RwLock;

use crate::config::{Config, POOL_FLOOR, SYNCHRONOUS_WARMUP_TAGS};
use crate::db::models::Filters;
use crate::db::Db;
use crate::face::FaceDetector;
use crate::fetch_scheduler::{self, IngestOutcome};
use crate::source::Source;
use crate::thumbnail::ThumbnailStore;

/// A point-in-time snapshot of tags whose pool has been confirmed ready.
/// HTTP handlers read a [`snapshot`](Self::snapshot) rather than iterating
/// a live-mutating list, so a tag that finishes warming up mid-request
/// can't produce a torn read.
#[derive(Clone)]
pub struct TagList {
    inner: Arc<RwLock<Vec<String>>>,
}

impl TagList {
    pub fn new(tags: Vec<String>) -> Self {
        TagList {
            inner: Arc::new(RwLock::new(tags)),
        }
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.read().await.clone()
    }

    async fn push(&self, tag: String) {
        self.inner.write().await.push(tag);
    }
}

/// Drives a tag's pool up to [`POOL_FLOOR`] by repeatedly calling the fetch
/// pipeline, stopping early if the adapter reports it has nothing further
/// to offer (a tag that can never reach the floor shouldn't spin
/// forever). Returns whether the tag ended up usable.
async fn warm_up_tag(
    db: &Db,
    source: &Source,
    detector: &dyn FaceDetector,
    thumbnails: &ThumbnailStore,
    tag: &str,
    ratings: &[crate::db::models::Rating],
) -> bool {
    let filters = Filters {
        tag: tag.to_string(),
        ratings: ratings.to_vec(),
    };

    loop {
        match db.count_matching(&filters).await {
            Ok(n) if n >= POOL_FLOOR => return true,
            Ok(_) => {}
            Err(e) => {
                warn!("captchouli: could not count pool for tag {tag}: {e}");
                return false;
            }
        }

        match fetch_scheduler::ingest_once(db, source, detector, thumbnails, tag).await {
            Ok(IngestOutcome::Terminal) => {
                let n = db.count_matching(&filters).await.unwrap_or(0);
                return n >= POOL_FLOOR;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("captchouli: warmup fetch for tag {tag} failed: {e}");
                return false;
            }
        }
    }
}

/// Warms up every configured tag: the first
/// [`SYNCHRONOUS_WARMUP_TAGS`] are brought to the floor before this
/// function returns (the server only starts serving once they're ready),
/// the remainder are warmed in the background and appended to the returned
/// [`TagList`] as each one succeeds.
pub async fn warm_up(
    config: &Config,
    db: Db,
    source: Arc<Source>,
    detector: Arc<dyn FaceDetector>,
    thumbnails: ThumbnailStore,
) -> TagList {
    let split = config.tags.len().min(SYNCHRONOUS_WARMUP_TAGS);
    let (head, tail) = config.tags.split_at(split);

    let mut synced = Vec::new();
    for tag in head {
        if warm_up_tag(&db, &source, detector.as_ref(), &thumbnails, tag, &config.ratings).await {
            info!("captchouli: tag '{tag}' ready");
            synced.push(tag.clone());
        } else {
            warn!("captchouli: tag '{tag}' could not reach the pool floor at startup");
        }
    }

    let tag_list = TagList::new(synced);

    for tag in tail.to_vec() {
        let db = db.clone();
        let source = source.clone();
        let detector = detector.clone();
        let thumbnails = thumbnails.clone();
        let ratings = config.ratings.clone();
        let tag_list = tag_list.clone();
        tokio::spawn(async move {
            if warm_up_tag(&db, &source, detector.as_ref(), &thumbnails, &tag, &ratings).await {
                info!("captchouli: tag '{tag}' ready (background warmup)");
                tag_list.push(tag).await;
            } else {
                warn!("captchouli: tag '{tag}' could not reach the pool floor");
            }
        });
    }

    tag_list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Rating, Source as BooruSource};
    use crate::face::FakeFaceDetector;
    use crate::source::FakeClient;
    use std::collections::HashMap;

    #[tokio::test]
    async fn warm_up_tag_succeeds_once_floor_images_exist() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..POOL_FLOOR {
            let md5 = [i as u8 + 1; 16];
            db.insert_image(&md5, Rating::Safe, BooruSource::Gelbooru, "cirno", &["cirno".to_string()])
                .await
                .unwrap();
        }
        let source = Source::new(Box::new(FakeClient {
            pages: std::sync::Mutex::new(HashMap::new()),
            bytes: vec![],
            max_pages: 1,
        }));
        let detector = FakeFaceDetector { faces: vec![] };
        let dir = tempfile::tempdir().unwrap();
        let thumbnails = ThumbnailStore::new(dir.path());

        let ready = warm_up_tag(&db, &source, &detector, &thumbnails, "cirno", &[Rating::Safe]).await;
        assert!(ready);
    }

    #[tokio::test]
    async fn warm_up_tag_gives_up_when_adapter_has_no_match() {
        let db = Db::open_in_memory().unwrap();
        let source = Source::new(Box::new(FakeClient {
            pages: std::sync::Mutex::new(HashMap::new()),
            bytes: vec![],
            max_pages: 200,
        }));
        let detector = FakeFaceDetector { faces: vec![] };
        let dir = tempfile::tempdir().unwrap();
        let thumbnails = ThumbnailStore::new(dir.path());

        let ready = warm_up_tag(&db, &source, &detector, &thumbnails, "nobody", &[Rating::Safe]).await;
        assert!(!ready);
    }

    #[tokio::test]
    async fn snapshot_reflects_pushed_tags() {
        let list = TagList::new(vec!["a".to_string()]);
        list.push("b".to_string()).await;
        assert_eq!(list.snapshot().await, vec!["a".to_string(), "b".to_string()]);
    }
}
