use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, Mutex};

use crate::db::Db;
use crate::error::Error;
use crate::face::FaceDetector;
use crate::source::{FetchOutcome, Source};
use crate::thumbnail::ThumbnailStore;

/// A tag the pool manager has asked the scheduler to keep topped up. Two
/// requests for the same tag collapse into one in-flight fetch ("a set of
/// outstanding distinct requests... duplicate enqueues collapse").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchRequest {
    pub tag: String,
}

/// Drives the fetch pipeline of: a buffered request channel, a
/// 1 Hz tick that pops one uniformly random deduplicated request and runs
/// it synchronously end to end (adapter -> face pipeline -> thumbnail
/// store -> image row), and a scheduler set only the scheduler task
/// touches.
pub struct FetchScheduler {
    sender: mpsc::Sender<FetchRequest>,
}

impl FetchScheduler {
    pub fn spawn(
        db: Db,
        source: Arc<Source>,
        detector: Arc<dyn FaceDetector>,
        thumbnails: ThumbnailStore,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(256);
        tokio::spawn(run(db, source, detector, thumbnails, receiver));
        FetchScheduler { sender }
    }

    pub async fn request(&self, tag: &str) -> Result<(), Error> {
        self.sender
            .send(FetchRequest {
                tag: tag.to_string(),
            })
            .await
            .map_err(|e| Error::Transient(e.to_string()))
    }
}

async fn run(
    db: Db,
    source: Arc<Source>,
    detector: Arc<dyn FaceDetector>,
    thumbnails: ThumbnailStore,
    mut receiver: mpsc::Receiver<FetchRequest>,
) {
    let queued: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let dedup_queued = queued.clone();
    tokio::spawn(async move {
        while let Some(req) = receiver.recv().await {
            dedup_queued.lock().await.insert(req.tag);
        }
    });

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let tag = {
            let mut guard = queued.lock().await;
            if guard.is_empty() {
                None
            } else {
                let tags: Vec<&String> = guard.iter().collect();
                let chosen = tags.choose(&mut rand::rng()).map(|s| (*s).clone());
                if let Some(ref t) = chosen {
                    guard.remove(t);
                }
                chosen
            }
        };

        let Some(tag) = tag else { continue };

        if let Err(e) = process_one(&db, &source, detector.as_ref(), &thumbnails, &tag).await {
            warn!("captchouli: fetch for tag {tag} failed: {e}");
        }
    }
}

/// What one [`ingest_once`] call accomplished, for callers (the scheduler
/// tick, the pool manager's warmup loop) that need to tell "keep retrying
/// this tag" apart from "nothing more to do here right now."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IngestOutcome {
    /// A new image row was stored.
    Stored,
    /// A candidate was fetched but had no detectable face; blacklisted.
    Blacklisted,
    /// A page was consulted but produced nothing new to pop yet; calling
    /// again may still make progress.
    NoProgress,
    /// The tag has no matches, or every page has been exhausted; further
    /// calls for this exact tag will not make progress until new pages
    /// appear upstream.
    Terminal,
}

/// Executes one full pipeline step for `tag`: adapter -> face pipeline ->
/// thumbnail store -> image row, the same work a single scheduler tick
/// does. Shared by the scheduler's own tick and the pool manager's
/// synchronous warmup loop.
pub(crate) async fn ingest_once(
    db: &Db,
    source: &Source,
    detector: &dyn FaceDetector,
    thumbnails: &ThumbnailStore,
    tag: &str,
) -> Result<IngestOutcome, Error> {
    match source.fetch_one(db, tag).await? {
        FetchOutcome::None => Ok(IngestOutcome::NoProgress),
        FetchOutcome::NoMatch | FetchOutcome::AllFetched => Ok(IngestOutcome::Terminal),
        FetchOutcome::Candidate { bytes, pending } => match detector.detect_and_crop(&bytes) {
            Ok(cropped) => {
                thumbnails.store(&pending.md5, &cropped)?;
                db.insert_image(
                    &pending.md5,
                    pending.rating,
                    source.kind(),
                    &pending.target_tag,
                    &pending.tags,
                )
                .await?;
                Ok(IngestOutcome::Stored)
            }
            Err(Error::NoFace) => {
                db.blacklist_md5(
                    &pending.md5,
                    pending.rating,
                    source.kind(),
                    &pending.target_tag,
                )
                .await?;
                Ok(IngestOutcome::Blacklisted)
            }
            Err(e) => Err(e),
        },
    }
}

/// Thin logging wrapper around [`ingest_once`] for the scheduler's own
/// tick, which (unlike the pool manager) doesn't need the outcome value.
async fn process_one(
    db: &Db,
    source: &Source,
    detector: &dyn FaceDetector,
    thumbnails: &ThumbnailStore,
    tag: &str,
) -> Result<(), Error> {
    match ingest_once(db, source, detector, thumbnails, tag).await? {
        IngestOutcome::Stored => debug!("captchouli: stored new image for tag {tag}"),
        IngestOutcome::Blacklisted => {
            debug!("captchouli: blacklisted {tag} candidate with no detected face")
        }
        IngestOutcome::NoProgress => {
            debug!("captchouli: tag {tag} had nothing new to fetch this tick")
        }
        IngestOutcome::Terminal => {
            debug!("captchouli: tag {tag} has no more available pages right now")
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_request_equality_is_by_tag() {
        let a = FetchRequest {
            tag: "cirno".to_string(),
        };
        let b = FetchRequest {
            tag: "cirno".to_string(),
        };
        assert_eq!(a, b);
    }
}
