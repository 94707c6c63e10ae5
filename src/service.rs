use std::sync::Arc;

use log::info;

use crate::captcha::CaptchaEngine;
use crate::config::Config;
use crate::db::models::Source as BooruSourceKind;
use crate::db::{self, Db};
use crate::error::Error;
use crate::face::{FaceDetector, RustfaceDetector};
use crate::fetch_scheduler::FetchScheduler;
use crate::pool_manager::{self, TagList};
use crate::source::danbooru::DanbooruClient;
use crate::source::gelbooru::GelbooruClient;
use crate::source::Source;
use crate::thumbnail::ThumbnailStore;

/// Everything a request handler needs, assembled once at startup and
/// shared behind an `Arc`: one long-lived process wiring storage, the
/// fetch scheduler, and the HTTP surface together.
pub struct Service {
    pub config: Config,
    pub engine: CaptchaEngine,
    pub scheduler: FetchScheduler,
    pub tags: TagList,
}

impl Service {
    /// Opens storage, selects the configured booru adapter, loads the face
    /// model, brings the first [`crate::config::SYNCHRONOUS_WARMUP_TAGS`]
    /// tags' pools up to the floor, and starts the background fetch
    /// scheduler and upkeep sweeper. Returns once the service is ready to
    /// accept requests for at least its synchronously warmed tags.
    pub async fn bootstrap(config: Config) -> Result<Self, Error> {
        let db = Db::open(&config.root_dir)?;

        let thumbnails = ThumbnailStore::new(config.images_dir());
        std::fs::create_dir_all(config.images_dir())?;

        let source: Arc<Source> = Arc::new(match config.source {
            BooruSourceKind::Gelbooru => {
                Source::new(Box::new(GelbooruClient::new(config.tags.clone())))
            }
            BooruSourceKind::Danbooru => Source::new(Box::new(DanbooruClient::new())),
        });

        let detector: Arc<dyn FaceDetector> = Arc::new(RustfaceDetector::new()?);

        let tags = pool_manager::warm_up(
            &config,
            db.clone(),
            source.clone(),
            detector.clone(),
            thumbnails.clone(),
        )
        .await;

        let scheduler = FetchScheduler::spawn(db.clone(), source, detector, thumbnails.clone());
        db::upkeep::spawn(db.clone());

        let engine = CaptchaEngine::new(db, thumbnails);

        info!(
            "captchouli: ready, {} tag(s) warmed synchronously",
            tags.snapshot().await.len()
        );

        Ok(Service {
            config,
            engine,
            scheduler,
            tags,
        })
    }
}
