use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::db::models::{PendingImage, Source as BooruSourceKind};
use crate::db::Db;
use crate::error::Error;

use super::{Candidate, HARD_BLACKLIST_TERMS};

/// Extensions accepted for the full-resolution remote file; anything else
/// is a non-image format (e.g. `.webm`) and blacklists the MD5 outright.
const ALLOWED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png"];

/// Runs the 8-step candidate-acceptance pipeline for every
/// post on one fetched page, against the tag `target_tag` the page was
/// fetched for. Work is split across CPU-count worker threads since posts
/// are independent of each other; the first worker error cancels the rest
/// rather than letting every worker run to completion against an already
/// failing backend.
pub async fn filter_page(
    db: &Db,
    source_kind: BooruSourceKind,
    target_tag: &str,
    candidates: Vec<Candidate>,
) -> Result<usize, Error> {
    let handle = tokio::runtime::Handle::current();
    let cancel = AtomicBool::new(false);
    let accepted_count = Mutex::new(0usize);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);

    std::thread::scope(|scope| {
        let worker_count = num_cpus::get().max(1);
        for chunk in chunk_for_workers(candidates, worker_count) {
            let handle = handle.clone();
            let cancel = &cancel;
            let accepted_count = &accepted_count;
            let first_error = &first_error;
            scope.spawn(move || {
                for c in chunk {
                    if cancel.load(Ordering::SeqCst) {
                        return;
                    }
                    match handle.block_on(process_one(db, source_kind, target_tag, c)) {
                        Ok(true) => *accepted_count.lock().unwrap() += 1,
                        Ok(false) => {}
                        Err(e) => {
                            *first_error.lock().unwrap() = Some(e);
                            cancel.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            });
        }
    });

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }
    Ok(accepted_count.into_inner().unwrap())
}

/// Returns `Ok(true)` iff the candidate survived every rule and was
/// enqueued to `pending_images`; `Ok(false)` for a silent skip (already
/// known, or blacklisted outright).
async fn process_one(
    db: &Db,
    source_kind: BooruSourceKind,
    target_tag: &str,
    c: Candidate,
) -> Result<bool, Error> {
    // Step 1 (missing/invalid MD5 -> skip) is handled by the booru client's
    // response parsing, which never yields a `Candidate` without one.

    // Step 2: skip duplicates (already stored or already pending).
    if db.find_image_by_md5(&c.md5).await?.is_some() || db.is_pending(&c.md5).await? {
        return Ok(false);
    }

    // Step 3: file extension.
    let lower_url = c.file_url.to_lowercase();
    if !ALLOWED_EXTENSIONS.iter().any(|ext| lower_url.ends_with(ext)) {
        db.blacklist_md5(&c.md5, c.rating, source_kind, target_tag)
            .await?;
        return Ok(false);
    }

    // Step 4: exactly one Character tag, matching the requested tag.
    let matches_target = c
        .character_tags
        .iter()
        .any(|t| t.eq_ignore_ascii_case(target_tag));
    if c.character_tags.len() != 1 || !matches_target {
        db.blacklist_md5(&c.md5, c.rating, source_kind, target_tag)
            .await?;
        return Ok(false);
    }

    // Step 5: hard-blacklist terms.
    let lower_tags: Vec<String> = c.tags.iter().map(|t| t.to_lowercase()).collect();
    if HARD_BLACKLIST_TERMS
        .iter()
        .any(|term| lower_tags.iter().any(|t| t == term))
    {
        db.blacklist_md5(&c.md5, c.rating, source_kind, target_tag)
            .await?;
        return Ok(false);
    }

    // Step 6: `solo` must appear.
    if !lower_tags.iter().any(|t| t == "solo") {
        db.blacklist_md5(&c.md5, c.rating, source_kind, target_tag)
            .await?;
        return Ok(false);
    }

    // Step 7: the target tag itself must be present in the full tag list.
    if !lower_tags.iter().any(|t| t == target_tag) {
        db.blacklist_md5(&c.md5, c.rating, source_kind, target_tag)
            .await?;
        return Ok(false);
    }

    // Step 8: accept.
    db.enqueue_pending(&PendingImage {
        md5: c.md5,
        rating: c.rating,
        url: c.file_url,
        target_tag: target_tag.to_string(),
        tags: c.tags,
    })
    .await?;
    Ok(true)
}

fn chunk_for_workers<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let mut out: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        out[i % workers].push(item);
    }
    out.into_iter().filter(|c| !c.is_empty()).collect()
}
