use std::thread::{self, JoinHandle};
use std::time::Duration;

use clokwerk::{Job, Scheduler, TimeUnits};
use log::{error, info};

use super::pool::Db;

/// Captchas older than this are swept away regardless of status.
pub const CAPTCHA_MAX_AGE_SECS: i64 = 30 * 60;

/// Deletes captchas older than [`CAPTCHA_MAX_AGE_SECS`]. Errors are logged,
/// never propagated — upkeep must never take the service down.
async fn sweep_expired(db: &Db) {
    match db.prune_captchas(CAPTCHA_MAX_AGE_SECS).await {
        Ok(pruned) if pruned > 0 => info!("captchouli: expiry sweep pruned {pruned} captchas"),
        Ok(_) => {}
        Err(e) => error!("captchouli: expiry sweep failed: {e}"),
    }
}

async fn run_vacuum(db: &Db) {
    if let Err(e) = db.vacuum().await {
        error!("captchouli: vacuum failed: {e}");
    }
}

/// Spawns the upkeep background thread: expiry sweep every minute, `VACUUM`
/// every hour, on `clokwerk`'s polling scheduler.
pub fn spawn(db: Db) -> JoinHandle<()> {
    let mut scheduler = Scheduler::new();

    let sweep_db = db.clone();
    scheduler.every(1.minute()).run(move || {
        let db = sweep_db.clone();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(sweep_expired(&db));
    });

    let vacuum_db = db;
    scheduler.every(1.hour()).run(move || {
        let db = vacuum_db.clone();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(run_vacuum(&db));
    });

    thread::spawn(move || loop {
        scheduler.run_pending();
        thread::sleep(Duration::from_secs(1));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_runs_without_error_on_empty_db() {
        let db = Db::open_in_memory().unwrap();
        sweep_expired(&db).await;
    }

    #[tokio::test]
    async fn vacuum_runs_without_error_on_empty_db() {
        let db = Db::open_in_memory().unwrap();
        run_vacuum(&db).await;
    }

    #[tokio::test]
    async fn prune_keeps_fresh_rows() {
        let db = Db::open_in_memory().unwrap();
        db.insert_captcha(&[1u8; 64], "cirno", &[0, 1, 2, 3])
            .await
            .unwrap();
        sweep_expired(&db).await;
        assert!(db.find_captcha(&[1u8; 64]).await.unwrap().is_some());
    }
}
