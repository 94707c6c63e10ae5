use rand::Rng;
use rusqlite::{params, OptionalExtension};

use crate::error::Error;

use super::models::{PendingImage, Rating};
use super::pool::Db;

/// Staging table for images a source adapter has found but not yet
/// downloaded/face-cropped. Rows are consumed one at a time by the fetch
/// scheduler via [`Db::pop_random_pending`] and removed once processed
/// (accepted into `images`, blacklisted, or discarded as a duplicate).
impl Db {
    pub async fn enqueue_pending(&self, img: &PendingImage) -> Result<(), Error> {
        let guard = self.write().await?;
        guard.conn.execute(
            "INSERT OR IGNORE INTO pending_images (md5, rating, url, target_tag, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s','now'))",
            params![
                img.md5.to_vec(),
                img.rating,
                img.url,
                img.target_tag,
                img.tags.join(",")
            ],
        )?;
        Ok(())
    }

    pub async fn is_pending(&self, md5: &[u8; 16]) -> Result<bool, Error> {
        let guard = self.read().await?;
        let count: i64 = guard.conn.query_row(
            "SELECT COUNT(*) FROM pending_images WHERE md5 = ?1",
            params![md5.to_vec()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn count_pending(&self, target_tag: &str) -> Result<i64, Error> {
        let guard = self.read().await?;
        let count: i64 = guard.conn.query_row(
            "SELECT COUNT(*) FROM pending_images WHERE target_tag = ?1",
            params![target_tag],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Pops one pending row for `target_tag` at a uniformly random offset,
    /// inside a single writer transaction: count, pick `[0, count)`, select
    /// the row at that offset ordered by md5, delete it, return it. `None`
    /// if the tag currently has no pending rows.
    pub async fn pop_random_pending(
        &self,
        target_tag: &str,
    ) -> Result<Option<PendingImage>, Error> {
        let guard = self.write().await?;
        let conn = &guard.conn;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_images WHERE target_tag = ?1",
            params![target_tag],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Ok(None);
        }

        let offset = rand::rng().random_range(0..count);
        let row = conn
            .query_row(
                "SELECT id, md5, rating, url, target_tag, tags FROM pending_images
                 WHERE target_tag = ?1 ORDER BY md5 LIMIT 1 OFFSET ?2",
                params![target_tag, offset],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Rating>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, md5_vec, rating, url, target_tag, tags_csv)) = row else {
            return Ok(None);
        };

        conn.execute("DELETE FROM pending_images WHERE id = ?1", params![id])?;

        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&md5_vec);
        let tags = tags_csv
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Some(PendingImage {
            md5,
            rating,
            url,
            target_tag,
            tags,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(md5: u8, tag: &str) -> PendingImage {
        PendingImage {
            md5: [md5; 16],
            rating: Rating::Safe,
            url: format!("https://example.test/{md5}.jpg"),
            target_tag: tag.to_string(),
            tags: vec![tag.to_string(), "solo".to_string()],
        }
    }

    #[tokio::test]
    async fn pop_random_pending_returns_none_when_empty() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.pop_random_pending("cirno").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_random_pending_removes_the_row() {
        let db = Db::open_in_memory().unwrap();
        db.enqueue_pending(&pending(1, "cirno")).await.unwrap();
        assert_eq!(db.count_pending("cirno").await.unwrap(), 1);

        let popped = db.pop_random_pending("cirno").await.unwrap().unwrap();
        assert_eq!(popped.md5, [1u8; 16]);
        assert_eq!(db.count_pending("cirno").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pop_random_pending_only_considers_matching_tag() {
        let db = Db::open_in_memory().unwrap();
        db.enqueue_pending(&pending(1, "cirno")).await.unwrap();
        db.enqueue_pending(&pending(2, "reimu")).await.unwrap();

        let popped = db.pop_random_pending("reimu").await.unwrap().unwrap();
        assert_eq!(popped.md5, [2u8; 16]);
        assert_eq!(db.count_pending("cirno").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn is_pending_reflects_enqueued_rows() {
        let db = Db::open_in_memory().unwrap();
        assert!(!db.is_pending(&[9u8; 16]).await.unwrap());
        db.enqueue_pending(&pending(9, "cirno")).await.unwrap();
        assert!(db.is_pending(&[9u8; 16]).await.unwrap());
    }
}
