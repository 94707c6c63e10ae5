use rusqlite::{params, OptionalExtension};

use crate::config::POOL_FLOOR;
use crate::error::Error;

use super::models::{Filters, Image, Rating};
use super::pool::Db;

impl Db {
    /// Looks up an image (real or tombstone) by MD5, if one exists.
    pub async fn find_image_by_md5(&self, md5: &[u8; 16]) -> Result<Option<Image>, Error> {
        let guard = self.read().await?;
        let conn = &guard.conn;
        let row = conn
            .query_row(
                "SELECT id, md5, rating, source, target_tag, blacklisted FROM images WHERE md5 = ?1",
                params![md5.to_vec()],
                |row| {
                    let md5_vec: Vec<u8> = row.get(1)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        md5_vec,
                        row.get::<_, Rating>(2)?,
                        row.get::<_, super::models::Source>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, md5_vec, rating, source, target_tag, blacklisted)) = row else {
            return Ok(None);
        };

        let mut tags_stmt = conn.prepare("SELECT tag FROM tags WHERE image_id = ?1")?;
        let tags = tags_stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&md5_vec);

        Ok(Some(Image {
            id,
            md5,
            rating,
            source,
            target_tag,
            blacklisted,
            tags,
        }))
    }

    /// Inserts a new real image with its tags. Errors if the MD5 already
    /// exists (caller should check `find_image_by_md5` first to decide
    /// between insert and skip).
    pub async fn insert_image(
        &self,
        md5: &[u8; 16],
        rating: Rating,
        source: super::models::Source,
        target_tag: &str,
        tags: &[String],
    ) -> Result<i64, Error> {
        let guard = self.write().await?;
        let conn = &guard.conn;
        conn.execute(
            "INSERT INTO images (md5, rating, source, target_tag, blacklisted) VALUES (?1, ?2, ?3, ?4, 0)",
            params![md5.to_vec(), rating, source, target_tag],
        )?;
        let id = conn.last_insert_rowid();
        for tag in tags {
            conn.execute(
                "INSERT OR IGNORE INTO tags (image_id, tag) VALUES (?1, ?2)",
                params![id, tag],
            )?;
        }
        Ok(id)
    }

    /// Inserts a blacklist tombstone: a row with `blacklisted = 1` and no
    /// tags, so the same MD5 is never refetched or reconsidered.
    pub async fn blacklist_md5(
        &self,
        md5: &[u8; 16],
        rating: Rating,
        source: super::models::Source,
        target_tag: &str,
    ) -> Result<(), Error> {
        let guard = self.write().await?;
        guard.conn.execute(
            "INSERT INTO images (md5, rating, source, target_tag, blacklisted) VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT (md5) DO UPDATE SET blacklisted = 1",
            params![md5.to_vec(), rating, source, target_tag],
        )?;
        Ok(())
    }

    /// Counts non-blacklisted images matching the given tag/rating filters.
    /// Used by the pool manager to decide whether a tag has cleared
    /// [`POOL_FLOOR`](crate::config::POOL_FLOOR).
    pub async fn count_matching(&self, filters: &Filters) -> Result<i64, Error> {
        let guard = self.read().await?;
        let placeholders: Vec<String> = filters.ratings.iter().map(|_| "?".to_string()).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM images
             WHERE blacklisted = 0 AND target_tag = ? AND rating IN ({})",
            placeholders.join(",")
        );
        let mut stmt = guard.conn.prepare(&sql)?;
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(filters.tag.clone())];
        for r in &filters.ratings {
            args.push(Box::new(*r));
        }
        let args_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let count: i64 = stmt.query_row(args_ref.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    /// True once every filter's tag has at least [`POOL_FLOOR`] eligible
    /// images.
    pub async fn pool_ready(&self, filters: &Filters) -> Result<bool, Error> {
        Ok(self.count_matching(filters).await? >= POOL_FLOOR)
    }

    /// Picks one random matching, non-target-tag image for use as a
    /// captcha's correct or decoy cell. Uses `ORDER BY RANDOM()` the way the
    /// original does for small pools; acceptable because pools are bounded
    /// in the thousands, not sampled at scale.
    pub async fn random_image(&self, filters: &Filters) -> Result<Option<Image>, Error> {
        let guard = self.read().await?;
        let placeholders: Vec<String> = filters.ratings.iter().map(|_| "?".to_string()).collect();
        let sql = format!(
            "SELECT id FROM images
             WHERE blacklisted = 0 AND target_tag = ? AND rating IN ({})
             ORDER BY RANDOM() LIMIT 1",
            placeholders.join(",")
        );
        let mut stmt = guard.conn.prepare(&sql)?;
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(filters.tag.clone())];
        for r in &filters.ratings {
            args.push(Box::new(*r));
        }
        let args_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let id: Option<i64> = stmt.query_row(args_ref.as_slice(), |row| row.get(0)).optional()?;
        drop(stmt);
        drop(guard);

        let Some(id) = id else { return Ok(None) };
        self.find_image_by_id(id).await
    }

    /// Picks `count` distinct random images with `target_tag != tag`, used
    /// to fill the non-matching cells of a 3x3 grid.
    pub async fn random_foils(
        &self,
        tag: &str,
        ratings: &[Rating],
        count: usize,
    ) -> Result<Vec<Image>, Error> {
        let guard = self.read().await?;
        let placeholders: Vec<String> = ratings.iter().map(|_| "?".to_string()).collect();
        let sql = format!(
            "SELECT id FROM images
             WHERE blacklisted = 0 AND target_tag != ? AND rating IN ({})
             ORDER BY RANDOM() LIMIT ?",
            placeholders.join(",")
        );
        let mut stmt = guard.conn.prepare(&sql)?;
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tag.to_string())];
        for r in ratings {
            args.push(Box::new(*r));
        }
        args.push(Box::new(count as i64));
        let args_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let ids = stmt
            .query_map(args_ref.as_slice(), |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(guard);

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(img) = self.find_image_by_id(id).await? {
                out.push(img);
            }
        }
        Ok(out)
    }

    pub async fn find_image_by_id(&self, id: i64) -> Result<Option<Image>, Error> {
        let guard = self.read().await?;
        let conn = &guard.conn;
        let row = conn
            .query_row(
                "SELECT md5, rating, source, target_tag, blacklisted FROM images WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Rating>(1)?,
                        row.get::<_, super::models::Source>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((md5_vec, rating, source, target_tag, blacklisted)) = row else {
            return Ok(None);
        };

        let mut tags_stmt = conn.prepare("SELECT tag FROM tags WHERE image_id = ?1")?;
        let tags = tags_stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&md5_vec);

        Ok(Some(Image {
            id,
            md5,
            rating,
            source,
            target_tag,
            blacklisted,
            tags,
        }))
    }
}

