use rusqlite::{params, OptionalExtension};

use crate::error::Error;

use super::models::CaptchaStatus;
use super::pool::Db;

/// A persisted captcha challenge: the 64-byte id handed to the client, the
/// tag the challenge was generated for, and the set of grid indices (0-8)
/// that are correct matches. Status starts `Unsolved` and transitions
/// exactly once, on the first verification attempt.
pub struct CaptchaRow {
    pub id: [u8; 64],
    pub tag: String,
    pub correct: Vec<usize>,
    pub status: CaptchaStatus,
}

/// Outcome of [`Db::check_and_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// No row for this id (never existed, or already swept by upkeep).
    Expired,
    /// The row existed but had already left `Unsolved` before this call.
    AlreadyDecided,
    /// This call was the one that decided the outcome.
    Decided { solved: bool },
}

impl Db {
    pub async fn insert_captcha(
        &self,
        id: &[u8; 64],
        tag: &str,
        correct: &[usize],
    ) -> Result<(), Error> {
        let guard = self.write().await?;
        let correct_json = serde_json::to_string(correct).unwrap_or_else(|_| "[]".to_string());
        guard.conn.execute(
            "INSERT INTO captchas (id, tag, correct, status, created_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s','now'))",
            params![id.to_vec(), tag, correct_json, CaptchaStatus::Unsolved],
        )?;
        Ok(())
    }

    pub async fn find_captcha(&self, id: &[u8; 64]) -> Result<Option<CaptchaRow>, Error> {
        let guard = self.read().await?;
        let row = guard
            .conn
            .query_row(
                "SELECT tag, correct, status FROM captchas WHERE id = ?1",
                params![id.to_vec()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, CaptchaStatus>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((tag, correct_json, status)) = row else {
            return Ok(None);
        };
        let correct: Vec<usize> = serde_json::from_str(&correct_json).unwrap_or_default();

        Ok(Some(CaptchaRow {
            id: *id,
            tag,
            correct,
            status,
        }))
    }

    /// Reads a captcha's tag/correct-indices and, if it is still
    /// `Unsolved`, decides and persists its outcome — all inside one write
    /// guard, so two concurrent verification attempts on the same id cannot
    /// both observe `Unsolved` and race to report contradictory results.
    /// `decide` is given the tag and the correct indices and returns
    /// whether the attempt counts as solved.
    pub async fn check_and_transition(
        &self,
        id: &[u8; 64],
        decide: impl FnOnce(&str, &[usize]) -> bool,
    ) -> Result<CheckResult, Error> {
        let guard = self.write().await?;
        let row = guard
            .conn
            .query_row(
                "SELECT tag, correct, status FROM captchas WHERE id = ?1",
                params![id.to_vec()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, CaptchaStatus>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((tag, correct_json, status)) = row else {
            return Ok(CheckResult::Expired);
        };
        if status != CaptchaStatus::Unsolved {
            return Ok(CheckResult::AlreadyDecided);
        }

        let correct: Vec<usize> = serde_json::from_str(&correct_json).unwrap_or_default();
        let solved = decide(&tag, &correct);
        let new_status = if solved {
            CaptchaStatus::Solved
        } else {
            CaptchaStatus::Failed
        };
        guard.conn.execute(
            "UPDATE captchas SET status = ?1 WHERE id = ?2",
            params![new_status, id.to_vec()],
        )?;
        Ok(CheckResult::Decided { solved })
    }

    /// Deletes a captcha row only if it was solved; a single conditional
    /// statement, naturally atomic and safe to call more than once for the
    /// same id (the second call simply deletes nothing).
    pub async fn delete_if_solved(&self, id: &[u8; 64]) -> Result<bool, Error> {
        let guard = self.write().await?;
        let n = guard.conn.execute(
            "DELETE FROM captchas WHERE id = ?1 AND status = ?2",
            params![id.to_vec(), CaptchaStatus::Solved],
        )?;
        Ok(n > 0)
    }

    /// Rewrites a captcha's `created_at` to `now - age_secs`, for exercising
    /// the expiry sweep without waiting out a real 30 minutes.
    #[cfg(any(test, feature = "test-support"))]
    pub async fn backdate_captcha_for_test(&self, id: &[u8; 64], age_secs: i64) -> Result<(), Error> {
        let guard = self.write().await?;
        guard.conn.execute(
            "UPDATE captchas SET created_at = strftime('%s','now') - ?1 WHERE id = ?2",
            params![age_secs, id.to_vec()],
        )?;
        Ok(())
    }

    /// Deletes captcha rows older than `max_age_secs`, called periodically
    /// by the upkeep task so unsolved/abandoned challenges don't accumulate.
    pub async fn prune_captchas(&self, max_age_secs: i64) -> Result<usize, Error> {
        let guard = self.write().await?;
        let n = guard.conn.execute(
            "DELETE FROM captchas WHERE created_at < strftime('%s','now') - ?1",
            params![max_age_secs],
        )?;
        Ok(n)
    }
}
