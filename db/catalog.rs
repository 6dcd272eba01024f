// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! The catalog store (C1): durable local state for downloads, the download
//! queue, per-user ownership, and channel exclusions, backed by SQLite.
//!
//! All mutations serialize through a single `Mutex<Connection>` (see §5's
//! single-writer discipline); readers take the same lock, so there is no
//! separate read path to keep consistent, just a straightforward critical
//! section per call.

use std::sync::Arc;

use base::Mutex;
use jiff::Timestamp;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::schema::{EXPECTED_SCHEMA_VERSION, SCHEMA};
use crate::types::{
    ChannelExclusion, Download, DownloadInput, DownloadMetadata, QueueItem, QueueStatus, Source,
    VideoUserStatus,
};
use crate::upgrade;
use crate::Error;
use crate::ErrorKind;

fn ts_to_sql(ts: Timestamp) -> String {
    ts.to_string()
}

fn ts_from_sql(s: &str) -> Result<Timestamp, Error> {
    s.parse()
        .map_err(|_| Error::new(ErrorKind::Unknown, format!("bad timestamp: {s}")))
}

fn opt_ts_to_sql(ts: Option<Timestamp>) -> Option<String> {
    ts.map(ts_to_sql)
}

fn opt_ts_from_sql(s: Option<String>) -> Result<Option<Timestamp>, Error> {
    s.map(|s| ts_from_sql(&s)).transpose()
}

/// Priority used for requests inserted without an explicit value.
const DEFAULT_PRIORITY: i32 = 0;

/// Entry point for durable catalog state. Cloning is cheap; all clones
/// share the same underlying connection and lock.
#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    /// Opens (creating if absent) the catalog database at `path` and brings
    /// its schema up to date. Idempotent: safe to call on every startup.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|e| Error::wrap(ErrorKind::Connection, e))?;
        let cat = Catalog {
            conn: Arc::new(Mutex::new(conn)),
        };
        cat.init()?;
        Ok(cat)
    }

    /// Opens a catalog backed by an in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().map_err(|e| Error::wrap(ErrorKind::Connection, e))?;
        let cat = Catalog {
            conn: Arc::new(Mutex::new(conn)),
        };
        cat.init()?;
        Ok(cat)
    }

    /// Creates or upgrades the schema. Idempotent; migration failures on an
    /// already-applied migration are swallowed (see upgrade.rs).
    #[instrument(skip_all)]
    pub fn init(&self) -> Result<(), Error> {
        let mut conn = self.conn.lock();
        let schema_exists: bool = conn
            .query_row(
                "select count(*) from sqlite_master where type = 'table' and name = 'version'",
                [],
                |r| r.get::<_, i64>(0),
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?
            > 0;
        let have_version: Option<i32> = if schema_exists {
            conn.query_row("select version from version where id = 0", [], |r| r.get(0))
                .optional()
                .map_err(|e| Error::wrap(ErrorKind::Query, e))?
        } else {
            None
        };
        match have_version {
            None => {
                info!("initializing fresh catalog schema");
                let tx = conn.transaction().map_err(|e| Error::wrap(ErrorKind::Query, e))?;
                tx.execute_batch(SCHEMA).map_err(|e| Error::wrap(ErrorKind::Query, e))?;
                tx.execute(
                    "insert into version (id, version) values (0, ?1)",
                    params![EXPECTED_SCHEMA_VERSION],
                )
                .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
                tx.commit().map_err(|e| Error::wrap(ErrorKind::Query, e))?;
            }
            Some(v) if v < EXPECTED_SCHEMA_VERSION => {
                info!(from = v, to = EXPECTED_SCHEMA_VERSION, "upgrading catalog schema");
                upgrade::run(&mut conn, v, EXPECTED_SCHEMA_VERSION);
                conn.execute(
                    "update version set version = ?1 where id = 0",
                    params![EXPECTED_SCHEMA_VERSION],
                )
                .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
            }
            Some(_) => debug!("catalog schema up to date"),
        }
        Ok(())
    }

    /// Inserts or merges a queue request. On conflict, `priority` becomes
    /// `max(old, new)`; other fields are left unchanged. If `owner_user_ids`
    /// is given, upserts a [`VideoUserStatus`] row for each; else if
    /// `user_id` is given, upserts one for that user.
    #[instrument(skip(self), fields(video_id = %req.video_id))]
    pub fn add_to_queue(&self, req: AddToQueue, now: Timestamp) -> Result<QueueItem, Error> {
        let conn = self.conn.lock();
        let priority = req.priority.unwrap_or(DEFAULT_PRIORITY);
        conn.execute(
            "insert into queue_item
                (video_id, user_id, priority, status, queued_at, retry_count,
                 throttle_retry_count, source)
             values (?1, ?2, ?3, 'pending', ?4, 0, 0, ?5)
             on conflict(video_id) do update set
                priority = max(priority, excluded.priority)",
            params![
                req.video_id,
                req.user_id,
                priority,
                ts_to_sql(now),
                req.source.as_str(),
            ],
        )
        .map_err(|e| Error::wrap(ErrorKind::Query, e))?;

        let owners: Vec<&str> = if let Some(ids) = &req.owner_user_ids {
            ids.iter().map(String::as_str).collect()
        } else if let Some(uid) = &req.user_id {
            vec![uid.as_str()]
        } else {
            Vec::new()
        };
        for owner in owners {
            conn.execute(
                "insert into video_user_status
                    (video_id, user_id, is_owner, keep_forever, deleted_at, created_at)
                 values (?1, ?2, 1, 0, null, ?3)
                 on conflict(video_id, user_id) do update set
                    is_owner = 1, deleted_at = null",
                params![req.video_id, owner, ts_to_sql(now)],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        }

        row_by_video_id(&conn, &req.video_id)
    }

    /// Returns the single highest-priority `pending` row whose
    /// `next_retry_at` is null or past, tie-broken by oldest `queued_at`.
    /// Does not mutate.
    pub fn get_next_queue_item(&self, now: Timestamp) -> Result<Option<QueueItem>, Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "select id, video_id, user_id, priority, status, error_message, queued_at,
                    started_at, completed_at, retry_count, next_retry_at,
                    throttle_retry_count, source
             from queue_item
             where status = 'pending' and (next_retry_at is null or next_retry_at <= ?1)
             order by priority desc, queued_at asc
             limit 1",
            params![ts_to_sql(now)],
            row_to_queue_item,
        )
        .optional()
        .map_err(|e| Error::wrap(ErrorKind::Query, e))?
        .transpose()
    }

    /// Sets `status`. Transitioning to `downloading` also sets `started_at`;
    /// transitioning to a terminal state also sets `completed_at`.
    #[instrument(skip(self))]
    pub fn update_queue_status(
        &self,
        video_id: &str,
        status: QueueStatus,
        error_message: Option<&str>,
        now: Timestamp,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        let started_at = if status == QueueStatus::Downloading {
            Some(ts_to_sql(now))
        } else {
            None
        };
        let completed_at = if status.is_terminal() {
            Some(ts_to_sql(now))
        } else {
            None
        };
        let n = conn
            .execute(
                "update queue_item set
                    status = ?1,
                    error_message = ?2,
                    started_at = coalesce(?3, started_at),
                    completed_at = coalesce(?4, completed_at)
                 where video_id = ?5",
                params![status.as_str(), error_message, started_at, completed_at, video_id],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no queue item for video {video_id}"),
            ));
        }
        Ok(())
    }

    /// Schedules an automatic retry: status back to `pending`, updates the
    /// classification-retry counter and gate, clears `completed_at`.
    #[instrument(skip(self, error))]
    pub fn schedule_retry(
        &self,
        video_id: &str,
        error: &str,
        retry_count: i32,
        next_retry_at: Timestamp,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "update queue_item set
                    status = 'pending',
                    error_message = ?1,
                    retry_count = ?2,
                    next_retry_at = ?3,
                    completed_at = null
                 where video_id = ?4",
                params![error, retry_count, ts_to_sql(next_retry_at), video_id],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no queue item for video {video_id}"),
            ));
        }
        Ok(())
    }

    /// User-initiated retry: clears error, retry count, retry gate, and
    /// timestamps; status back to `pending`.
    #[instrument(skip(self))]
    pub fn reset_retry_count(&self, video_id: &str) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "update queue_item set
                    status = 'pending',
                    error_message = null,
                    retry_count = 0,
                    throttle_retry_count = 0,
                    next_retry_at = null,
                    started_at = null,
                    completed_at = null
                 where video_id = ?1",
                params![video_id],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no queue item for video {video_id}"),
            ));
        }
        Ok(())
    }

    /// Like [`Catalog::schedule_retry`], but bumps the independent
    /// throttle-retry counter and does not touch `next_retry_at` (throttle
    /// retries are immediate).
    #[instrument(skip(self, error))]
    pub fn increment_throttle_retry(
        &self,
        video_id: &str,
        error: &str,
        throttle_retry_count: i32,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "update queue_item set
                    status = 'pending',
                    error_message = ?1,
                    throttle_retry_count = ?2,
                    completed_at = null
                 where video_id = ?3",
                params![error, throttle_retry_count, video_id],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no queue item for video {video_id}"),
            ));
        }
        Ok(())
    }

    /// Enumerates queue rows left `downloading` by a crashed process.
    pub fn get_orphaned_downloads(&self) -> Result<Vec<QueueItem>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select id, video_id, user_id, priority, status, error_message, queued_at,
                        started_at, completed_at, retry_count, next_retry_at,
                        throttle_retry_count, source
                 from queue_item where status = 'downloading'",
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map([], row_to_queue_item)
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?
            .into_iter()
            .collect()
    }

    /// Atomically rewrites every `downloading` row to `pending` and clears
    /// `started_at` (invariant 1's recovery step).
    #[instrument(skip(self))]
    pub fn reset_orphaned_downloads(&self) -> Result<usize, Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "update queue_item set status = 'pending', started_at = null
                 where status = 'downloading'",
                [],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n > 0 {
            info!(count = n, "recovered orphaned downloads");
        }
        Ok(n)
    }

    /// Upserts a completed download on `video_id`; on conflict, updates
    /// mutable fields and clears `files_deleted_at` (a re-download revives a
    /// tombstone row).
    #[instrument(skip(self, input), fields(video_id = %input.video_id))]
    pub fn add_download(&self, input: DownloadInput, now: Timestamp) -> Result<Download, Error> {
        let conn = self.conn.lock();
        let metadata_json = serde_json::to_string(&input.metadata)
            .map_err(|e| Error::wrap(ErrorKind::Unknown, e))?;
        conn.execute(
            "insert into download
                (video_id, channel_id, title, duration_seconds, quality, file_path,
                 thumbnail_path, metadata, file_size_bytes, downloaded_at, source,
                 files_deleted_at)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, null)
             on conflict(video_id) do update set
                channel_id = excluded.channel_id,
                title = excluded.title,
                duration_seconds = excluded.duration_seconds,
                quality = excluded.quality,
                file_path = excluded.file_path,
                thumbnail_path = excluded.thumbnail_path,
                metadata = excluded.metadata,
                file_size_bytes = excluded.file_size_bytes,
                downloaded_at = excluded.downloaded_at,
                source = excluded.source,
                files_deleted_at = null",
            params![
                input.video_id,
                input.channel_id,
                input.title,
                input.duration_seconds,
                input.quality,
                input.file_path,
                input.thumbnail_path,
                metadata_json,
                input.file_size_bytes,
                ts_to_sql(now),
                input.source.as_str(),
            ],
        )
        .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        download_by_video_id(&conn, &input.video_id)?
            .ok_or_else(|| Error::new(ErrorKind::Unknown, "download vanished after insert"))
    }

    /// Marks a download's files as reclaimed without losing the historical
    /// "was downloaded" fact (the row becomes a tombstone).
    #[instrument(skip(self))]
    pub fn mark_files_deleted(&self, video_id: &str, now: Timestamp) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "update download set files_deleted_at = ?1 where video_id = ?2",
                params![ts_to_sql(now), video_id],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no download for video {video_id}"),
            ));
        }
        Ok(())
    }

    /// Subscription downloads with files still present, downloaded more
    /// than `age_days` ago (invariant 4).
    pub fn get_cleanup_candidates(&self, age_days: i64, now: Timestamp) -> Result<Vec<Download>, Error> {
        let cutoff = now - jiff::Span::new().days(age_days);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select video_id, channel_id, title, duration_seconds, quality, file_path,
                        thumbnail_path, metadata, file_size_bytes, downloaded_at, source,
                        files_deleted_at
                 from download
                 where source = 'subscription'
                   and files_deleted_at is null
                   and downloaded_at < ?1",
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map(params![ts_to_sql(cutoff)], row_to_download)
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?
            .into_iter()
            .collect()
    }

    /// Downloads owned (`is_owner=true`, not soft-deleted) by `user_id`,
    /// whose files have not been reclaimed.
    pub fn get_user_downloads(&self, user_id: &str) -> Result<Vec<Download>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select d.video_id, d.channel_id, d.title, d.duration_seconds, d.quality,
                        d.file_path, d.thumbnail_path, d.metadata, d.file_size_bytes,
                        d.downloaded_at, d.source, d.files_deleted_at
                 from download d
                 join video_user_status s on s.video_id = d.video_id
                 where s.user_id = ?1 and s.is_owner = 1 and s.deleted_at is null
                   and d.files_deleted_at is null",
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map(params![user_id], row_to_download)
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?
            .into_iter()
            .collect()
    }

    /// Queue rows belonging to `user_id`.
    pub fn get_user_queue(&self, user_id: &str) -> Result<Vec<QueueItem>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select id, video_id, user_id, priority, status, error_message, queued_at,
                        started_at, completed_at, retry_count, next_retry_at,
                        throttle_retry_count, source
                 from queue_item where user_id = ?1
                 order by queued_at desc",
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map(params![user_id], row_to_queue_item)
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?
            .into_iter()
            .collect()
    }

    /// Aggregate counts for a user: total downloads, total bytes, and
    /// outstanding (non-terminal) queue items.
    pub fn get_user_download_stats(&self, user_id: &str) -> Result<UserDownloadStats, Error> {
        let conn = self.conn.lock();
        let (count, bytes): (i64, i64) = conn
            .query_row(
                "select count(*), coalesce(sum(d.file_size_bytes), 0)
                 from download d
                 join video_user_status s on s.video_id = d.video_id
                 where s.user_id = ?1 and s.is_owner = 1 and s.deleted_at is null
                   and d.files_deleted_at is null",
                params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let pending: i64 = conn
            .query_row(
                "select count(*) from queue_item
                 where user_id = ?1 and status not in ('completed', 'failed', 'cancelled')",
                params![user_id],
                |r| r.get(0),
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        Ok(UserDownloadStats {
            download_count: count,
            total_bytes: bytes,
            pending_queue_count: pending,
        })
    }

    /// Removes terminal (`completed|failed|cancelled`) queue rows.
    #[instrument(skip(self))]
    pub fn clear_completed(&self) -> Result<usize, Error> {
        let conn = self.conn.lock();
        conn.execute(
            "delete from queue_item where status in ('completed', 'failed', 'cancelled')",
            [],
        )
        .map_err(|e| Error::wrap(ErrorKind::Query, e))
    }

    /// Removes a single queue row, regardless of status. Used by the
    /// control-plane cancel and delete endpoints.
    #[instrument(skip(self))]
    pub fn remove_queue_item(&self, video_id: &str) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute("delete from queue_item where video_id = ?1", params![video_id])
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no queue item for video {video_id}"),
            ));
        }
        Ok(())
    }

    pub fn get_queue_item(&self, video_id: &str) -> Result<Option<QueueItem>, Error> {
        let conn = self.conn.lock();
        row_by_video_id(&conn, video_id).map(Some).or_else(|e| {
            if e.kind() == ErrorKind::NotFound {
                Ok(None)
            } else {
                Err(e)
            }
        })
    }

    pub fn get_download(&self, video_id: &str) -> Result<Option<Download>, Error> {
        let conn = self.conn.lock();
        download_by_video_id(&conn, video_id)
    }

    pub fn list_queue(&self) -> Result<Vec<QueueItem>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select id, video_id, user_id, priority, status, error_message, queued_at,
                        started_at, completed_at, retry_count, next_retry_at,
                        throttle_retry_count, source
                 from queue_item order by priority desc, queued_at asc",
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map([], row_to_queue_item)
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?
            .into_iter()
            .collect()
    }

    pub fn list_downloads(&self) -> Result<Vec<Download>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select video_id, channel_id, title, duration_seconds, quality, file_path,
                        thumbnail_path, metadata, file_size_bytes, downloaded_at, source,
                        files_deleted_at
                 from download where files_deleted_at is null
                 order by downloaded_at desc",
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map([], row_to_download)
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?
            .into_iter()
            .collect()
    }

    /// Adds a channel mute. `user_id` of `None` excludes the channel for
    /// every user.
    #[instrument(skip(self))]
    pub fn add_exclusion(
        &self,
        channel_id: &str,
        user_id: Option<&str>,
        now: Timestamp,
    ) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "insert into channel_exclusion (channel_id, user_id, created_at)
             values (?1, ?2, ?3)
             on conflict(channel_id, user_id) do nothing",
            params![channel_id, user_id, ts_to_sql(now)],
        )
        .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_exclusion(&self, channel_id: &str, user_id: Option<&str>) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = match user_id {
            Some(u) => conn.execute(
                "delete from channel_exclusion where channel_id = ?1 and user_id = ?2",
                params![channel_id, u],
            ),
            None => conn.execute(
                "delete from channel_exclusion where channel_id = ?1 and user_id is null",
                params![channel_id],
            ),
        }
        .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(ErrorKind::NotFound, "no matching exclusion"));
        }
        Ok(())
    }

    pub fn list_exclusions(&self) -> Result<Vec<ChannelExclusion>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select channel_id, user_id, created_at from channel_exclusion")
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let mut out = Vec::new();
        for row in rows {
            let (channel_id, user_id, created_at) = row.map_err(|e| Error::wrap(ErrorKind::Query, e))?;
            out.push(ChannelExclusion {
                channel_id,
                user_id,
                created_at: ts_from_sql(&created_at)?,
            });
        }
        Ok(out)
    }

    /// Returns whether `channel_id` is excluded for `user_id` (either by a
    /// channel-wide or a per-user exclusion row).
    pub fn is_channel_excluded(&self, channel_id: &str, user_id: &str) -> Result<bool, Error> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "select count(*) from channel_exclusion
                 where channel_id = ?1 and (user_id is null or user_id = ?2)",
                params![channel_id, user_id],
                |r| r.get(0),
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        Ok(n > 0)
    }

    /// Active (not soft-deleted) ownership rows for `video_id`, used by the
    /// eviction sweep to decide whether any owner still needs the file kept.
    pub fn get_active_video_owners(&self, video_id: &str) -> Result<Vec<VideoUserStatus>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select video_id, user_id, is_owner, keep_forever, deleted_at, created_at
                 from video_user_status
                 where video_id = ?1 and is_owner = 1 and deleted_at is null",
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let rows = stmt
            .query_map(params![video_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, bool>(2)?,
                    r.get::<_, bool>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        let mut out = Vec::new();
        for row in rows {
            let (video_id, user_id, is_owner, keep_forever, deleted_at, created_at) =
                row.map_err(|e| Error::wrap(ErrorKind::Query, e))?;
            out.push(VideoUserStatus {
                video_id,
                user_id,
                is_owner,
                keep_forever,
                deleted_at: opt_ts_from_sql(deleted_at)?,
                created_at: ts_from_sql(&created_at)?,
            });
        }
        Ok(out)
    }

    /// Soft-deletes `user_id`'s ownership row for `video_id` (the operator
    /// "remove this download" action): the row is marked `deleted_at` so
    /// [`Self::get_active_video_owners`] no longer counts this user as a
    /// reason to keep the files. Files themselves are only reclaimed by
    /// the eviction sweep once no owner remains, or by an explicit purge.
    #[instrument(skip(self))]
    pub fn soft_delete_user_download(&self, video_id: &str, user_id: &str, now: Timestamp) -> Result<(), Error> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "update video_user_status set deleted_at = ?1
                 where video_id = ?2 and user_id = ?3 and deleted_at is null",
                params![ts_to_sql(now), video_id, user_id],
            )
            .map_err(|e| Error::wrap(ErrorKind::Query, e))?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no active ownership row for video {video_id}, user {user_id}"),
            ));
        }
        Ok(())
    }
}

/// Parameters for [`Catalog::add_to_queue`].
#[derive(Clone, Debug)]
pub struct AddToQueue {
    pub video_id: String,
    pub user_id: Option<String>,
    pub priority: Option<i32>,
    pub source: Source,
    pub owner_user_ids: Option<Vec<String>>,
}

#[derive(Copy, Clone, Debug)]
pub struct UserDownloadStats {
    pub download_count: i64,
    pub total_bytes: i64,
    pub pending_queue_count: i64,
}

fn row_to_queue_item(row: &rusqlite::Row) -> rusqlite::Result<Result<QueueItem, Error>> {
    Ok((|| {
        let status: String = row.get(4)?;
        let source: String = row.get(12)?;
        Ok(QueueItem {
            id: row.get(0)?,
            video_id: row.get(1)?,
            user_id: row.get(2)?,
            priority: row.get(3)?,
            status: status
                .parse()
                .map_err(|e: Error| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            error_message: row.get(5)?,
            queued_at: ts_from_sql(&row.get::<_, String>(6)?)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            started_at: opt_ts_from_sql(row.get(7)?)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            completed_at: opt_ts_from_sql(row.get(8)?)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            retry_count: row.get(9)?,
            next_retry_at: opt_ts_from_sql(row.get(10)?)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            throttle_retry_count: row.get(11)?,
            source: source
                .parse()
                .map_err(|e: Error| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        })
    })())
}

fn row_to_download(row: &rusqlite::Row) -> rusqlite::Result<Result<Download, Error>> {
    Ok((|| {
        let metadata_json: String = row.get(7)?;
        let source: String = row.get(10)?;
        let metadata: DownloadMetadata = serde_json::from_str(&metadata_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(Download {
            video_id: row.get(0)?,
            channel_id: row.get(1)?,
            title: row.get(2)?,
            duration_seconds: row.get(3)?,
            quality: row.get(4)?,
            file_path: row.get(5)?,
            thumbnail_path: row.get(6)?,
            metadata,
            file_size_bytes: row.get(8)?,
            downloaded_at: ts_from_sql(&row.get::<_, String>(9)?)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            source: source
                .parse()
                .map_err(|e: Error| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            files_deleted_at: opt_ts_from_sql(row.get(11)?)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        })
    })())
}

fn row_by_video_id(conn: &Connection, video_id: &str) -> Result<QueueItem, Error> {
    conn.query_row(
        "select id, video_id, user_id, priority, status, error_message, queued_at,
                started_at, completed_at, retry_count, next_retry_at,
                throttle_retry_count, source
         from queue_item where video_id = ?1",
        params![video_id],
        row_to_queue_item,
    )
    .map_err(|e| Error::wrap(ErrorKind::Query, e))?
}

fn download_by_video_id(conn: &Connection, video_id: &str) -> Result<Option<Download>, Error> {
    conn.query_row(
        "select video_id, channel_id, title, duration_seconds, quality, file_path,
                thumbnail_path, metadata, file_size_bytes, downloaded_at, source,
                files_deleted_at
         from download where video_id = ?1",
        params![video_id],
        row_to_download,
    )
    .optional()
    .map_err(|e| Error::wrap(ErrorKind::Query, e))?
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    #[test]
    fn add_to_queue_merges_priority_on_conflict() {
        let cat = Catalog::open_in_memory().unwrap();
        let now = t("2024-01-01T00:00:00Z");
        cat.add_to_queue(
            AddToQueue {
                video_id: "dQw4w9WgXcQ".into(),
                user_id: Some("alice".into()),
                priority: Some(1),
                source: Source::Manual,
                owner_user_ids: None,
            },
            now,
        )
        .unwrap();
        let item = cat
            .add_to_queue(
                AddToQueue {
                    video_id: "dQw4w9WgXcQ".into(),
                    user_id: Some("bob".into()),
                    priority: Some(5),
                    source: Source::Manual,
                    owner_user_ids: None,
                },
                now,
            )
            .unwrap();
        assert_eq!(item.priority, 5);
        // original user_id is unchanged; new request's user_id is not applied.
        assert_eq!(item.user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn get_next_queue_item_respects_retry_gate() {
        let cat = Catalog::open_in_memory().unwrap();
        let now = t("2024-01-01T00:00:00Z");
        cat.add_to_queue(
            AddToQueue {
                video_id: "aaaaaaaaaaa".into(),
                user_id: None,
                priority: Some(0),
                source: Source::Manual,
                owner_user_ids: None,
            },
            now,
        )
        .unwrap();
        cat.schedule_retry("aaaaaaaaaaa", "transient", 1, now + jiff::Span::new().minutes(5))
            .unwrap();
        assert!(cat.get_next_queue_item(now).unwrap().is_none());
        let later = now + jiff::Span::new().minutes(10);
        assert!(cat.get_next_queue_item(later).unwrap().is_some());
    }

    #[test]
    fn orphan_recovery_resets_downloading_rows() {
        let cat = Catalog::open_in_memory().unwrap();
        let now = t("2024-01-01T00:00:00Z");
        cat.add_to_queue(
            AddToQueue {
                video_id: "bbbbbbbbbbb".into(),
                user_id: None,
                priority: Some(0),
                source: Source::Manual,
                owner_user_ids: None,
            },
            now,
        )
        .unwrap();
        cat.update_queue_status("bbbbbbbbbbb", QueueStatus::Downloading, None, now)
            .unwrap();
        assert_eq!(cat.get_orphaned_downloads().unwrap().len(), 1);
        let n = cat.reset_orphaned_downloads().unwrap();
        assert_eq!(n, 1);
        assert!(cat.get_orphaned_downloads().unwrap().is_empty());
    }

    #[test]
    fn add_download_revives_tombstone() {
        let cat = Catalog::open_in_memory().unwrap();
        let now = t("2024-01-01T00:00:00Z");
        let input = DownloadInput {
            video_id: "ccccccccccc".into(),
            channel_id: None,
            title: "title".into(),
            duration_seconds: Some(120),
            quality: Some("1080p".into()),
            file_path: "/videos/ccccccccccc.mp4".into(),
            thumbnail_path: None,
            metadata: DownloadMetadata::default(),
            file_size_bytes: 1024,
            source: Source::Subscription,
        };
        cat.add_download(input.clone(), now).unwrap();
        cat.mark_files_deleted("ccccccccccc", now).unwrap();
        let tombstoned = cat.get_download("ccccccccccc").unwrap().unwrap();
        assert!(tombstoned.files_deleted_at.is_some());

        let revived = cat.add_download(input, now + jiff::Span::new().days(1)).unwrap();
        assert!(revived.files_deleted_at.is_none());
    }

    #[test]
    fn cleanup_candidates_respect_age_and_source() {
        let cat = Catalog::open_in_memory().unwrap();
        let now = t("2024-02-01T00:00:00Z");
        let old = now - jiff::Span::new().days(40);
        cat.add_download(
            DownloadInput {
                video_id: "ddddddddddd".into(),
                channel_id: None,
                title: "old subscription".into(),
                duration_seconds: None,
                quality: None,
                file_path: "/videos/ddddddddddd.mp4".into(),
                thumbnail_path: None,
                metadata: DownloadMetadata::default(),
                file_size_bytes: 1,
                source: Source::Subscription,
            },
            old,
        )
        .unwrap();
        cat.add_download(
            DownloadInput {
                video_id: "eeeeeeeeeee".into(),
                channel_id: None,
                title: "old manual".into(),
                duration_seconds: None,
                quality: None,
                file_path: "/videos/eeeeeeeeeee.mp4".into(),
                thumbnail_path: None,
                metadata: DownloadMetadata::default(),
                file_size_bytes: 1,
                source: Source::Manual,
            },
            old,
        )
        .unwrap();
        let candidates = cat.get_cleanup_candidates(30, now).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].video_id, "ddddddddddd");
    }

    #[test]
    fn soft_delete_user_download_removes_only_that_owner() {
        let cat = Catalog::open_in_memory().unwrap();
        let now = t("2024-01-01T00:00:00Z");
        cat.add_to_queue(
            AddToQueue {
                video_id: "fffffffffff".into(),
                user_id: None,
                priority: None,
                source: Source::Manual,
                owner_user_ids: Some(vec!["alice".into(), "bob".into()]),
            },
            now,
        )
        .unwrap();
        assert_eq!(cat.get_active_video_owners("fffffffffff").unwrap().len(), 2);

        cat.soft_delete_user_download("fffffffffff", "alice", now).unwrap();
        let owners = cat.get_active_video_owners("fffffffffff").unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user_id, "bob");
    }

    #[test]
    fn soft_delete_user_download_unknown_owner_is_not_found() {
        let cat = Catalog::open_in_memory().unwrap();
        let now = t("2024-01-01T00:00:00Z");
        let err = cat
            .soft_delete_user_download("ggggggggggg", "alice", now)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
