// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Read-only access to the external user/subscription database (C2).
//!
//! The concrete implementation here assumes the upstream frontend's own
//! database is a SQLite file (as most self-hosted single-tenant video
//! frontends use), opened read-only and queried the same way `db::Catalog`
//! queries its own schema — `rusqlite::params!` plus one method per
//! operation — except nothing here ever writes, per the non-goal on
//! write-back to the upstream database. [`UpstreamCatalog`] is a trait so
//! the watcher and eviction service can be tested against a fake instead
//! of a real upstream schema.

use async_trait::async_trait;
use jiff::Timestamp;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// One upstream video summary, as returned by `getLatestVideos`.
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamVideo {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub published: Timestamp,
    pub length_seconds: Option<u32>,
    pub live_now: bool,
    pub premiere: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LatestVideosQuery {
    pub channel_ids: Vec<String>,
    pub published_after: Option<Timestamp>,
    pub exclude_live: bool,
    pub exclude_premieres: bool,
    pub min_duration_seconds: Option<u32>,
    pub limit: u32,
}

#[async_trait]
pub trait UpstreamCatalog: Send + Sync {
    async fn get_all_users_with_subscriptions(&self) -> Result<Vec<String>, base::Error>;
    async fn get_subscriptions(&self, user_email: &str) -> Result<Vec<String>, base::Error>;
    async fn get_latest_videos(
        &self,
        query: LatestVideosQuery,
    ) -> Result<Vec<UpstreamVideo>, base::Error>;
    async fn get_max_published_timestamp(
        &self,
        channel_ids: &[String],
    ) -> Result<Option<Timestamp>, base::Error>;
    async fn has_user_watched_video(&self, user_email: &str, video_id: &str) -> Result<bool, base::Error>;
    async fn get_users_subscribed_to_channel(&self, channel_id: &str) -> Result<Vec<String>, base::Error>;
}

/// A SQLite-backed [`UpstreamCatalog`]. Queries run on a blocking thread
/// since `rusqlite::Connection` is synchronous; the connection itself is
/// confined to that thread via a `Mutex`, mirroring `db::Catalog`'s
/// single-handle-behind-a-lock discipline even though this side never
/// writes.
pub struct SqliteUpstreamCatalog {
    conn: base::Mutex<Connection>,
}

impl SqliteUpstreamCatalog {
    pub fn open(path: &Path) -> Result<Self, base::Error> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| base::Error::wrap(base::ErrorKind::Unavailable, e))?;
        Ok(SqliteUpstreamCatalog {
            conn: base::Mutex::new(conn),
        })
    }

    fn placeholders(n: usize) -> String {
        std::iter::repeat("?")
            .take(n)
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn ts_from_sql(s: &str) -> Result<Timestamp, base::Error> {
    s.parse()
        .map_err(|e: jiff::Error| base::Error::wrap(base::ErrorKind::Internal, e))
}

#[async_trait]
impl UpstreamCatalog for SqliteUpstreamCatalog {
    async fn get_all_users_with_subscriptions(&self) -> Result<Vec<String>, base::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "select distinct email from users \
                 where exists (select 1 from subscriptions where subscriptions.user_email = users.email)",
            )
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))
    }

    async fn get_subscriptions(&self, user_email: &str) -> Result<Vec<String>, base::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select channel_id from subscriptions where user_email = ?1")
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        let rows = stmt
            .query_map(rusqlite::params![user_email], |row| row.get::<_, String>(0))
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))
    }

    async fn get_latest_videos(
        &self,
        query: LatestVideosQuery,
    ) -> Result<Vec<UpstreamVideo>, base::Error> {
        if query.channel_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut sql = format!(
            "select video_id, channel_id, title, published, length_seconds, live_now, premiere \
             from videos where channel_id in ({})",
            Self::placeholders(query.channel_ids.len())
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = query
            .channel_ids
            .iter()
            .map(|c| Box::new(c.clone()) as Box<dyn rusqlite::ToSql>)
            .collect();
        if let Some(after) = query.published_after {
            sql.push_str(" and published > ?");
            params.push(Box::new(after.to_string()));
        }
        if query.exclude_live {
            sql.push_str(" and live_now = 0");
        }
        if query.exclude_premieres {
            sql.push_str(" and premiere = 0");
        }
        if let Some(min_dur) = query.min_duration_seconds {
            sql.push_str(&format!(" and length_seconds >= {min_dur}"));
        }
        sql.push_str(" order by published desc limit ?");
        params.push(Box::new(query.limit));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                let published: String = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    published,
                    row.get::<_, Option<u32>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        let mut out = Vec::new();
        for row in rows {
            let (video_id, channel_id, title, published, length_seconds, live_now, premiere) =
                row.map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
            out.push(UpstreamVideo {
                video_id,
                channel_id,
                title,
                published: ts_from_sql(&published)?,
                length_seconds,
                live_now,
                premiere,
            });
        }
        Ok(out)
    }

    async fn get_max_published_timestamp(
        &self,
        channel_ids: &[String],
    ) -> Result<Option<Timestamp>, base::Error> {
        if channel_ids.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock();
        let sql = format!(
            "select max(published) from videos where channel_id in ({})",
            Self::placeholders(channel_ids.len())
        );
        let params: Vec<&dyn rusqlite::ToSql> =
            channel_ids.iter().map(|c| c as &dyn rusqlite::ToSql).collect();
        let max: Option<String> = conn
            .query_row(&sql, params.as_slice(), |row| row.get(0))
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        max.map(|s| ts_from_sql(&s)).transpose()
    }

    async fn has_user_watched_video(&self, user_email: &str, video_id: &str) -> Result<bool, base::Error> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "select count(*) from watch_history where user_email = ?1 and video_id = ?2",
                rusqlite::params![user_email, video_id],
                |row| row.get(0),
            )
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        Ok(count > 0)
    }

    async fn get_users_subscribed_to_channel(&self, channel_id: &str) -> Result<Vec<String>, base::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("select user_email from subscriptions where channel_id = ?1")
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        let rows = stmt
            .query_map(rusqlite::params![channel_id], |row| row.get::<_, String>(0))
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| base::Error::wrap(base::ErrorKind::Internal, e))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;

    /// An in-memory fake for watcher/eviction tests that don't want a real
    /// upstream schema.
    #[derive(Default)]
    pub struct FakeUpstreamCatalog {
        pub subscriptions: HashMap<String, Vec<String>>,
        pub videos: Vec<UpstreamVideo>,
        pub watched: HashMap<(String, String), bool>,
        pub channel_owners: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl UpstreamCatalog for FakeUpstreamCatalog {
        async fn get_all_users_with_subscriptions(&self) -> Result<Vec<String>, base::Error> {
            Ok(self.subscriptions.keys().cloned().collect())
        }

        async fn get_subscriptions(&self, user_email: &str) -> Result<Vec<String>, base::Error> {
            Ok(self.subscriptions.get(user_email).cloned().unwrap_or_default())
        }

        async fn get_latest_videos(
            &self,
            query: LatestVideosQuery,
        ) -> Result<Vec<UpstreamVideo>, base::Error> {
            let mut out: Vec<_> = self
                .videos
                .iter()
                .filter(|v| query.channel_ids.contains(&v.channel_id))
                .filter(|v| query.published_after.map_or(true, |after| v.published > after))
                .filter(|v| !(query.exclude_live && v.live_now))
                .filter(|v| !(query.exclude_premieres && v.premiere))
                .filter(|v| {
                    query
                        .min_duration_seconds
                        .zip(v.length_seconds)
                        .map_or(true, |(min, len)| len >= min)
                })
                .cloned()
                .collect();
            out.sort_by(|a, b| b.published.cmp(&a.published));
            out.truncate(query.limit as usize);
            Ok(out)
        }

        async fn get_max_published_timestamp(
            &self,
            channel_ids: &[String],
        ) -> Result<Option<Timestamp>, base::Error> {
            Ok(self
                .videos
                .iter()
                .filter(|v| channel_ids.contains(&v.channel_id))
                .map(|v| v.published)
                .max())
        }

        async fn has_user_watched_video(&self, user_email: &str, video_id: &str) -> Result<bool, base::Error> {
            Ok(*self
                .watched
                .get(&(user_email.to_string(), video_id.to_string()))
                .unwrap_or(&false))
        }

        async fn get_users_subscribed_to_channel(&self, channel_id: &str) -> Result<Vec<String>, base::Error> {
            Ok(self.channel_owners.get(channel_id).cloned().unwrap_or_default())
        }
    }
}
