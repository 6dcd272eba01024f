// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! SQL DDL for the catalog database, plus the schema version this binary
//! expects. `upgrade.rs` takes a database at any older version to this one.

/// The schema version this binary expects. Bump when `SCHEMA` changes in a
/// way that requires a migration step in `upgrade.rs`.
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

pub const SCHEMA: &str = r#"
create table version (
  id integer primary key check (id = 0),
  version integer not null
);

-- One row per successfully completed video (invariant 3: existence here
-- implies files existed on disk at `downloaded_at`; `files_deleted_at`
-- marks later reclamation without losing the "was downloaded" fact).
create table download (
  video_id text primary key,
  channel_id text,
  title text not null,
  duration_seconds integer,
  quality text,
  file_path text not null,
  thumbnail_path text,
  metadata text not null,
  file_size_bytes integer not null,
  downloaded_at text not null,
  source text not null,
  files_deleted_at text
);

create index download_channel_id on download (channel_id);
create index download_eviction_candidates
  on download (source, files_deleted_at, downloaded_at);

-- One row per outstanding or terminal download request.
create table queue_item (
  id integer primary key,
  video_id text unique not null,
  user_id text,
  priority integer not null default 0,
  status text not null,
  error_message text,
  queued_at text not null,
  started_at text,
  completed_at text,
  retry_count integer not null default 0,
  next_retry_at text,
  throttle_retry_count integer not null default 0,
  source text not null
);

create index queue_item_status on queue_item (status);
create index queue_item_next_retry_at on queue_item (next_retry_at);

-- Per (video, user) ownership fact.
create table video_user_status (
  video_id text not null,
  user_id text not null,
  is_owner integer not null default 0,
  keep_forever integer not null default 0,
  deleted_at text,
  created_at text not null,
  primary key (video_id, user_id)
);

-- Per (channel, user?) mute; `user_id` null means every user.
create table channel_exclusion (
  channel_id text not null,
  user_id text,
  created_at text not null,
  primary key (channel_id, user_id)
);
"#;
