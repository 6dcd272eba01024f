// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Schema migrations. Each step is additive (new tables/columns only) and
//! best-effort: a failure on a migration that turns out to already be
//! applied is swallowed rather than propagated, since there's no reliable
//! "already applied" check cheaper than trying.

use rusqlite::Connection;
use tracing::warn;

/// Brings a database at schema version `from` up to `to`, applying each
/// intervening step in order. Errors are logged and ignored; a version
/// that fails to apply a step is still recorded as current (see
/// `Catalog::init`), matching the source system's behavior.
pub fn run(conn: &mut Connection, from: i32, to: i32) {
    for v in (from + 1)..=to {
        if let Err(e) = apply_step(conn, v) {
            warn!(version = v, error = %e, "schema migration step failed, continuing");
        }
    }
}

fn apply_step(_conn: &mut Connection, _version: i32) -> Result<(), rusqlite::Error> {
    // No migrations beyond the initial schema yet. New steps land here as
    // the schema gains columns/tables, e.g.:
    // 2 => conn.execute_batch("alter table download add column foo text;"),
    Ok(())
}
