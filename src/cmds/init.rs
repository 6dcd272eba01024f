// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! `init`: creates (or upgrades) the catalog schema and exits. Safe to
//! run against an already-initialized catalog, since `Catalog::open`
//! brings the schema up to date idempotently.

use base::Error;
use bpaf::Bpaf;
use tracing::info;

/// Creates or upgrades the catalog schema.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("init"))]
pub struct Args {}

pub fn run(_args: Args) -> Result<i32, Error> {
    let config = crate::config::Config::load()?;
    db::Catalog::open(&config.catalog_path)?;
    info!(path = %config.catalog_path.display(), "catalog initialized");
    Ok(0)
}
