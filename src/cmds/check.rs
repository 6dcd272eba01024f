// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! `check`: opens the catalog and confirms the videos directory exists,
//! without starting the server. Meant as a pre-flight sanity check for
//! deployment, since `run` will fail noisily later on either problem.

use base::{Error, ErrorKind};
use bpaf::Bpaf;
use tracing::info;

/// Opens the catalog and confirms the videos directory exists, without serving.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("check"))]
pub struct Args {}

/// Sums file sizes directly under `dir`, skipping anything that disappears mid-scan.
fn dir_size(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

pub fn run(_args: Args) -> Result<i32, Error> {
    let config = crate::config::Config::load()?;
    db::Catalog::open(&config.catalog_path)?;
    if !config.videos_dir.is_dir() {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("videos directory {} does not exist", config.videos_dir.display()),
        ));
    }
    let size = dir_size(&config.videos_dir);
    info!(
        catalog_path = %config.catalog_path.display(),
        videos_dir = %config.videos_dir.display(),
        size = %base::strutil::encode_size(size as i64),
        "catalog and videos directory check passed"
    );
    Ok(0)
}
