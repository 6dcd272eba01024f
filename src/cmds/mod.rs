// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Subcommands: `run` starts the server, `init` creates the catalog
//! schema, `check` opens and validates the catalog without serving.

pub mod check;
pub mod init;
pub mod run;
