//! Command line entry point (spec §1 "all CLI/config plumbing" is out of
//! scope beyond the single positional entry point `Core.get_conf` reads:
//! a path to the merged JSON configuration document).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "klever-core", version, about = "Distributed verification pipeline core")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Decide a job from its merged configuration document.
    Run {
        /// Path to the job configuration JSON file.
        conf_file: PathBuf,
    },
}
