use std::path::PathBuf;

use clap::Parser;

/// Filesystem whose directories are projections of file tags
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Mount the filesystem at this empty directory
    #[arg(short, long)]
    pub mountpoint: PathBuf,

    /// Directory backing the persistent tag store
    #[arg(short, long)]
    pub datastore: PathBuf,

    /// Extra mount options, comma separated (e.g. allow_root,noatime)
    #[arg(short, long, value_delimiter = ',')]
    pub options: Vec<String>,

    /// More logging; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
