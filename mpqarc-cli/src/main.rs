//! Packaging tool for MPQ archives: add, extract, remove and rename member
//! files from the command line. The archive engine itself lives in the
//! `mpqarc` crate; this binary only owns the command-line surface.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mpqarc::{MpqArchive, MpqWriter};

#[derive(Parser)]
#[command(name = "mpqarc", about = "Inspect and build MPQ archives")]
struct Cli {
    /// Path to the archive file.
    archive: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Adds a file to the archive (replacing any existing member), creating
    /// the archive if needed.
    Add {
        /// Member name inside the archive, e.g. `levels\l1data\l1.dun`.
        name: String,
        /// File whose contents to store.
        input: PathBuf,
    },
    /// Extracts a member file.
    Extract {
        name: String,
        /// Destination path; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Removes a member file.
    Remove { name: String },
    /// Renames a member file without rewriting its data.
    Rename { old: String, new: String },
    /// Checks whether a member exists; exits nonzero when it does not.
    Has { name: String },
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let archive_path = &cli.archive;

    match cli.command {
        Command::Add { name, input } => {
            let data = fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let mut writer = MpqWriter::open_or_create(archive_path)
                .with_context(|| format!("failed to open {}", archive_path.display()))?;
            writer
                .add_file(&name, &data)
                .with_context(|| format!("failed to add {name}"))?;
            writer.close().context("failed to close archive")?;
        }
        Command::Extract { name, output } => {
            let mut archive = open_existing(archive_path)?;
            let data = archive
                .read_file(&name)
                .with_context(|| format!("failed to read {name}"))?;
            match output {
                Some(path) => fs::write(&path, data)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => io::stdout().write_all(&data)?,
            }
        }
        Command::Remove { name } => {
            let mut writer = MpqWriter::open_or_create(archive_path)
                .with_context(|| format!("failed to open {}", archive_path.display()))?;
            if !writer.remove_file(&name)? {
                bail!("{name} is not in the archive");
            }
            writer.close().context("failed to close archive")?;
        }
        Command::Rename { old, new } => {
            let mut writer = MpqWriter::open_or_create(archive_path)
                .with_context(|| format!("failed to open {}", archive_path.display()))?;
            if !writer.rename_file(&old, &new)? {
                bail!("{old} is not in the archive");
            }
            writer.close().context("failed to close archive")?;
        }
        Command::Has { name } => {
            let archive = open_existing(archive_path)?;
            if !archive.has_file(&name) {
                println!("missing");
                return Ok(ExitCode::FAILURE);
            }
            println!("present");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open_existing(path: &PathBuf) -> anyhow::Result<MpqArchive> {
    MpqArchive::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_context(|| format!("{} does not exist", path.display()))
}
