//! Command-line front end: create dynamic VHDs, print what an image contains and
//! change a dynamic disk's virtual size.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};
use rvhd::{create_sparse_disk, inspect_file, CreateOptions, Flush, SparseDisk, VhdFile, DD_BLOCKSIZE_DEFAULT};

#[derive(Parser, Debug)]
#[command(name = "rvhd", about = "Create and inspect Microsoft VHD disk images.")]
struct Args {
    /// More log output, repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty dynamic disk
    Create {
        path: PathBuf,

        /// Virtual disk size in bytes
        size: u64,

        /// Disk UUID, random when omitted
        #[arg(long)]
        uuid: Option<String>,

        /// Creation time in Unix seconds, now when omitted
        #[arg(long)]
        timestamp: Option<i64>,

        /// Block size in bytes (power of two)
        #[arg(long, value_name = "BYTES", default_value_t = DD_BLOCKSIZE_DEFAULT)]
        block_size: u32,
    },

    /// Print every footer and dynamic header field
    Info {
        path: PathBuf,

        /// Emit JSON instead of text
        #[arg(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },

    /// Change the virtual size of a dynamic disk
    Resize {
        path: PathBuf,

        /// New virtual size in bytes
        size: u64,
    },
}

fn run(command: Command) -> rvhd::Result<()> {
    match command {
        Command::Create { path, size, uuid, timestamp, block_size } => {
            let options = CreateOptions { uuid, timestamp, block_size };
            create_sparse_disk(size, &path, &options)?;
            info!("created {}", path.display());
        }
        Command::Info { path, json } => {
            let report = inspect_file(&path)?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                print!("{}", report);
            }
        }
        Command::Resize { path, size } => {
            let disk = SparseDisk::open(VhdFile::open_rw(&path)?)?;
            disk.set_current_size(size)?;
            disk.flush()?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = stderrlog::new()
        .module(module_path!())
        .verbosity(args.verbose as usize + 1)
        .init()
    {
        eprintln!("logger: {}", e);
    }

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
