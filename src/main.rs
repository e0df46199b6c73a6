use clap::{Parser, Subcommand};
use pzpk::block::DEFAULT_BLOCK_SIZE;
use pzpk::{
    ExtractOutcome, IndexTree, NoteBook, PackOptions, PackOutcome, Package, PackageIndex, Packer,
    ProgressState, PzItem, StagingIndex, ROOT_ID,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "pzpk", about = "PZPK encrypted package and note containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory into a .pzpk package
    Pack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        password: String,
        /// Package name (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long)]
        tag: Vec<String>,
        /// Block size in KiB; must be a multiple of 64
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE / 1024)]
        block_size: u32,
    },
    /// Show package header and detail
    Info {
        input: PathBuf,
        #[arg(short, long)]
        password: String,
    },
    /// List package contents
    List {
        input: PathBuf,
        #[arg(short, long)]
        password: String,
        #[arg(long)]
        json: bool,
    },
    /// Extract a package, or one folder of it
    Extract {
        input: PathBuf,
        #[arg(short, long)]
        password: String,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Folder id to extract (default: everything)
        #[arg(long)]
        folder: Option<u32>,
    },
    /// List the notes of a .pznt notebook
    Notes {
        input: PathBuf,
        #[arg(short, long)]
        password: String,
    },
}

#[derive(Serialize)]
struct Listing<'a> {
    header:  &'a pzpk::PzHeader,
    detail:  &'a pzpk::PzDetail,
    folders: Vec<(String, &'a pzpk::PzFolder)>,
    files:   Vec<(String, &'a pzpk::PzFile)>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { input, output, password, name, description, tag, block_size } => {
            let mut index = StagingIndex::new();
            index.add_directory_contents(&input, ROOT_ID)?;
            let name = name.unwrap_or_else(|| dir_label(&input));

            let options = PackOptions::new(password, name)
                .with_description(description)
                .with_tags(tag)
                .with_block_size(block_size.saturating_mul(1024));
            let mut progress = print_progress;
            let outcome = Packer::new(options)
                .progress(&mut progress)
                .pack_to_path(&output, &index)?;
            eprintln!();
            match outcome {
                PackOutcome::Completed { total_size } => {
                    println!("Created: {} ({} B)", output.display(), total_size)
                }
                PackOutcome::Cancelled { files_written } => {
                    println!("Cancelled after {files_written} files")
                }
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, password } => {
            let package = Package::open_path(&input, &password)?;
            let header = package.header();
            let detail = package.detail();

            println!("── PZPK Package ─────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Version        {}", header.version);
            println!("  Name           {}", detail.name);
            println!("  Description    {}", detail.description);
            println!("  Tags           {}", detail.tags.join(", "));
            if let Some(created) = header.create_time {
                println!("  Created        {created}");
            }
            println!("  File size      {} B", header.file_size);
            println!("  Block size     {} B", header.block_size);
            println!("  Index          {} B at {}", header.index_size, header.index_offset);
            println!("  Folders        {}", package.index().all_folders().len());
            println!("  Files          {}", package.index().files_count());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, password, json } => {
            let package = Package::open_path(&input, &password)?;
            let index = package.index();

            if json {
                let listing = Listing {
                    header:  package.header(),
                    detail:  package.detail(),
                    folders: with_paths(index, index.all_folders())?,
                    files:   with_paths(index, index.all_files())?,
                };
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                println!("{:>8} {:>12} {:>12}  Path", "Id", "Size", "Stored");
                for file in index.all_files() {
                    println!("{:>8} {:>12} {:>12}  {}",
                        file.id, file.origin_size, file.size, index.full_path(file)?.display());
                }
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, password, output_dir, folder } => {
            let mut package = Package::open_path(&input, &password)?;
            let mut progress = print_progress;
            let outcome = package.extract_folder(
                folder.unwrap_or(ROOT_ID),
                &output_dir,
                true,
                Some(&mut progress),
                None,
            )?;
            eprintln!();
            match outcome {
                ExtractOutcome::Completed { files, bytes } => {
                    println!("Extracted {files} files ({bytes} B) to {}", output_dir.display())
                }
                ExtractOutcome::Cancelled { files } => println!("Cancelled after {files} files"),
            }
        }

        // ── Notes ────────────────────────────────────────────────────────────
        Commands::Notes { input, password } => {
            let book = NoteBook::open(&input, &password)?;
            println!("{:>6} {:>8}  Title", "Id", "Bytes");
            for note in book.notes() {
                println!("{:>6} {:>8}  {}", note.id(), note.content().len(), note.title());
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn print_progress(state: &ProgressState) {
    eprint!(
        "\r  {}/{} files  {:>5.1}%",
        state.processed_files,
        state.files,
        state.ratio() * 100.0
    );
}

fn with_paths<'a, T: PzItem>(index: &PackageIndex, items: &'a [T]) -> pzpk::Result<Vec<(String, &'a T)>> {
    let listed = items
        .iter()
        .map(|item| index.full_path(item).map(|p| (p.display().to_string(), item)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(listed)
}

fn dir_label(path: &Path) -> String {
    path.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "package".into())
}
