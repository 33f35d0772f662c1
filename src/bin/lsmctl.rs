//! lsmstore admin tool
//!
//! Offline inspection and maintenance of a data directory.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use lsmstore::storage::{SegmentReader, StorageManager};
use lsmstore::{Config, LsmTree};
use tracing_subscriber::{fmt, EnvFilter};

/// lsmstore admin CLI
#[derive(Parser, Debug)]
#[command(name = "lsmctl")]
#[command(about = "Inspect and maintain lsmstore data directories")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the descriptor of one segment file
    Inspect {
        /// Path to a .sst segment
        segment: PathBuf,
    },

    /// Check every segment of a data directory
    Verify {
        /// Data directory
        data_dir: PathBuf,
    },

    /// Merge all segments into one compaction group
    Compact {
        /// Data directory
        data_dir: PathBuf,
    },

    /// Get a value by key
    Get {
        data_dir: PathBuf,
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        data_dir: PathBuf,
        /// The key to set
        key: String,
        /// The value to set
        value: String,
    },

    /// Delete a key
    Delete {
        data_dir: PathBuf,
        /// The key to delete
        key: String,
    },

    /// List records with keys in [start, end)
    Scan {
        data_dir: PathBuf,
        /// First key (inclusive); omit to start at the beginning
        #[arg(long)]
        start: Option<String>,
        /// Last key (exclusive); omit to scan to the end
        #[arg(long)]
        end: Option<String>,
        /// Stop after this many records
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> lsmstore::Result<()> {
    match command {
        Commands::Inspect { segment } => inspect(&segment),
        Commands::Verify { data_dir } => verify(&data_dir),
        Commands::Compact { data_dir } => {
            let tree = open_tree(&data_dir)?;
            match tree.compact()? {
                Some(stats) => println!(
                    "compacted {} segments into {} ({} records, {} -> {} bytes)",
                    stats.input_segments,
                    stats.output_segments,
                    stats.records_written,
                    stats.bytes_before,
                    stats.bytes_after
                ),
                None => println!("nothing to compact"),
            }
            tree.close()
        }
        Commands::Get { data_dir, key } => {
            let tree = open_tree(&data_dir)?;
            match tree.find(&key.into_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            }
            tree.close()
        }
        Commands::Put {
            data_dir,
            key,
            value,
        } => {
            let tree = open_tree(&data_dir)?;
            tree.insert(key.into_bytes(), value.as_bytes())?;
            tree.close()
        }
        Commands::Delete { data_dir, key } => {
            let tree = open_tree(&data_dir)?;
            tree.delete(key.into_bytes())?;
            tree.close()
        }
        Commands::Scan {
            data_dir,
            start,
            end,
            limit,
        } => {
            use std::ops::Bound;

            let tree = open_tree(&data_dir)?;
            let start = start.map_or(Bound::Unbounded, |s| Bound::Included(s.into_bytes()));
            let end = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.into_bytes()));
            for record in tree.scan((start, end))?.take(limit) {
                let (key, value) = record?;
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
            tree.close()
        }
    }
}

fn open_tree(data_dir: &Path) -> lsmstore::Result<LsmTree<Vec<u8>>> {
    LsmTree::open(Config::builder().data_dir(data_dir).build())
}

fn inspect(path: &Path) -> lsmstore::Result<()> {
    let reader = SegmentReader::<Vec<u8>>::open(path)?;
    let d = reader.descriptor();
    let show = |key: &Option<Vec<u8>>| {
        key.as_ref()
            .map_or_else(|| "-".to_string(), |k| String::from_utf8_lossy(k).into_owned())
    };

    println!("segment:        {}", path.display());
    println!("sequence:       {} (base {})", d.sequence, d.base_sequence);
    let final_marker = if d.is_final_part { " (final)" } else { "" };
    println!(
        "group:          {} part {}{}",
        d.group_id, d.part_index, final_marker
    );
    println!("records:        {}", d.record_count);
    println!("total bytes:    {}", d.total_bytes);
    println!("key bytes:      {} (raw {})", d.key_size, d.raw_key_size);
    println!("value bytes:    {} (raw {})", d.value_size, d.raw_value_size);
    println!("min key:        {}", show(&d.min_key));
    println!("max key:        {}", show(&d.max_key));
    Ok(())
}

fn verify(data_dir: &Path) -> lsmstore::Result<()> {
    let segment_dir = data_dir.join("segments");
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&segment_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| StorageManager::<Vec<u8>>::parse_segment_name(p).is_some())
        .collect();
    paths.sort();

    let mut failures = 0;
    for path in &paths {
        let result = SegmentReader::<Vec<u8>>::open(path).and_then(|reader| reader.verify());
        match result {
            Ok(()) => println!("ok      {}", path.display()),
            Err(e) => {
                failures += 1;
                println!("FAILED  {}: {}", path.display(), e);
            }
        }
    }

    println!("{} segments checked, {} failed", paths.len(), failures);
    if failures > 0 {
        return Err(lsmstore::LsmError::Corruption(format!(
            "{} damaged segments",
            failures
        )));
    }
    Ok(())
}
