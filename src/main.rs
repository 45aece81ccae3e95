//! Thin, non-interactive CLI host: parses arguments, drives the scan
//! engine to completion with `run_until_idle()`, prints a summary, and
//! optionally persists/replays a cache or runs a named cleanup.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dirstat_core::cache::{CacheReader, CacheWriter};
use dirstat_core::cleanup::{self, CleanupCollection};
use dirstat_core::exclude::{self, ExcludeRule, ExcludeRules, PatternSyntax};
use dirstat_core::mime::{self, MimeCategorizer};
use dirstat_core::pkg::ScanTarget;
use dirstat_core::process::OutputLine;
use dirstat_core::queue::ReadJobQueue;
use dirstat_core::tree::{mode, EntryMeta, NodeId, Tree};

/// Interactive disk-usage analyzer — scan engine, tree model, gzip cache,
/// and cleanup execution (non-interactive CLI front end).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to scan, or `pkg:/<regex>`, or `unpkg:/<dir>`.
    target: Option<String>,

    /// Write a gzip cache of the scanned tree to this file.
    #[arg(long, value_name = "FILE")]
    cache_write: Option<PathBuf>,

    /// Read a previously written gzip cache instead of scanning.
    #[arg(long, value_name = "FILE")]
    cache_read: Option<PathBuf>,

    /// Don't stop at filesystem/mount-point boundaries.
    #[arg(long)]
    cross_filesystems: bool,

    /// Exclude directories matching this fixed-string pattern (repeatable).
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Run a named built-in cleanup against the scan target after scanning.
    #[arg(long, value_name = "NAME")]
    run_cleanup: Option<String>,

    /// Path within the tree the cleanup should act on (defaults to the root).
    #[arg(long, value_name = "PATH")]
    on: Option<String>,

    /// Break down total size by MIME category after scanning.
    #[arg(long)]
    categorize: bool,
}

/// Sums each file's effective size into its MIME category, walking the
/// tree depth-first. Symlinks and dot entries are visited like any other
/// child since `visible_children` already flattens dot-entry files in.
fn categorize_sizes(tree: &Tree, categorizer: &mut MimeCategorizer, dir_id: NodeId, totals: &mut HashMap<String, u64>) {
    for child in tree.visible_children(dir_id) {
        let Some(node) = tree.node(child) else { continue };
        if node.is_dir() {
            if !node.is_pseudo_dir() {
                categorize_sizes(tree, categorizer, child, totals);
            }
            continue;
        }
        let is_executable = node.meta.mode & 0o111 != 0;
        let category = categorizer
            .category_for_entry(&node.meta.name, node.meta.is_sym_link(), is_executable)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "Other".to_string());
        *totals.entry(category).or_insert(0) += node.meta.effective_size();
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn root_meta(path: &std::path::Path) -> Result<EntryMeta> {
    let m = fs::symlink_metadata(path).with_context(|| format!("cannot stat {}", path.display()))?;
    Ok(EntryMeta {
        name: path.to_string_lossy().to_string(),
        mode: m.mode(),
        links: m.nlink(),
        size: m.len(),
        blocks: m.blocks(),
        mtime: m.mtime(),
        device: m.dev(),
        is_local_file: true,
        is_sparse_file: false,
    })
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Prompts on stdin/stderr for a yes/no answer before running a cleanup
/// whose `ask_for_confirmation` is set. Anything starting with `y`/`Y`
/// counts as yes; EOF or anything else declines.
fn confirm_stdin(cleanup: &cleanup::Cleanup) -> bool {
    use std::io::Write;
    eprint!("Run cleanup {:?} ({})? [y/N] ", cleanup.id, cleanup.title);
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().chars().next(), Some('y') | Some('Y'))
}

fn print_output_line(line: OutputLine) {
    match line {
        OutputLine::Stdout(text) => println!("{text}"),
        OutputLine::Stderr(text) => eprintln!("{text}"),
        OutputLine::Finished { exit_code } => {
            info!(exit_code, "cleanup command finished");
        }
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut exclude_rules = ExcludeRules::load(&exclude::default_path())?;
    for pattern in &cli.excludes {
        exclude_rules.add(ExcludeRule::new(pattern.clone(), PatternSyntax::FixedString));
    }

    let mut tree = Tree::new();

    if let Some(cache_path) = &cli.cache_read {
        let placeholder = EntryMeta {
            name: cli.target.clone().unwrap_or_else(|| "/".to_string()),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 0,
            blocks: 0,
            mtime: 0,
            device: 0,
            is_local_file: false,
            is_sparse_file: false,
        };
        let root = tree.set_root(placeholder);
        let mut reader = CacheReader::open(cache_path, root)?;
        while reader.read_one(&mut tree)? {}
        tree.finalize_all(root)?;
        info!(path = %cache_path.display(), "loaded cache");

        println!("{}", tree.url(root));
        println!("  total size:  {}", human_size(tree.total_size(root)));
        println!("  items:       {}", tree.total_items(root));
    } else {
        let target = ScanTarget::parse(&cli.target.clone().unwrap_or_else(|| ".".to_string()));
        let local_path = match target {
            ScanTarget::Local(p) => p,
            ScanTarget::Pkg(_) | ScanTarget::Unpkg(_) => {
                bail!("package-manager scan targets are not supported by this build")
            }
        };
        let local_path = local_path.canonicalize().unwrap_or(local_path);

        let meta = root_meta(&local_path)?;
        let root_device = meta.device;
        let root = tree.set_root(meta);
        tree.set_cross_filesystems(cli.cross_filesystems);

        let mut queue = ReadJobQueue::new(exclude_rules);
        queue.enqueue_local_dir(
            &mut tree,
            root,
            local_path.clone(),
            !cli.cross_filesystems,
            Some(root_device),
        );
        queue.run_until_idle(&mut tree);
        tree.finalize_all(root)?;

        info!(
            path = %local_path.display(),
            size = tree.total_size(root),
            items = tree.total_items(root),
            "scan finished"
        );

        println!("{}", local_path.display());
        println!("  total size:  {}", human_size(tree.total_size(root)));
        println!("  items:       {}", tree.total_items(root));
        println!("  files:       {}", tree.total_files(root));
        println!("  directories: {}", tree.total_sub_dirs(root));

        if let Some(cache_path) = &cli.cache_write {
            CacheWriter::write_to_path(&mut tree, root, cache_path)?;
            info!(path = %cache_path.display(), "wrote cache");
        }

        if cli.categorize {
            let mut categorizer = MimeCategorizer::load_or_default(&mime::default_path())?;
            let mut totals = HashMap::new();
            categorize_sizes(&tree, &mut categorizer, root, &mut totals);
            let mut rows: Vec<(String, u64)> = totals.into_iter().collect();
            rows.sort_by(|a, b| b.1.cmp(&a.1));
            println!("  by category:");
            for (name, size) in rows {
                println!("    {name:<24} {}", human_size(size));
            }
        }
    }

    if let Some(name) = &cli.run_cleanup {
        let root = tree.root().context("empty tree, nothing to run a cleanup on")?;
        let target_id = match &cli.on {
            Some(path) => tree.locate_path(path).with_context(|| format!("no such item: {path}"))?,
            None => root,
        };

        let collection = CleanupCollection::load_or_default(&cleanup::default_path())?;
        if collection.find(name).is_none() {
            bail!("no such cleanup: {name}");
        }

        // Cleanups can trigger a refresh, which needs its own read-job
        // queue — the scan queue above has already been consumed.
        let mut cleanup_queue = ReadJobQueue::new(ExcludeRules::load(&exclude::default_path())?);
        collection
            .execute(&mut tree, &mut cleanup_queue, name, &[target_id], confirm_stdin, print_output_line)?;
        info!(cleanup = %name, "cleanup finished");
    }

    Ok(())
}
