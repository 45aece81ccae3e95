//! Gzip-compressed, line-oriented cache file codec. Grounded in
//! `kdirtreecache.{h,cpp}`'s `KCacheWriter`/`KCacheReader` — re-expressed
//! as a streaming writer over any `Write` and a pull-based reader that
//! hands one record at a time to [`crate::readjob::CacheReadJob`] so a
//! queue can time-slice it exactly like a live directory read.
//!
//! ## Format
//!
//! ```text
//! [dirstat 1.0 cache file]
//! D /percent/encoded/path mtime:1700000000
//! F name size mtime:1700000000 blocks:8 links:1
//! L name -> target mtime:1700000000
//! ```
//!
//! One directory header (`D`) followed by its direct children, depth
//! first; sizes carry an optional `K`/`M`/`G` suffix (1024-based) when
//! written, always read back as plain bytes internally.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::CacheError;
use crate::tree::{mode, EntryMeta, NodeId, Tree};

const HEADER: &str = "[dirstat 1.0 cache file]";

/// Name of the cache file a local directory read auto-discovers and
/// replays from instead of reading the directory itself, mirroring
/// `KDirTree`'s `.qdirstat.cache.gz` sentinel.
pub const CACHE_SENTINEL_NAME: &str = ".qdirstat.cache.gz";

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn format_size(size: u64) -> String {
    const UNIT: u64 = 1024;
    if size == 0 {
        return "0".to_string();
    }
    if size % (UNIT * UNIT * UNIT) == 0 {
        format!("{}G", size / (UNIT * UNIT * UNIT))
    } else if size % (UNIT * UNIT) == 0 {
        format!("{}M", size / (UNIT * UNIT))
    } else if size % UNIT == 0 {
        format!("{}K", size / UNIT)
    } else {
        size.to_string()
    }
}

fn parse_size(s: &str) -> Option<u64> {
    const UNIT: u64 = 1024;
    if let Some(n) = s.strip_suffix('G') {
        Some(n.parse::<u64>().ok()? * UNIT * UNIT * UNIT)
    } else if let Some(n) = s.strip_suffix('M') {
        Some(n.parse::<u64>().ok()? * UNIT * UNIT)
    } else if let Some(n) = s.strip_suffix('K') {
        Some(n.parse::<u64>().ok()? * UNIT)
    } else {
        s.parse().ok()
    }
}

fn type_tag(meta: &EntryMeta) -> &'static str {
    if meta.is_dir() {
        "D"
    } else if meta.is_sym_link() {
        "L"
    } else if meta.is_block_device() {
        "BlockDev"
    } else if meta.is_char_device() {
        "CharDev"
    } else if meta.is_fifo() {
        "FIFO"
    } else if meta.is_socket() {
        "Socket"
    } else {
        "F"
    }
}

fn mode_for_tag(tag: &str) -> u32 {
    match tag {
        "D" => mode::S_IFDIR,
        "L" => mode::S_IFLNK,
        "BlockDev" => mode::S_IFBLK,
        "CharDev" => mode::S_IFCHR,
        "FIFO" => mode::S_IFIFO,
        "Socket" => mode::S_IFSOCK,
        _ => mode::S_IFREG,
    }
}

/// Streams a whole subtree out to a gzip-compressed cache file.
pub struct CacheWriter;

impl CacheWriter {
    pub fn write_to_path(tree: &mut Tree, root: NodeId, path: &Path) -> Result<(), CacheError> {
        let file = std::fs::File::create(path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut writer = BufWriter::new(encoder);
        Self::write(tree, root, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write<W: Write>(tree: &mut Tree, root: NodeId, out: &mut W) -> Result<(), CacheError> {
        writeln!(out, "{HEADER}")?;
        Self::write_dir(tree, root, out)
    }

    fn write_dir<W: Write>(tree: &mut Tree, dir_id: NodeId, out: &mut W) -> Result<(), CacheError> {
        let url = tree.url(dir_id);
        let mtime = tree.node(dir_id).map(|n| n.meta.mtime).unwrap_or(0);
        writeln!(out, "D {} mtime:{mtime}", percent_encode(&url))?;

        let children = tree.visible_children(dir_id);
        for child in children {
            let is_dir = tree.node(child).map(|n| n.is_dir() && !n.is_pseudo_dir()).unwrap_or(false);
            if !is_dir {
                Self::write_entry(tree, child, out)?;
            }
        }
        for child in tree.visible_children(dir_id) {
            let is_dir = tree.node(child).map(|n| n.is_dir() && !n.is_pseudo_dir()).unwrap_or(false);
            if is_dir {
                Self::write_dir(tree, child, out)?;
            }
        }
        Ok(())
    }

    fn write_entry<W: Write>(tree: &Tree, id: NodeId, out: &mut W) -> Result<(), CacheError> {
        let Some(node) = tree.node(id) else { return Ok(()) };
        let meta = &node.meta;
        let tag = type_tag(meta);
        let name = percent_encode(&meta.name);
        write!(out, "{tag} {name} {}", format_size(meta.size))?;
        write!(out, " mtime:{}", meta.mtime)?;
        if meta.blocks != meta.size.div_ceil(512) {
            write!(out, " blocks:{}", meta.blocks)?;
        }
        if meta.links > 1 {
            write!(out, " links:{}", meta.links)?;
        }
        writeln!(out)?;
        Ok(())
    }
}

/// Pull-based reader: `read_one` consumes exactly one record per call so a
/// [`crate::readjob::CacheReadJob`] can time-slice a cache replay the same
/// way it time-slices a live directory read.
///
/// `D` lines carry each directory's full path rather than just a name, so
/// unlike a plain push/pop stack the reader looks a new directory's parent
/// up by its path's parent directory — there's no explicit "end of
/// children" marker in the format, matching `KCacheReader::read()`'s own
/// path-keyed lookup instead of relying on line nesting.
pub struct CacheReader {
    lines: std::io::Lines<BufReader<GzDecoder<std::fs::File>>>,
    by_path: std::collections::HashMap<String, NodeId>,
    current_dir: NodeId,
    root_path: String,
    checked_header: bool,
    line_no: usize,
}

impl CacheReader {
    pub fn open(path: &Path, root: NodeId) -> Result<Self, CacheError> {
        let file = std::fs::File::open(path)?;
        let decoder = GzDecoder::new(file);
        let reader = BufReader::new(decoder);
        Ok(Self {
            lines: reader.lines(),
            by_path: std::collections::HashMap::new(),
            current_dir: root,
            root_path: String::new(),
            checked_header: false,
            line_no: 0,
        })
    }

    /// Reads and applies the next non-empty line. Returns `Ok(false)` at
    /// EOF, `Ok(true)` if more records remain.
    pub fn read_one(&mut self, tree: &mut Tree) -> Result<bool, CacheError> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(false);
            };
            self.line_no += 1;
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if !self.checked_header {
                self.checked_header = true;
                if line != HEADER {
                    return Err(CacheError::MissingHeader);
                }
                continue;
            }

            self.apply_line(tree, line)?;
            return Ok(true);
        }
    }

    fn apply_line(&mut self, tree: &mut Tree, line: &str) -> Result<(), CacheError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let malformed = || CacheError::MalformedLine {
            line_no: self.line_no,
            text: line.to_string(),
        };

        match fields.first().copied() {
            Some("D") => {
                let path_field = fields.get(1).ok_or_else(malformed)?;
                let path = percent_decode(path_field);
                let mtime = parse_kv(&fields, "mtime").unwrap_or(0);

                if self.by_path.is_empty() {
                    // First D line is the cache's own root; fold its
                    // metadata into the caller-provided root node instead
                    // of creating a duplicate.
                    self.root_path = path.clone();
                    if let Some(node) = tree.node_mut(self.current_dir) {
                        node.meta.mtime = mtime;
                    }
                    self.by_path.insert(path, self.current_dir);
                    return Ok(());
                }

                let parent_path = path.trim_end_matches('/').rsplit_once('/').map(|(p, _)| p);
                let parent = parent_path
                    .and_then(|p| {
                        let key = if p.is_empty() { "/" } else { p };
                        self.by_path.get(key).copied()
                    })
                    .unwrap_or(self.current_dir);

                let name = PathBuf::from(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let meta = EntryMeta {
                    name,
                    mode: mode::S_IFDIR | 0o755,
                    links: 1,
                    size: 0,
                    blocks: 0,
                    mtime,
                    device: 0,
                    is_local_file: false,
                    is_sparse_file: false,
                };
                let dir_id = tree
                    .create_dir(parent, meta)
                    .map_err(|_| CacheError::UnlocatableDir(PathBuf::from(&path)))?;
                self.by_path.insert(path, dir_id);
                self.current_dir = dir_id;
            }
            Some(tag @ ("F" | "L" | "BlockDev" | "CharDev" | "FIFO" | "Socket")) => {
                let name = percent_decode(fields.get(1).ok_or_else(malformed)?);
                let size = fields.get(2).and_then(|s| parse_size(s)).unwrap_or(0);
                let mtime = parse_kv(&fields, "mtime").unwrap_or(0);
                let explicit_blocks = parse_kv(&fields, "blocks");
                let blocks = explicit_blocks.unwrap_or_else(|| size.div_ceil(512));
                let links = parse_kv(&fields, "links").unwrap_or(1);
                let meta = EntryMeta {
                    name,
                    mode: mode_for_tag(tag) | 0o644,
                    links,
                    size,
                    blocks,
                    mtime,
                    device: 0,
                    is_local_file: false,
                    // The writer only ever emits `blocks:` for a sparse
                    // file (blocks*512 < size), so its presence here is
                    // itself the sparse-file signal.
                    is_sparse_file: explicit_blocks.is_some(),
                };
                tree.create_entry(self.current_dir, meta).map_err(|_| malformed())?;
            }
            _ => return Err(malformed()),
        }
        Ok(())
    }
}

/// Reads just enough of a cache file to return its first directory's
/// (percent-decoded) path, without touching any `Tree` — used to decide
/// whether an on-disk `.qdirstat.cache.gz` actually describes the
/// directory it was found in before committing to replay it.
pub fn peek_root_path(path: &Path) -> Result<Option<String>, CacheError> {
    let file = std::fs::File::open(path)?;
    let decoder = GzDecoder::new(file);
    let reader = BufReader::new(decoder);
    let mut checked_header = false;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !checked_header {
            checked_header = true;
            if line != HEADER {
                return Err(CacheError::MissingHeader);
            }
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        return match fields.first().copied() {
            Some("D") => Ok(fields.get(1).map(|p| percent_decode(p))),
            _ => Ok(None),
        };
    }
    Ok(None)
}

fn parse_kv(fields: &[&str], key: &str) -> Option<u64> {
    let prefix = format!("{key}:");
    fields.iter().find_map(|f| f.strip_prefix(prefix.as_str())).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{EntryMeta as Meta};

    fn dir_meta(name: &str) -> Meta {
        Meta {
            name: name.to_string(),
            mode: mode::S_IFDIR | 0o755,
            links: 1,
            size: 4096,
            blocks: 8,
            mtime: 1700000000,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        }
    }

    fn file_meta(name: &str, size: u64) -> Meta {
        Meta {
            name: name.to_string(),
            mode: mode::S_IFREG | 0o644,
            links: 1,
            size,
            blocks: size.div_ceil(512),
            mtime: 1700000000,
            device: 1,
            is_local_file: true,
            is_sparse_file: false,
        }
    }

    #[test]
    fn percent_round_trip() {
        let s = "a dir/with spaces and % sign";
        assert_eq!(percent_decode(&percent_encode(s)), s);
    }

    #[test]
    fn size_round_trip() {
        for size in [0u64, 512, 1024, 2048, 1_048_576, 123] {
            let formatted = format_size(size);
            assert_eq!(parse_size(&formatted), Some(size));
        }
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut tree = Tree::new();
        let mut root_meta = dir_meta("t");
        root_meta.name = "/tmp/dirstat-test".to_string();
        let root = tree.set_root(root_meta);
        let _f = tree.create_entry(root, file_meta("a.txt", 100)).unwrap();
        let sub = tree.create_dir(root, dir_meta("sub")).unwrap();
        let _f2 = tree.create_entry(sub, file_meta("b.txt", 2048)).unwrap();

        let mut sparse = file_meta("sparse.bin", 1_048_576);
        sparse.blocks = 8;
        sparse.is_sparse_file = true;
        tree.create_entry(root, sparse).unwrap();

        let mut hardlink = file_meta("linked.bin", 4096);
        hardlink.links = 2;
        tree.create_entry(root, hardlink).unwrap();

        tree.finalize_local(sub).unwrap();
        tree.finalize_local(root).unwrap();

        let tmp_dir = tempfile::tempdir().unwrap();
        let cache_path = tmp_dir.path().join("test.cache.gz");
        CacheWriter::write_to_path(&mut tree, root, &cache_path).unwrap();
        assert!(std::fs::read(&cache_path).unwrap().len() > 0);

        let mut read_tree = Tree::new();
        let mut placeholder = dir_meta("t");
        placeholder.name = "/tmp/dirstat-test".to_string();
        let read_root = read_tree.set_root(placeholder);
        let mut reader = CacheReader::open(&cache_path, read_root).unwrap();
        while reader.read_one(&mut read_tree).unwrap() {}
        read_tree.finalize_all(read_root).unwrap();

        let sparse_id = read_tree.locate_path("/tmp/dirstat-test/sparse.bin").unwrap();
        let sparse_node = read_tree.node(sparse_id).unwrap();
        assert!(sparse_node.meta.is_sparse_file);
        assert_eq!(sparse_node.meta.effective_size(), 8 * 512);

        let linked_id = read_tree.locate_path("/tmp/dirstat-test/linked.bin").unwrap();
        let linked_node = read_tree.node(linked_id).unwrap();
        assert_eq!(linked_node.meta.links, 2);
        assert_eq!(linked_node.meta.effective_size(), 4096 / 2);

        assert_eq!(read_tree.total_files(read_root), 4);
        assert_eq!(read_tree.total_sub_dirs(read_root), 1);
    }
}
