//! The archiver: packs a directory tree into an archive, loads archive
//! metadata, and extracts archives back to plain directories.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use clip_common::hash::ContentHasher;
use clip_common::path::to_archive_path;

use crate::error::FormatError;
use crate::header::{ClipHeader, ClipTrailer, FORMAT_VERSION, HEADER_SIZE, TRAILER_SIZE};
use crate::index::MetadataIndex;
use crate::node::{ClipNode, NodeAttr, NodeType};

/// Copy buffer for streaming file content.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// A parsed archive: validated header plus the loaded node index.
#[derive(Debug)]
pub struct ArchiveMeta {
    header: ClipHeader,
    archive_id: String,
    index: MetadataIndex,
}

impl ArchiveMeta {
    /// Build from a decoded header and the raw metadata-region bytes.
    ///
    /// Verifies the metadata digest, decodes the node records, and runs the
    /// full index validation. Works for locally and remotely fetched bytes.
    ///
    /// # Errors
    /// `CorruptArchive` on digest mismatch, undecodable metadata, or any
    /// index invariant violation.
    pub fn from_parts(header: ClipHeader, metadata: &[u8]) -> Result<Self, FormatError> {
        let mut hasher: ContentHasher = ContentHasher::new();
        hasher.update(metadata);
        if hasher.finish_bytes() != header.metadata_digest {
            return Err(FormatError::corrupt("metadata digest mismatch"));
        }

        let nodes: Vec<ClipNode> = serde_json::from_slice(metadata)
            .map_err(|e| FormatError::corrupt(format!("metadata decode failed: {}", e)))?;
        let index: MetadataIndex = MetadataIndex::from_nodes(nodes, header.content_len())?;

        Ok(Self {
            archive_id: header.archive_id(),
            header,
            index,
        })
    }

    pub fn header(&self) -> &ClipHeader {
        &self.header
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// Stable identity of the archive, keyed into the block cache.
    pub fn archive_id(&self) -> &str {
        &self.archive_id
    }

    /// Absolute byte offset of the content region.
    pub fn content_offset(&self) -> u64 {
        self.header.content_offset
    }
}

/// A source entry discovered by the walk, before node construction.
struct SourceEntry {
    os_path: PathBuf,
    archive_path: String,
    meta: fs::Metadata,
}

/// Creates, inspects, and extracts archives.
#[derive(Debug, Default)]
pub struct ClipArchiver;

impl ClipArchiver {
    pub fn new() -> Self {
        Self
    }

    /// Pack the directory tree at `source` into an archive at `output`.
    ///
    /// The tree is walked without following symlinks; entries are sorted by
    /// archive path, assigned monotonically increasing inodes, and regular
    /// file content is streamed into the content region while its digest is
    /// computed.
    ///
    /// # Errors
    /// `IoError` for filesystem problems, `UnsupportedNodeType` for entries
    /// that are not files, directories, or symlinks.
    pub fn create(&self, source: &Path, output: &Path) -> Result<(), FormatError> {
        let entries: Vec<SourceEntry> = self.collect_entries(source)?;

        let out_file: File = File::create(output)
            .map_err(|e| FormatError::io(output.display().to_string(), e))?;
        let mut writer: BufWriter<File> = BufWriter::new(out_file);

        // Header placeholder; rewritten once offsets are known.
        writer
            .write_all(&[0u8; HEADER_SIZE])
            .map_err(|e| FormatError::io(output.display().to_string(), e))?;

        let content_offset: u64 = HEADER_SIZE as u64;
        let mut cursor: u64 = 0;
        let mut nodes: Vec<ClipNode> = Vec::with_capacity(entries.len());

        for (idx, entry) in entries.iter().enumerate() {
            let ino: u64 = (idx + 1) as u64;
            let node: ClipNode = self.emit_node(entry, ino, &mut writer, &mut cursor)?;
            debug!(path = %node.path, ino, "archived node");
            nodes.push(node);
        }

        let metadata: Vec<u8> = serde_json::to_vec(&nodes)
            .map_err(|e| FormatError::corrupt(format!("metadata encode failed: {}", e)))?;
        let mut hasher: ContentHasher = ContentHasher::new();
        hasher.update(&metadata);

        let header: ClipHeader = ClipHeader {
            version: FORMAT_VERSION,
            flags: 0,
            metadata_offset: content_offset + cursor,
            metadata_len: metadata.len() as u64,
            content_offset,
            metadata_digest: hasher.finish_bytes(),
        };
        let trailer: ClipTrailer = ClipTrailer {
            metadata_offset: header.metadata_offset,
            metadata_len: header.metadata_len,
        };

        writer
            .write_all(&metadata)
            .and_then(|_| writer.write_all(&trailer.encode()))
            .and_then(|_| writer.flush())
            .map_err(|e| FormatError::io(output.display().to_string(), e))?;

        let mut out_file: File = writer
            .into_inner()
            .map_err(|e| FormatError::io(output.display().to_string(), e.into_error()))?;
        out_file
            .seek(SeekFrom::Start(0))
            .and_then(|_| out_file.write_all(&header.encode()))
            .map_err(|e| FormatError::io(output.display().to_string(), e))?;

        Ok(())
    }

    /// Parse and validate the archive at `path`, returning its metadata.
    ///
    /// # Errors
    /// `CorruptArchive` for any framing or index violation, `IoError` for
    /// read failures.
    pub fn extract_metadata(&self, archive: &Path) -> Result<ArchiveMeta, FormatError> {
        let mut file: File =
            File::open(archive).map_err(|e| FormatError::io(archive.display().to_string(), e))?;
        let archive_len: u64 = file
            .metadata()
            .map_err(|e| FormatError::io(archive.display().to_string(), e))?
            .len();
        if archive_len < (HEADER_SIZE + TRAILER_SIZE) as u64 {
            return Err(FormatError::corrupt(format!(
                "archive too small: {} bytes",
                archive_len
            )));
        }

        let mut header_buf: [u8; HEADER_SIZE] = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)
            .map_err(|e| FormatError::io(archive.display().to_string(), e))?;
        let header: ClipHeader = ClipHeader::decode(&header_buf)?;

        let mut trailer_buf: [u8; TRAILER_SIZE] = [0u8; TRAILER_SIZE];
        file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))
            .and_then(|_| file.read_exact(&mut trailer_buf))
            .map_err(|e| FormatError::io(archive.display().to_string(), e))?;
        let trailer: ClipTrailer = ClipTrailer::decode(&trailer_buf)?;
        if !trailer.matches(&header) {
            return Err(FormatError::corrupt(
                "header and trailer disagree on metadata location",
            ));
        }
        header.validate_bounds(archive_len)?;

        let mut metadata: Vec<u8> = vec![0u8; header.metadata_len as usize];
        file.seek(SeekFrom::Start(header.metadata_offset))
            .and_then(|_| file.read_exact(&mut metadata))
            .map_err(|e| FormatError::io(archive.display().to_string(), e))?;

        ArchiveMeta::from_parts(header, &metadata)
    }

    /// Unpack the archive at `archive` into the directory `output`.
    ///
    /// Recreates directories, files, and symlinks with their stored modes
    /// and mtimes. File content is digest-verified while it is copied out.
    pub fn extract(&self, archive: &Path, output: &Path) -> Result<(), FormatError> {
        let meta: ArchiveMeta = self.extract_metadata(archive)?;
        let file: File =
            File::open(archive).map_err(|e| FormatError::io(archive.display().to_string(), e))?;
        let mut reader: BufReader<File> = BufReader::new(file);

        // Directory mtimes are restored after all children exist, deepest
        // first, so later writes do not clobber them.
        let mut dir_times: Vec<(usize, PathBuf, filetime::FileTime)> = Vec::new();

        for node in meta.index().iter() {
            let rel: &str = node.path.trim_start_matches('/');
            let dest: PathBuf = if rel.is_empty() {
                output.to_path_buf()
            } else {
                output.join(rel)
            };
            let dest_display = || dest.display().to_string();

            match node.node_type {
                NodeType::Directory => {
                    fs::create_dir_all(&dest).map_err(|e| FormatError::io(dest_display(), e))?;
                    fs::set_permissions(&dest, fs::Permissions::from_mode(node.attr.mode & 0o7777))
                        .map_err(|e| FormatError::io(dest_display(), e))?;
                    dir_times.push((
                        node.path.matches('/').count(),
                        dest.clone(),
                        filetime::FileTime::from_unix_time(
                            node.attr.mtime,
                            node.attr.mtime_nsec,
                        ),
                    ));
                }
                NodeType::File => {
                    self.extract_file(&mut reader, &meta, node, &dest)?;
                    fs::set_permissions(&dest, fs::Permissions::from_mode(node.attr.mode & 0o7777))
                        .map_err(|e| FormatError::io(dest_display(), e))?;
                    filetime::set_file_mtime(
                        &dest,
                        filetime::FileTime::from_unix_time(node.attr.mtime, node.attr.mtime_nsec),
                    )
                    .map_err(|e| FormatError::io(dest_display(), e))?;
                }
                NodeType::SymLink => {
                    if dest.symlink_metadata().is_ok() {
                        fs::remove_file(&dest).map_err(|e| FormatError::io(dest_display(), e))?;
                    }
                    std::os::unix::fs::symlink(&node.target, &dest)
                        .map_err(|e| FormatError::io(dest_display(), e))?;
                }
            }
        }

        dir_times.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, dir, mtime) in dir_times {
            filetime::set_file_mtime(&dir, mtime)
                .map_err(|e| FormatError::io(dir.display().to_string(), e))?;
        }

        Ok(())
    }

    /// Walk the source tree and return entries sorted by archive path.
    fn collect_entries(&self, source: &Path) -> Result<Vec<SourceEntry>, FormatError> {
        let source_meta: fs::Metadata = fs::symlink_metadata(source)
            .map_err(|e| FormatError::io(source.display().to_string(), e))?;
        if !source_meta.is_dir() {
            return Err(FormatError::io(
                source.display().to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "source is not a directory"),
            ));
        }

        let mut entries: Vec<SourceEntry> = Vec::new();
        for entry in WalkDir::new(source).follow_links(false) {
            let entry: walkdir::DirEntry = entry.map_err(|e| {
                let path: String = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                FormatError::io(path, e.into())
            })?;

            let meta: fs::Metadata = entry
                .metadata()
                .map_err(|e| FormatError::io(entry.path().display().to_string(), e.into()))?;
            let file_type: fs::FileType = meta.file_type();
            if !file_type.is_file() && !file_type.is_dir() && !file_type.is_symlink() {
                return Err(FormatError::UnsupportedNodeType {
                    path: entry.path().display().to_string(),
                });
            }

            let archive_path: String = to_archive_path(entry.path(), source)?;
            entries.push(SourceEntry {
                os_path: entry.path().to_path_buf(),
                archive_path,
                meta,
            });
        }

        entries.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
        Ok(entries)
    }

    /// Build one node, streaming file content into the writer.
    fn emit_node(
        &self,
        entry: &SourceEntry,
        ino: u64,
        writer: &mut BufWriter<File>,
        cursor: &mut u64,
    ) -> Result<ClipNode, FormatError> {
        let meta: &fs::Metadata = &entry.meta;
        let mut attr: NodeAttr = NodeAttr {
            ino,
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            blocks: meta.blocks(),
            atime: meta.atime(),
            atime_nsec: meta.atime_nsec() as u32,
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec() as u32,
            ctime: meta.ctime(),
            ctime_nsec: meta.ctime_nsec() as u32,
        };

        let file_type: fs::FileType = meta.file_type();
        if file_type.is_dir() {
            attr.size = 0;
            attr.blocks = 0;
            return Ok(ClipNode {
                path: entry.archive_path.clone(),
                node_type: NodeType::Directory,
                attr,
                data_offset: 0,
                data_len: 0,
                target: String::new(),
                content_hash: String::new(),
            });
        }

        if file_type.is_symlink() {
            let target: PathBuf = fs::read_link(&entry.os_path)
                .map_err(|e| FormatError::io(entry.os_path.display().to_string(), e))?;
            let target: String = target.to_str().map(str::to_owned).ok_or_else(|| {
                clip_common::ArchivePathError::NotUtf8 {
                    path: entry.os_path.display().to_string(),
                }
            })?;
            attr.size = target.len() as u64;
            return Ok(ClipNode {
                path: entry.archive_path.clone(),
                node_type: NodeType::SymLink,
                attr,
                data_offset: 0,
                data_len: 0,
                target,
                content_hash: String::new(),
            });
        }

        // Regular file: stream content, hashing as we go. The streamed byte
        // count is authoritative over the stat size.
        let data_offset: u64 = *cursor;
        let mut src: File = File::open(&entry.os_path)
            .map_err(|e| FormatError::io(entry.os_path.display().to_string(), e))?;
        let mut hasher: ContentHasher = ContentHasher::new();
        let mut buf: Vec<u8> = vec![0u8; COPY_BUF_SIZE];
        let mut copied: u64 = 0;

        loop {
            let n: usize = src
                .read(&mut buf)
                .map_err(|e| FormatError::io(entry.os_path.display().to_string(), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer
                .write_all(&buf[..n])
                .map_err(|e| FormatError::io(entry.os_path.display().to_string(), e))?;
            copied += n as u64;
        }

        *cursor += copied;
        attr.size = copied;
        attr.blocks = (copied + 511) / 512;

        Ok(ClipNode {
            path: entry.archive_path.clone(),
            node_type: NodeType::File,
            attr,
            data_offset,
            data_len: copied,
            target: String::new(),
            content_hash: hasher.finish_hex(),
        })
    }

    /// Copy one file's content region range into `dest`, verifying the
    /// stored digest along the way.
    fn extract_file(
        &self,
        reader: &mut BufReader<File>,
        meta: &ArchiveMeta,
        node: &ClipNode,
        dest: &Path,
    ) -> Result<(), FormatError> {
        reader
            .seek(SeekFrom::Start(meta.content_offset() + node.data_offset))
            .map_err(|e| FormatError::io(dest.display().to_string(), e))?;

        let out: File =
            File::create(dest).map_err(|e| FormatError::io(dest.display().to_string(), e))?;
        let mut out: BufWriter<File> = BufWriter::new(out);
        let mut hasher: ContentHasher = ContentHasher::new();
        let mut buf: Vec<u8> = vec![0u8; COPY_BUF_SIZE];
        let mut remaining: u64 = node.data_len;

        while remaining > 0 {
            let want: usize = remaining.min(COPY_BUF_SIZE as u64) as usize;
            reader
                .read_exact(&mut buf[..want])
                .map_err(|e| FormatError::io(dest.display().to_string(), e))?;
            hasher.update(&buf[..want]);
            out.write_all(&buf[..want])
                .map_err(|e| FormatError::io(dest.display().to_string(), e))?;
            remaining -= want as u64;
        }
        out.flush()
            .map_err(|e| FormatError::io(dest.display().to_string(), e))?;

        if !node.content_hash.is_empty() && hasher.finish_hex() != node.content_hash {
            return Err(FormatError::corrupt(format!(
                "content digest mismatch at {}",
                node.path
            )));
        }
        Ok(())
    }
}
