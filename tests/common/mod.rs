//! In-memory block device and a small image builder for the tests.
//!
//! The builder lays files out the way `mksquashfs` does for the cases the
//! driver must handle: data blocks in inode order, sub-block tails packed
//! into shared fragment blocks, listings split across 8KiB metadata blocks,
//! directory headers every 256 entries, and the root inode numbered last.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

pub const NO_FRAGMENT: u32 = 0xffff_ffff;
pub const NOT_SET: u64 = u64::MAX;
const METADATA_MAX: usize = 8192;
const DATA_UNCOMPRESSED: u32 = 1 << 24;

// ---------------------------------------------------------------- device

pub struct MemDevice {
    data: Vec<u8>,
    sector_size: u32,
}

impl MemDevice {
    /// Wrap raw image bytes, padding to whole sectors.
    pub fn new(mut data: Vec<u8>, sector_size: u32) -> Self {
        let rem = data.len() % sector_size as usize;
        if rem != 0 {
            data.resize(data.len() + sector_size as usize - rem, 0u8);
        }
        Self { data, sector_size }
    }
}

impl sqfs::BlockDevice for MemDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read(&mut self, sector: u64, dst: &mut [u8]) -> std::io::Result<()> {
        let start = (sector * u64::from(self.sector_size)) as usize;
        let end = start + dst.len();
        if end > self.data.len() {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        dst.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

// ---------------------------------------------------------------- tree

pub struct Node {
    name: Vec<u8>,
    kind: NodeKind,
}

enum NodeKind {
    File {
        content: Vec<u8>,
        no_fragment: bool,
        sparse: bool,
    },
    Dir(Vec<Node>),
    Symlink(Vec<u8>),
}

pub fn file(name: &str, content: &[u8]) -> Node {
    Node {
        name: name.as_bytes().to_vec(),
        kind: NodeKind::File {
            content: content.to_vec(),
            no_fragment: false,
            sparse: false,
        },
    }
}

/// A file stored entirely in data blocks, tail included.
pub fn file_whole_blocks(name: &str, content: &[u8]) -> Node {
    Node {
        name: name.as_bytes().to_vec(),
        kind: NodeKind::File {
            content: content.to_vec(),
            no_fragment: true,
            sparse: false,
        },
    }
}

/// A file whose all-zero blocks are stored as sparse holes.
pub fn file_sparse(name: &str, content: &[u8]) -> Node {
    Node {
        name: name.as_bytes().to_vec(),
        kind: NodeKind::File {
            content: content.to_vec(),
            no_fragment: true,
            sparse: true,
        },
    }
}

pub fn dir(name: &str, children: Vec<Node>) -> Node {
    Node {
        name: name.as_bytes().to_vec(),
        kind: NodeKind::Dir(children),
    }
}

pub fn symlink(name: &str, target: &str) -> Node {
    Node {
        name: name.as_bytes().to_vec(),
        kind: NodeKind::Symlink(target.as_bytes().to_vec()),
    }
}

// ---------------------------------------------------------------- options

pub struct ImageOptions {
    pub block_size: u32,
    pub codec: Codec,
    pub compress_metadata: bool,
    pub compress_data: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            codec: Codec::Gzip,
            compress_metadata: false,
            compress_data: true,
        }
    }
}

pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub inode_table: u64,
    pub dir_table: u64,
}

// ---------------------------------------------------------------- packing

/// Codec an image is built with. The dev-dependencies always carry every
/// encoder; reading the resulting image back needs the matching crate
/// feature on the driver side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Xz,
    Zstd,
}

impl Codec {
    /// Compressor id as stored in the superblock
    fn id(self) -> u16 {
        match self {
            Codec::Gzip => 1,
            Codec::Xz => 4,
            Codec::Zstd => 6,
        }
    }
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn compress(codec: Codec, data: &[u8]) -> Vec<u8> {
    match codec {
        Codec::Gzip => zlib(data),
        Codec::Xz => {
            let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        }
        Codec::Zstd => zstd::bulk::compress(data, 3).unwrap(),
    }
}

/// One stored metadata block: 2-byte header plus payload, compressed when it helps.
fn metadata_block(payload: &[u8], compress_payload: bool, codec: Codec) -> Vec<u8> {
    assert!(payload.len() <= METADATA_MAX);
    if compress_payload {
        let packed = compress(codec, payload);
        if packed.len() < payload.len() {
            let mut out = (packed.len() as u16).to_le_bytes().to_vec();
            out.extend_from_slice(&packed);
            return out;
        }
    }
    let mut out = ((payload.len() as u16) | 0x8000).to_le_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Split a decoded stream into stored metadata blocks; returns the stored
/// bytes and each block's offset relative to the region start.
fn pack_metadata_blocks(stream: &[u8], compress_payload: bool, codec: Codec) -> (Vec<u8>, Vec<u64>) {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    for chunk in stream.chunks(METADATA_MAX) {
        offsets.push(out.len() as u64);
        out.extend(metadata_block(chunk, compress_payload, codec));
    }
    (out, offsets)
}

/// Store one data block, compressed when it helps. Returns stored bytes and
/// the raw 32-bit size field.
fn store_block(chunk: &[u8], compress_payload: bool, codec: Codec) -> (Vec<u8>, u32) {
    if compress_payload {
        let packed = compress(codec, chunk);
        if packed.len() < chunk.len() {
            let raw = packed.len() as u32;
            return (packed, raw);
        }
    }
    (chunk.to_vec(), chunk.len() as u32 | DATA_UNCOMPRESSED)
}

// ---------------------------------------------------------------- builder

struct Flat {
    number: u32,
    kind: FlatKind,
}

enum FlatKind {
    File {
        content: Vec<u8>,
        no_fragment: bool,
        sparse: bool,
    },
    Dir {
        entries: Vec<(Vec<u8>, u32, u16)>,
    },
    Symlink(Vec<u8>),
}

/// Post-order numbering: children (sorted by name) before their parent, so
/// the root ends up with the highest number, equal to the inode count.
fn flatten(children: Vec<Node>, flat: &mut Vec<Flat>) -> Vec<(Vec<u8>, u32, u16)> {
    let mut children = children;
    children.sort_by(|a, b| a.name.cmp(&b.name));

    let mut entries = Vec::new();
    for child in children {
        match child.kind {
            NodeKind::File {
                content,
                no_fragment,
                sparse,
            } => {
                let number = flat.len() as u32 + 1;
                flat.push(Flat {
                    number,
                    kind: FlatKind::File {
                        content,
                        no_fragment,
                        sparse,
                    },
                });
                entries.push((child.name, number, 2));
            }
            NodeKind::Dir(grandchildren) => {
                let sub_entries = flatten(grandchildren, flat);
                let number = flat.len() as u32 + 1;
                flat.push(Flat {
                    number,
                    kind: FlatKind::Dir {
                        entries: sub_entries,
                    },
                });
                entries.push((child.name, number, 1));
            }
            NodeKind::Symlink(target) => {
                let number = flat.len() as u32 + 1;
                flat.push(Flat {
                    number,
                    kind: FlatKind::Symlink(target),
                });
                entries.push((child.name, number, 3));
            }
        }
    }
    entries
}

fn pack_listing(entries: &[(Vec<u8>, u32, u16)]) -> Vec<u8> {
    let mut out = Vec::new();
    for group in entries.chunks(256) {
        let base = group[0].1;
        out.extend_from_slice(&(group.len() as u32 - 1).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&base.to_le_bytes());
        for (name, number, tag) in group {
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&((number - base) as u16).to_le_bytes());
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(name.len() as u16 - 1).to_le_bytes());
            out.extend_from_slice(name);
        }
    }
    out
}

fn inode_header(tag: u16, number: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&0o755u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&number.to_le_bytes());
    out
}

struct FileLoc {
    blocks_start: u64,
    sizes: Vec<u32>,
    frag_index: u32,
    frag_offset: u32,
}

pub fn build_image(root_children: Vec<Node>, opts: &ImageOptions) -> BuiltImage {
    let block_size = opts.block_size as usize;

    let mut flat = Vec::new();
    let root_entries = flatten(root_children, &mut flat);
    let root_number = flat.len() as u32 + 1;
    flat.push(Flat {
        number: root_number,
        kind: FlatKind::Dir {
            entries: root_entries,
        },
    });
    let inode_count = flat.len() as u32;

    // data region: file blocks in inode order, fragment blocks flushed as
    // their shared block fills
    let mut data: Vec<u8> = Vec::new();
    let mut frag_entries: Vec<(u64, u32)> = Vec::new();
    let mut cur_frag: Vec<u8> = Vec::new();
    let mut file_locs: HashMap<u32, FileLoc> = HashMap::new();

    fn flush_frag(
        data: &mut Vec<u8>,
        cur_frag: &mut Vec<u8>,
        frag_entries: &mut Vec<(u64, u32)>,
        compress_payload: bool,
        codec: Codec,
    ) {
        if cur_frag.is_empty() {
            return;
        }
        let start = 96 + data.len() as u64;
        let (stored, raw) = store_block(cur_frag, compress_payload, codec);
        data.extend(stored);
        frag_entries.push((start, raw));
        cur_frag.clear();
    }

    for node in &flat {
        let FlatKind::File {
            content,
            no_fragment,
            sparse,
        } = &node.kind
        else {
            continue;
        };

        let mut blocks_end = content.len();
        let mut tail: Option<&[u8]> = None;
        if !*no_fragment {
            let tail_len = content.len() % block_size;
            if tail_len > 0 {
                blocks_end = content.len() - tail_len;
                tail = Some(&content[blocks_end..]);
            }
        }

        let blocks_start = if blocks_end > 0 {
            96 + data.len() as u64
        } else {
            0
        };
        let mut sizes = Vec::new();
        for chunk in content[..blocks_end].chunks(block_size) {
            if *sparse && chunk.iter().all(|b| *b == 0) {
                sizes.push(0);
                continue;
            }
            let (stored, raw) = store_block(chunk, opts.compress_data, opts.codec);
            data.extend(stored);
            sizes.push(raw);
        }

        let (frag_index, frag_offset) = match tail {
            Some(tail) => {
                if cur_frag.len() + tail.len() > block_size {
                    flush_frag(
                        &mut data,
                        &mut cur_frag,
                        &mut frag_entries,
                        opts.compress_data,
                        opts.codec,
                    );
                }
                let offset = cur_frag.len() as u32;
                cur_frag.extend_from_slice(tail);
                (frag_entries.len() as u32, offset)
            }
            None => (NO_FRAGMENT, 0),
        };

        file_locs.insert(
            node.number,
            FileLoc {
                blocks_start,
                sizes,
                frag_index,
                frag_offset,
            },
        );
    }
    flush_frag(
        &mut data,
        &mut cur_frag,
        &mut frag_entries,
        opts.compress_data,
        opts.codec,
    );

    // directory table: listings concatenated in inode order, split at 8KiB
    let mut dir_stream = Vec::new();
    let mut dir_stream_offsets: HashMap<u32, (usize, usize)> = HashMap::new();
    for node in &flat {
        if let FlatKind::Dir { entries } = &node.kind {
            let listing = pack_listing(entries);
            dir_stream_offsets.insert(node.number, (dir_stream.len(), listing.len()));
            dir_stream.extend(listing);
        }
    }
    let (dir_bytes, dir_disk_offsets) =
        pack_metadata_blocks(&dir_stream, opts.compress_metadata, opts.codec);

    // inode table
    let mut inode_stream = Vec::new();
    let mut root_stream_offset = 0usize;
    for node in &flat {
        if node.number == root_number {
            root_stream_offset = inode_stream.len();
        }
        match &node.kind {
            FlatKind::File { content, .. } => {
                let loc = &file_locs[&node.number];
                inode_stream.extend(inode_header(2, node.number));
                inode_stream.extend_from_slice(&(loc.blocks_start as u32).to_le_bytes());
                inode_stream.extend_from_slice(&loc.frag_index.to_le_bytes());
                inode_stream.extend_from_slice(&loc.frag_offset.to_le_bytes());
                inode_stream.extend_from_slice(&(content.len() as u32).to_le_bytes());
                for size in &loc.sizes {
                    inode_stream.extend_from_slice(&size.to_le_bytes());
                }
            }
            FlatKind::Dir { .. } => {
                let (stream_offset, listing_len) = dir_stream_offsets[&node.number];
                let (block_index, block_offset) = if listing_len == 0 {
                    (0u32, 0u16)
                } else {
                    let ordinal = stream_offset / METADATA_MAX;
                    (
                        dir_disk_offsets[ordinal] as u32,
                        (stream_offset % METADATA_MAX) as u16,
                    )
                };
                inode_stream.extend(inode_header(1, node.number));
                inode_stream.extend_from_slice(&block_index.to_le_bytes());
                inode_stream.extend_from_slice(&2u32.to_le_bytes());
                inode_stream.extend_from_slice(&(listing_len as u16 + 3).to_le_bytes());
                inode_stream.extend_from_slice(&block_offset.to_le_bytes());
                inode_stream.extend_from_slice(&0u32.to_le_bytes());
            }
            FlatKind::Symlink(target) => {
                inode_stream.extend(inode_header(3, node.number));
                inode_stream.extend_from_slice(&1u32.to_le_bytes());
                inode_stream.extend_from_slice(&(target.len() as u32).to_le_bytes());
                inode_stream.extend_from_slice(target);
            }
        }
    }
    let (inode_bytes, inode_disk_offsets) =
        pack_metadata_blocks(&inode_stream, opts.compress_metadata, opts.codec);
    let root_inode_ref = (inode_disk_offsets[root_stream_offset / METADATA_MAX] << 16)
        | (root_stream_offset % METADATA_MAX) as u64;

    // layout after the directory table: fragment entry blocks, fragment
    // index, id block, id index
    let inode_table = 96 + data.len() as u64;
    let dir_table = inode_table + inode_bytes.len() as u64;
    let mut tail_sections: Vec<u8> = Vec::new();
    let after_dir = dir_table + dir_bytes.len() as u64;

    let frag_table = if frag_entries.is_empty() {
        NOT_SET
    } else {
        let mut frag_stream = Vec::new();
        for (start, raw) in &frag_entries {
            frag_stream.extend_from_slice(&start.to_le_bytes());
            frag_stream.extend_from_slice(&raw.to_le_bytes());
            frag_stream.extend_from_slice(&0u32.to_le_bytes());
        }
        let (frag_bytes, frag_disk_offsets) =
            pack_metadata_blocks(&frag_stream, opts.compress_metadata, opts.codec);
        let frag_blocks_start = after_dir;
        let index_start = frag_blocks_start + frag_bytes.len() as u64;
        tail_sections.extend(&frag_bytes);
        for offset in &frag_disk_offsets {
            tail_sections.extend_from_slice(&(frag_blocks_start + offset).to_le_bytes());
        }
        index_start
    };

    // one uid/gid entry; the driver never decodes it but the table anchors
    // the end of the region scan
    let id_block_start = after_dir + tail_sections.len() as u64;
    let id_block = metadata_block(&0u32.to_le_bytes(), false, opts.codec);
    let id_table = id_block_start + id_block.len() as u64;
    tail_sections.extend(&id_block);
    tail_sections.extend_from_slice(&id_block_start.to_le_bytes());

    let bytes_used = after_dir + tail_sections.len() as u64;

    // superblock
    let mut image = Vec::new();
    image.extend_from_slice(&0x7371_7368u32.to_le_bytes());
    image.extend_from_slice(&inode_count.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&opts.block_size.to_le_bytes());
    image.extend_from_slice(&(frag_entries.len() as u32).to_le_bytes());
    image.extend_from_slice(&opts.codec.id().to_le_bytes());
    image.extend_from_slice(&(opts.block_size.trailing_zeros() as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&1u16.to_le_bytes());
    image.extend_from_slice(&4u16.to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes());
    image.extend_from_slice(&root_inode_ref.to_le_bytes());
    image.extend_from_slice(&bytes_used.to_le_bytes());
    image.extend_from_slice(&id_table.to_le_bytes());
    image.extend_from_slice(&NOT_SET.to_le_bytes()); // xattr
    image.extend_from_slice(&inode_table.to_le_bytes());
    image.extend_from_slice(&dir_table.to_le_bytes());
    image.extend_from_slice(&frag_table.to_le_bytes());
    image.extend_from_slice(&NOT_SET.to_le_bytes()); // export
    assert_eq!(image.len(), 96);

    image.extend(data);
    image.extend(inode_bytes);
    image.extend(dir_bytes);
    image.extend(tail_sections);
    assert_eq!(image.len() as u64, bytes_used);

    BuiltImage {
        bytes: image,
        inode_table,
        dir_table,
    }
}

// ---------------------------------------------------------------- fixtures

/// The standard tree most tests mount:
///
/// ```text
/// /a/b/c/file      "x"
/// /big.bin         10000 * 0xa5 (two full blocks + 1808-byte fragment tail)
/// /empty/          empty directory
/// /hello.txt       "hello\n"
/// /link            symlink to hello.txt
/// /yyy...y (256)   name at the length limit
/// ```
pub fn fixture_tree() -> Vec<Node> {
    vec![
        dir("a", vec![dir("b", vec![dir("c", vec![file("file", b"x")])])]),
        file("big.bin", &[0xa5; 10000]),
        dir("empty", vec![]),
        file("hello.txt", b"hello\n"),
        symlink("link", "hello.txt"),
        file(&"y".repeat(256), b"limit"),
    ]
}

/// A single directory holding 300 one-byte files, enough for two directory
/// headers and a fragment block shared by every tail.
pub fn many_tree() -> Vec<Node> {
    vec![dir(
        "many",
        (0..300)
            .map(|i| {
                let name = format!("f{i:03}");
                let content = [i as u8];
                file(&name, &content)
            })
            .collect(),
    )]
}

pub fn mount_with(opts: &ImageOptions, sector_size: u32) -> sqfs::Squashfs<MemDevice> {
    let image = build_image(fixture_tree(), opts);
    sqfs::Squashfs::probe(MemDevice::new(image.bytes, sector_size), 0).unwrap()
}

pub fn mount() -> sqfs::Squashfs<MemDevice> {
    mount_with(&ImageOptions::default(), 512)
}
