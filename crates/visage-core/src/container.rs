//! Single-file index container: descriptor table + graph topology.
//!
//! # File structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "VSGIDX01"
//! 0x08     4       u32 LE      N: number of descriptors (== label count)
//! 0x0C     4       u32 LE      D: dimensions
//! 0x10     8       u64 LE      Graph section offset
//! 0x18     N*D*4   [f32 LE]    Descriptor table, label order
//! <offset> ...     graph       VSGRAPH2 section (see hnsw::serialize)
//! ```
//!
//! Labels are implicit: descriptor `i` belongs to label `i`. A container
//! always holds a dense label space — logically deleted labels keep their
//! descriptor bytes until the owner rebuilds.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

use crate::hnsw::Hnsw;

/// Magic bytes identifying an index container.
pub const MAGIC: [u8; 8] = *b"VSGIDX01";

/// Header size: 8 (magic) + 4 (count) + 4 (dim) + 8 (graph offset).
pub const HEADER_SIZE: usize = 24;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("invalid magic bytes: expected VSGIDX01")]
    InvalidMagic,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("truncated container: {0}")]
    Truncated(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed container header.
#[derive(Debug, Clone, Copy)]
pub struct ContainerHeader {
    pub count: u32,
    pub dim: u32,
    pub graph_offset: u64,
}

impl ContainerHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ContainerError::Truncated("header".to_string()));
        }
        if bytes[0..8] != MAGIC {
            return Err(ContainerError::InvalidMagic);
        }

        let count = u32::from_le_bytes(bytes[8..12].try_into().expect("sliced 4 bytes"));
        let dim = u32::from_le_bytes(bytes[12..16].try_into().expect("sliced 4 bytes"));
        let graph_offset = u64::from_le_bytes(bytes[16..24].try_into().expect("sliced 8 bytes"));

        Ok(Self {
            count,
            dim,
            graph_offset,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dim.to_le_bytes());
        buf[16..24].copy_from_slice(&self.graph_offset.to_le_bytes());
        buf
    }
}

/// Write a container holding `vectors` (label order) and `graph`.
///
/// The descriptor block has a fixed size, so the graph offset is known up
/// front and the file is written in one forward pass. The file is synced
/// before returning; atomic replacement (tmp + rename) is the caller's
/// concern.
pub fn write_container<P: AsRef<Path>>(
    path: P,
    dim: usize,
    vectors: &[Vec<f32>],
    graph: &Hnsw,
) -> Result<(), ContainerError> {
    let graph_offset = (HEADER_SIZE + vectors.len() * dim * std::mem::size_of::<f32>()) as u64;
    let header = ContainerHeader {
        count: vectors.len() as u32,
        dim: dim as u32,
        graph_offset,
    };

    let file = File::create(&path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header.to_bytes())?;

    for vector in vectors {
        if vector.len() != dim {
            return Err(ContainerError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }
        for &val in vector {
            writer.write_all(&val.to_le_bytes())?;
        }
    }

    graph.serialize(&mut writer)?;

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read the header and descriptor table; return a reader positioned at the
/// graph section.
///
/// The caller rebuilds its accessor over the returned vectors, then hands
/// the reader to [`Hnsw::deserialize`].
pub fn read_container<P: AsRef<Path>>(
    path: P,
) -> Result<(ContainerHeader, Vec<Vec<f32>>, BufReader<File>), ContainerError> {
    let file = File::open(&path)?;
    let mut reader = BufReader::new(file);

    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = ContainerHeader::from_bytes(&header_bytes)?;

    let count = header.count as usize;
    let dim = header.dim as usize;

    let mut vectors = Vec::with_capacity(count);
    let mut row = vec![0u8; dim * std::mem::size_of::<f32>()];
    for _ in 0..count {
        reader.read_exact(&mut row).map_err(|_| {
            ContainerError::Truncated(format!("descriptor table ({} rows expected)", count))
        })?;
        let vector: Vec<f32> = row
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().expect("chunked 4 bytes")))
            .collect();
        vectors.push(vector);
    }

    reader.seek(SeekFrom::Start(header.graph_offset))?;
    Ok((header, vectors, reader))
}
