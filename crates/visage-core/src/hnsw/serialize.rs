//! Column-oriented graph serialization.
//!
//! The wire layout mirrors the in-memory slot tables: fixed-width columns
//! first, adjacency last, so a reader can size every allocation up front
//! and a writer streams in one pass.
//!
//! ```text
//! "VSGRAPH2"            magic, 8 bytes
//! count:      u32 LE    number of slots
//! entry:      u32 LE    entry slot (u32::MAX when empty)
//! layers:     u8        number of layers (0 for an empty graph)
//! m:          u32 LE    upper-layer degree cap
//! ef_c:       u32 LE    construction beam width
//! labels:     count × u32 LE        slot → label column
//! peaks:      count × u8            slot → peak-layer column
//! per layer 0..layers, per slot with peak ≥ layer, in slot order:
//!     degree: u32 LE
//!     links:  degree × u32 LE       neighbor slots
//! ```
//!
//! Absent slots write nothing — the peak column determines exactly which
//! adjacency records each layer carries, so offsets need no padding. Every
//! slot reference is bounds-checked on load; a graph that survives
//! `deserialize` cannot send traversal out of range.

use std::io::{self, Read, Write};

use super::Hnsw;

const MAGIC: &[u8; 8] = b"VSGRAPH2";

fn bad_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

impl Hnsw {
    /// Serialize the graph topology (not the vectors) to a writer.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let (labels, peaks, graph, entry_slot) = self.columns();
        let (m, ef_construction) = self.params();

        writer.write_all(MAGIC)?;
        writer.write_all(&(labels.len() as u32).to_le_bytes())?;
        writer.write_all(&entry_slot.unwrap_or(u32::MAX).to_le_bytes())?;
        writer.write_all(&[graph.len() as u8])?;
        writer.write_all(&(m as u32).to_le_bytes())?;
        writer.write_all(&(ef_construction as u32).to_le_bytes())?;

        for &label in labels {
            writer.write_all(&(label as u32).to_le_bytes())?;
        }
        writer.write_all(peaks)?;

        for (layer_idx, layer) in graph.iter().enumerate() {
            for (slot, links) in layer.iter().enumerate() {
                if (peaks[slot] as usize) < layer_idx {
                    continue;
                }
                writer.write_all(&(links.len() as u32).to_le_bytes())?;
                for &neighbor in links {
                    writer.write_all(&neighbor.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Deserialize a graph from a reader, wiring the given vector accessor.
    pub fn deserialize<R, F>(reader: &mut R, vector_fn: F) -> io::Result<Self>
    where
        R: Read,
        F: Fn(usize) -> Vec<f32> + Send + Sync + 'static,
    {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(bad_data("invalid graph magic".to_string()));
        }

        let count = read_u32(reader)? as usize;
        let entry_raw = read_u32(reader)?;
        let layer_count = read_u8(reader)? as usize;
        let m = read_u32(reader)? as usize;
        let ef_construction = read_u32(reader)? as usize;

        if m < 2 {
            return Err(bad_data(format!("implausible degree cap m={}", m)));
        }
        let entry_slot = if entry_raw == u32::MAX {
            None
        } else if (entry_raw as usize) < count {
            Some(entry_raw)
        } else {
            return Err(bad_data(format!(
                "entry slot {} out of range for {} slots",
                entry_raw, count
            )));
        };
        if count > 0 && (layer_count == 0 || entry_slot.is_none()) {
            return Err(bad_data(format!(
                "{} slots but no layers or entry point",
                count
            )));
        }

        let mut labels = Vec::with_capacity(count);
        for _ in 0..count {
            labels.push(read_u32(reader)? as usize);
        }

        let mut peaks = vec![0u8; count];
        reader.read_exact(&mut peaks)?;
        for (slot, &peak) in peaks.iter().enumerate() {
            if peak as usize >= layer_count {
                return Err(bad_data(format!(
                    "slot {} peaks at layer {} but only {} layers exist",
                    slot, peak, layer_count
                )));
            }
        }

        let mut graph = Vec::with_capacity(layer_count);
        for layer_idx in 0..layer_count {
            let mut layer = vec![Vec::new(); count];
            for (slot, column) in layer.iter_mut().enumerate() {
                if (peaks[slot] as usize) < layer_idx {
                    continue;
                }
                let degree = read_u32(reader)? as usize;
                let mut links = Vec::with_capacity(degree.min(4096));
                for _ in 0..degree {
                    let neighbor = read_u32(reader)?;
                    if neighbor as usize >= count {
                        return Err(bad_data(format!(
                            "slot {} on layer {} links to missing slot {}",
                            slot, layer_idx, neighbor
                        )));
                    }
                    links.push(neighbor);
                }
                *column = links;
            }
            graph.push(layer);
        }

        Ok(Hnsw::from_columns(
            labels,
            peaks,
            graph,
            entry_slot,
            m,
            ef_construction,
            vector_fn,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    fn build(vectors: &[Vec<f32>]) -> Hnsw {
        let table = vectors.to_vec();
        let mut hnsw = Hnsw::new(8, 50, move |l| table[l].clone());
        for label in 0..vectors.len() {
            hnsw.insert(label);
        }
        hnsw
    }

    #[test]
    fn roundtrip_preserves_topology_and_results() {
        let vectors = sample_vectors(100, 32);
        let hnsw = build(&vectors);

        let mut bytes = Vec::new();
        hnsw.serialize(&mut bytes).unwrap();

        let table = vectors.clone();
        let loaded = Hnsw::deserialize(&mut bytes.as_slice(), move |l| table[l].clone()).unwrap();

        assert_eq!(loaded.len(), hnsw.len());
        let (before, after) = (hnsw.stats(), loaded.stats());
        assert_eq!(before.max_layer, after.max_layer);
        assert_eq!(before.layer_counts, after.layer_counts);
        assert_eq!(before.total_edges, after.total_edges);
        assert_eq!(before.m, after.m);

        for query_label in [0usize, 17, 63, 99] {
            assert_eq!(
                hnsw.search(&vectors[query_label], 5, 100),
                loaded.search(&vectors[query_label], 5, 100),
                "query {} diverged after reload",
                query_label
            );
        }
    }

    #[test]
    fn reserialization_is_byte_identical() {
        let vectors = sample_vectors(60, 16);
        let hnsw = build(&vectors);

        let mut first = Vec::new();
        hnsw.serialize(&mut first).unwrap();

        let table = vectors.clone();
        let loaded = Hnsw::deserialize(&mut first.as_slice(), move |l| table[l].clone()).unwrap();
        let mut second = Vec::new();
        loaded.serialize(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn empty_graph_roundtrip() {
        let hnsw = Hnsw::new(8, 50, |_| vec![0.0f32; 4]);
        let mut bytes = Vec::new();
        hnsw.serialize(&mut bytes).unwrap();

        let loaded = Hnsw::deserialize(&mut bytes.as_slice(), |_| vec![0.0f32; 4]).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.search(&[0.0; 4], 3, 10).is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = b"NOTGRAPH\x00\x00\x00\x00".to_vec();
        let err = Hnsw::deserialize(&mut bytes.as_slice(), |_| vec![0.0; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_out_of_range_links() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"VSGRAPH2");
        bytes.extend_from_slice(&2u32.to_le_bytes()); // count
        bytes.extend_from_slice(&0u32.to_le_bytes()); // entry
        bytes.push(1); // layers
        bytes.extend_from_slice(&8u32.to_le_bytes()); // m
        bytes.extend_from_slice(&50u32.to_le_bytes()); // ef
        bytes.extend_from_slice(&0u32.to_le_bytes()); // label of slot 0
        bytes.extend_from_slice(&1u32.to_le_bytes()); // label of slot 1
        bytes.extend_from_slice(&[0u8, 0u8]); // peaks
        bytes.extend_from_slice(&1u32.to_le_bytes()); // slot 0 degree
        bytes.extend_from_slice(&5u32.to_le_bytes()); // link beyond count
        bytes.extend_from_slice(&0u32.to_le_bytes()); // slot 1 degree

        let err = Hnsw::deserialize(&mut bytes.as_slice(), |_| vec![0.0; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_truncated_stream() {
        let vectors = sample_vectors(30, 8);
        let hnsw = build(&vectors);

        let mut bytes = Vec::new();
        hnsw.serialize(&mut bytes).unwrap();
        bytes.truncate(bytes.len() / 2);

        let table = vectors.clone();
        assert!(Hnsw::deserialize(&mut bytes.as_slice(), move |l| table[l].clone()).is_err());
    }

    #[test]
    fn rejects_entry_slot_out_of_range() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"VSGRAPH2");
        bytes.extend_from_slice(&2u32.to_le_bytes()); // count
        bytes.extend_from_slice(&9u32.to_le_bytes()); // entry beyond count
        bytes.push(1); // layers
        bytes.extend_from_slice(&8u32.to_le_bytes()); // m
        bytes.extend_from_slice(&50u32.to_le_bytes()); // ef

        let err = Hnsw::deserialize(&mut bytes.as_slice(), |_| vec![0.0; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
