//! Memory regions owned by one node
//!
//! Three regions back the protocol operations: the sampled SRAM itself,
//! the staging region that `LOAD` fills with interpreter source, and
//! the output region the interpreter writes its results to (drained by
//! `RETR` as blocks of little-endian i32 cells).

use crate::packet::{DATA_SIZE, OUTPUT_BLOCKS};

/// Simulated SRAM with a deterministic power-on pattern.
///
/// A real board powers up with its PUF fingerprint; the simulation
/// derives a stable per-device pattern from a seed so that repeated
/// power cycles of a virtual chain reproduce the same bits.
pub struct SramModel {
    bytes: Vec<u8>,
    seed: u64,
}

impl SramModel {
    pub fn new(size: usize, seed: u64) -> Self {
        let mut sram = SramModel {
            bytes: vec![0u8; size],
            seed,
        };
        sram.power_on_reset();
        sram
    }

    /// Refill the region with the power-on pattern (xorshift stream).
    pub fn power_on_reset(&mut self) {
        let mut state = self.seed | 1;
        for b in self.bytes.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = state as u8;
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Copy one block out. Offsets past the end read as zeros, matching
    /// a device that answers every request with something.
    pub fn read_block(&self, offset: u32) -> [u8; DATA_SIZE] {
        let mut block = [0u8; DATA_SIZE];
        let start = offset as usize * DATA_SIZE;
        if start < self.bytes.len() {
            let end = (start + DATA_SIZE).min(self.bytes.len());
            block[..end - start].copy_from_slice(&self.bytes[start..end]);
        }
        block
    }

    /// Copy one block in. Writes past the end are dropped.
    pub fn write_block(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize * DATA_SIZE;
        if start < self.bytes.len() {
            let end = (start + data.len().min(DATA_SIZE)).min(self.bytes.len());
            self.bytes[start..end].copy_from_slice(&data[..end - start]);
        }
    }

    /// Fill a whole block with one byte value (test seeding).
    pub fn fill_block(&mut self, offset: u32, value: u8) {
        self.write_block(offset, &[value; DATA_SIZE]);
    }
}

/// Source-code staging region, appended to by `LOAD` in block units.
pub struct StagingRegion {
    bytes: Vec<u8>,
}

impl StagingRegion {
    pub fn new() -> Self {
        StagingRegion { bytes: Vec::new() }
    }

    /// Place one block at `offset * DATA_SIZE`, growing as needed.
    pub fn write_block(&mut self, offset: u32, data: &[u8; DATA_SIZE]) {
        let start = offset as usize * DATA_SIZE;
        if self.bytes.len() < start + DATA_SIZE {
            self.bytes.resize(start + DATA_SIZE, 0);
        }
        self.bytes[start..start + DATA_SIZE].copy_from_slice(data);
    }

    /// Staged source text up to the first NUL.
    pub fn source(&self) -> &[u8] {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.bytes.len());
        &self.bytes[..end]
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl Default for StagingRegion {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpreter output region: `OUTPUT_BLOCKS` blocks of i32 cells with
/// a circular-free write pointer. Cells past the pointer read as zero.
pub struct OutputRegion {
    cells: Vec<i32>,
    write_pos: usize,
}

impl OutputRegion {
    const CELLS: usize = OUTPUT_BLOCKS as usize * DATA_SIZE / 4;

    pub fn new() -> Self {
        OutputRegion {
            cells: vec![0i32; Self::CELLS],
            write_pos: 0,
        }
    }

    /// Reset the write pointer; old cells are overwritten lazily.
    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.cells.fill(0);
    }

    /// Append one cell. Once the region is full further values drop.
    pub fn push(&mut self, value: i32) {
        if self.write_pos < Self::CELLS {
            self.cells[self.write_pos] = value;
            self.write_pos += 1;
        }
    }

    pub fn written(&self) -> usize {
        self.write_pos
    }

    /// One block of the region as little-endian bytes.
    pub fn read_block(&self, offset: u32) -> [u8; DATA_SIZE] {
        let mut block = [0u8; DATA_SIZE];
        let cells_per_block = DATA_SIZE / 4;
        let start = offset as usize * cells_per_block;
        for (i, chunk) in block.chunks_exact_mut(4).enumerate() {
            if let Some(cell) = self.cells.get(start + i) {
                chunk.copy_from_slice(&cell.to_le_bytes());
            }
        }
        block
    }
}

impl Default for OutputRegion {
    fn default() -> Self {
        Self::new()
    }
}
