use crate::error::{AttentionError, Result};

use super::block_pool::BlockId;

/// Batch-wide mapping: one row per sequence, logical block index → physical BlockId.
///
/// Every row holds at most `max_num_blocks_per_seq` entries. The tables are
/// owned by the caller; the attention core only reads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTables {
    rows: Vec<Vec<BlockId>>,
    max_num_blocks_per_seq: usize,
}

impl BlockTables {
    pub fn new(max_num_blocks_per_seq: usize) -> Self {
        Self {
            rows: Vec::new(),
            max_num_blocks_per_seq,
        }
    }

    /// Build tables from already-reserved rows.
    pub fn from_rows(rows: Vec<Vec<BlockId>>, max_num_blocks_per_seq: usize) -> Result<Self> {
        let mut tables = Self::new(max_num_blocks_per_seq);
        for row in rows {
            tables.push_row(row)?;
        }
        Ok(tables)
    }

    /// Parse the dense `[num_rows, max_num_blocks_per_seq]` form where
    /// unreserved entries are negative (conventionally `-1`).
    ///
    /// Reserved entries must form a prefix of each row.
    pub fn from_dense(
        dense: &[i64],
        num_rows: usize,
        max_num_blocks_per_seq: usize,
    ) -> Result<Self> {
        if dense.len() != num_rows * max_num_blocks_per_seq {
            return Err(AttentionError::invalid(format!(
                "dense block table has {} entries, expected {num_rows} x {max_num_blocks_per_seq}",
                dense.len()
            )));
        }
        let mut tables = Self::new(max_num_blocks_per_seq);
        if max_num_blocks_per_seq == 0 {
            tables.rows = vec![Vec::new(); num_rows];
            return Ok(tables);
        }
        for (seq, entries) in dense.chunks(max_num_blocks_per_seq).enumerate() {
            let reserved = entries.iter().take_while(|&&id| id >= 0).count();
            if entries[reserved..].iter().any(|&id| id >= 0) {
                return Err(AttentionError::invalid(format!(
                    "block table row {seq} has a reserved block after an unreserved entry"
                )));
            }
            tables
                .rows
                .push(entries[..reserved].iter().map(|&id| id as BlockId).collect());
        }
        Ok(tables)
    }

    /// Dense form with `-1` in unreserved entries.
    pub fn to_dense(&self) -> Vec<i64> {
        let mut dense = vec![-1i64; self.rows.len() * self.max_num_blocks_per_seq];
        for (seq, row) in self.rows.iter().enumerate() {
            let base = seq * self.max_num_blocks_per_seq;
            for (i, &id) in row.iter().enumerate() {
                dense[base + i] = id as i64;
            }
        }
        dense
    }

    /// Append the row for the next sequence.
    pub fn push_row(&mut self, row: Vec<BlockId>) -> Result<()> {
        if row.len() > self.max_num_blocks_per_seq {
            return Err(AttentionError::invalid(format!(
                "block table row {} has {} blocks, max_num_blocks_per_seq is {}",
                self.rows.len(),
                row.len(),
                self.max_num_blocks_per_seq
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn max_num_blocks_per_seq(&self) -> usize {
        self.max_num_blocks_per_seq
    }

    /// Ordered physical blocks reserved for sequence `seq`.
    pub fn row(&self, seq: usize) -> &[BlockId] {
        &self.rows[seq]
    }

    /// Tokens sequence `seq` can hold with its reserved blocks.
    pub fn capacity_tokens(&self, seq: usize, block_size: usize) -> usize {
        self.rows[seq].len() * block_size
    }

    /// Upper bound on tokens any sequence may hold.
    pub fn max_tokens_per_seq(&self, block_size: usize) -> usize {
        self.max_num_blocks_per_seq * block_size
    }

    /// Physical `(block, slot)` for position `pos` of sequence `seq`.
    ///
    /// Returns `None` when the logical block is not reserved.
    pub fn slot(&self, seq: usize, pos: usize, block_size: usize) -> Option<(BlockId, usize)> {
        self.rows[seq]
            .get(pos / block_size)
            .map(|&block| (block, pos % block_size))
    }
}
