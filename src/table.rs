// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Target tables and the index that serves sector lookups.
//!
//! A table is two parallel arrays: strictly increasing `highs`, where
//! entry i owns sectors up to and including `highs[i]`, and the
//! matching targets. Completing a table compiles an implicit B-tree
//! over `highs`: one dense key array per level, no per-node
//! allocation, so a lookup is at most `depth` runs of up to
//! KEYS_PER_NODE comparisons over contiguous memory.

use std::collections::TryReserveError;

use crate::{
    core::{Device, TargetLine},
    result::{DmError, DmResult, ErrorEnum},
    target::{Target, TargetArea},
    units::{div_up, int_log, Sectors},
};

/// Keys in one index node. With node metadata alongside, 7 keys keep a
/// node within a cache line.
pub const KEYS_PER_NODE: usize = 7;

const CHILDREN_PER_NODE: usize = KEYS_PER_NODE + 1;

/// The all-ones sector value used to fill missing key slots; it sorts
/// after any real key.
pub const MAX_SECTOR: u64 = u64::MAX;

fn nomem(err: TryReserveError) -> DmError {
    DmError::Dm(ErrorEnum::NoMemory, err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Loading,
    Loaded,
}

/// The compiled index. `levels` holds the interior levels only; level
/// depth - 1 is the table's `highs` array itself.
#[derive(Debug, Clone)]
struct BtreeIndex {
    depth: usize,
    counts: Vec<usize>,
    levels: Vec<Vec<u64>>,
}

/// The highest key reachable through node n on level l, walking the
/// rightmost child down to the leaves.
fn high(highs: &[u64], counts: &[usize], depth: usize, mut l: usize, mut n: usize) -> u64 {
    loop {
        if n >= counts[l] {
            return MAX_SECTOR;
        }

        if l == depth - 1 {
            return highs
                .get((n + 1) * KEYS_PER_NODE - 1)
                .copied()
                .unwrap_or(MAX_SECTOR);
        }

        l += 1;
        n = (n + 1) * CHILDREN_PER_NODE - 1;
    }
}

/// The target table of one mapped device.
#[derive(Debug, Clone)]
pub struct TargetTable {
    highs: Vec<u64>,
    targets: Vec<Target>,
    state: TableState,
    index: Option<BtreeIndex>,
}

impl TargetTable {
    /// Begin a fresh table in the loading state, with room for one
    /// node's worth of entries.
    pub fn start() -> DmResult<TargetTable> {
        let mut highs = Vec::new();
        highs.try_reserve(KEYS_PER_NODE).map_err(nomem)?;
        let mut targets = Vec::new();
        targets.try_reserve(KEYS_PER_NODE).map_err(nomem)?;

        Ok(TargetTable {
            highs,
            targets,
            state: TableState::Loading,
            index: None,
        })
    }

    /// Append an entry owning sectors up to and including `high`.
    /// Entries must arrive in ascending order of their high sector;
    /// this is what lets `complete` skip a sort.
    pub fn add_entry(&mut self, high: Sectors, target: Target) -> DmResult<()> {
        if self.state == TableState::Loaded {
            return Err(DmError::Dm(
                ErrorEnum::StateViolation,
                "cannot append to a completed table".into(),
            ));
        }

        if let Some(&last) = self.highs.last() {
            if *high <= last {
                return Err(DmError::Dm(
                    ErrorEnum::Invalid,
                    format!("high sector {high} is not above the previous entry's {last}"),
                ));
            }
        }

        self.highs.try_reserve(1).map_err(nomem)?;
        self.targets.try_reserve(1).map_err(nomem)?;
        self.highs.push(*high);
        self.targets.push(target);

        Ok(())
    }

    /// Seal the table and compile its index. A no-op on an
    /// already-completed table.
    pub fn complete(&mut self) -> DmResult<()> {
        if self.state == TableState::Loaded {
            return Ok(());
        }

        if self.highs.is_empty() {
            return Err(DmError::Dm(
                ErrorEnum::Invalid,
                "cannot complete a table with no entries".into(),
            ));
        }

        self.index = Some(self.build_index()?);
        self.state = TableState::Loaded;

        Ok(())
    }

    /// Discard the in-progress entries and index, returning the table
    /// to an empty loading state.
    pub fn abandon(&mut self) {
        self.highs = Vec::new();
        self.targets = Vec::new();
        self.index = None;
        self.state = TableState::Loading;
    }

    /// Whether `complete` has sealed this table.
    pub fn is_complete(&self) -> bool {
        self.state == TableState::Loaded
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.highs.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.highs.is_empty()
    }

    /// The size of the mapped device this table describes: one past
    /// the last entry's high sector.
    pub fn size(&self) -> Sectors {
        Sectors(self.highs.last().map_or(0, |h| h + 1))
    }

    /// The table's targets, in sector order.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    fn build_index(&self) -> DmResult<BtreeIndex> {
        let leaf_count = div_up(self.highs.len() as u64, KEYS_PER_NODE as u64)? as usize;
        let depth = 1 + int_log(CHILDREN_PER_NODE as u64, leaf_count as u64)? as usize;

        let mut counts = Vec::new();
        counts.try_reserve(depth).map_err(nomem)?;
        counts.resize(depth, 0);
        counts[depth - 1] = leaf_count;
        for l in (0..depth - 1).rev() {
            counts[l] = div_up(counts[l + 1] as u64, CHILDREN_PER_NODE as u64)? as usize;
        }

        let mut levels: Vec<Vec<u64>> = Vec::new();
        levels.try_reserve(depth - 1).map_err(nomem)?;
        for count in counts.iter().take(depth - 1) {
            let mut keys = Vec::new();
            keys.try_reserve(count * KEYS_PER_NODE).map_err(nomem)?;
            keys.resize(count * KEYS_PER_NODE, MAX_SECTOR);
            levels.push(keys);
        }

        // Each key is the highest sector reachable through the
        // corresponding child; between nodes one child slot is
        // skipped, the rightmost child greater than all of the node's
        // keys.
        for l in (0..depth - 1).rev() {
            let mut child = 0;
            for node in 0..counts[l] {
                for c in 0..KEYS_PER_NODE {
                    levels[l][node * KEYS_PER_NODE + c] =
                        high(&self.highs, &counts, depth, l + 1, child);
                    child += 1;
                }
                child += 1;
            }
        }

        Ok(BtreeIndex {
            depth,
            counts,
            levels,
        })
    }

    /// The index of the entry owning `sector`.
    pub fn find(&self, sector: Sectors) -> DmResult<usize> {
        let index = self.index.as_ref().ok_or_else(|| {
            DmError::Dm(
                ErrorEnum::StateViolation,
                "cannot look up in a table that has not been completed".into(),
            )
        })?;

        match self.highs.last() {
            Some(&last) if *sector <= last => {}
            _ => {
                return Err(DmError::Dm(
                    ErrorEnum::Invalid,
                    format!("sector {sector} is out of range of a {} sector device", self.size()),
                ))
            }
        }

        let mut node = 0;
        let mut l = 0;
        loop {
            let base = node * KEYS_PER_NODE;
            let leaf = l == index.depth - 1;

            let mut found = 0;
            while found < KEYS_PER_NODE {
                let key = if leaf {
                    self.highs
                        .get(base + found)
                        .copied()
                        .unwrap_or(MAX_SECTOR)
                } else {
                    index.levels[l][base + found]
                };
                if key >= *sector {
                    break;
                }
                found += 1;
            }

            if leaf {
                let entry = base + found;
                return if entry < self.highs.len() {
                    Ok(entry)
                } else {
                    Err(DmError::Dm(
                        ErrorEnum::Invalid,
                        format!("sector {sector} not covered by any entry"),
                    ))
                };
            }

            node = node * CHILDREN_PER_NODE + found;
            l += 1;
        }
    }

    /// The target owning `sector`.
    pub fn target_for(&self, sector: Sectors) -> DmResult<&Target> {
        let entry = self.find(sector)?;
        Ok(&self.targets[entry])
    }

    /// Serialise the table into the (start, length, type, params)
    /// lines the kernel boundary carries. `resolve` supplies the
    /// device numbers for the targets' backing references.
    pub fn load_lines<F>(&self, mut resolve: F) -> DmResult<Vec<TargetLine>>
    where
        F: FnMut(&TargetArea) -> DmResult<Device>,
    {
        if self.state != TableState::Loaded {
            return Err(DmError::Dm(
                ErrorEnum::StateViolation,
                "cannot serialise a table that has not been completed".into(),
            ));
        }

        let mut lines = Vec::new();
        lines.try_reserve(self.highs.len()).map_err(nomem)?;

        let mut start = 0u64;
        for (high, target) in self.highs.iter().zip(self.targets.iter()) {
            let length = high - start + 1;
            lines.push((
                start,
                length,
                target.type_name().to_string(),
                target.params_string(&mut resolve)?,
            ));
            start = high + 1;
        }

        Ok(lines)
    }
}
