//! Slot ownership table.
//!
//! The [`RoutingTable`] holds, for each of the 65536 slots, the ordered list
//! of replica addresses responsible for it. Connection handlers read it on
//! every request while the coordinator replaces it wholesale. The router
//! keeps the current table behind an `Arc` and swaps in a new one under a
//! short write lock, so a reader always sees either the old or the new table
//! and never a partially updated one.

use super::hash::{HashKey, SLOT_COUNT};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddrV4;
use std::sync::Arc;

/// A run of consecutive slots (inclusive on both ends) sharing one replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub owners: Vec<SocketAddrV4>,
}

/// A complete slot assignment together with its generation.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    generation: u64,
    slots: Vec<Arc<[SocketAddrV4]>>,
}

impl RoutingTable {
    /// A table where no slot has an owner yet.
    pub fn empty() -> Self {
        let none: Arc<[SocketAddrV4]> = Arc::from(Vec::new());
        Self {
            generation: 0,
            slots: vec![none; SLOT_COUNT],
        }
    }

    /// Expands a range list into a full table. Slots not covered by any
    /// range are left unassigned; later ranges win on overlap.
    pub fn from_ranges(generation: u64, ranges: &[SlotRange]) -> Self {
        let mut table = Self::empty();
        table.generation = generation;
        for range in ranges {
            if range.start > range.end {
                continue;
            }
            let owners: Arc<[SocketAddrV4]> = Arc::from(range.owners.clone());
            for slot in range.start as usize..=range.end as usize {
                table.slots[slot] = Arc::clone(&owners);
            }
        }
        table
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn owners(&self, slot: u16) -> &[SocketAddrV4] {
        &self.slots[slot as usize]
    }

    /// Compresses the table back into ranges of identical owner lists.
    /// Unassigned runs are omitted.
    pub fn to_ranges(&self) -> Vec<SlotRange> {
        let mut ranges: Vec<SlotRange> = Vec::new();
        for (slot, owners) in self.slots.iter().enumerate() {
            let slot = slot as u16;
            if let Some(last) = ranges.last_mut() {
                if last.end as usize + 1 == slot as usize && *last.owners == **owners {
                    last.end = slot;
                    continue;
                }
            }
            if owners.is_empty() {
                continue;
            }
            ranges.push(SlotRange {
                start: slot,
                end: slot,
                owners: owners.to_vec(),
            });
        }
        ranges
    }

    /// Every address that owns at least one slot.
    pub fn members(&self) -> BTreeSet<SocketAddrV4> {
        let mut members = BTreeSet::new();
        let mut previous: Option<&Arc<[SocketAddrV4]>> = None;
        for owners in &self.slots {
            if previous.map_or(false, |p| Arc::ptr_eq(p, owners)) {
                continue;
            }
            members.extend(owners.iter().copied());
            previous = Some(owners);
        }
        members
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::empty()
    }
}

/// Splits the slot space into one contiguous range per node, in address
/// order, giving each range `replicas` consecutive owners (wrapping around).
///
/// At most `SLOT_COUNT` ranges are produced; nodes past that lead no range.
pub fn assign_slots(nodes: &BTreeSet<SocketAddrV4>, replicas: usize) -> Vec<SlotRange> {
    let nodes: Vec<SocketAddrV4> = nodes.iter().copied().collect();
    if nodes.is_empty() {
        return Vec::new();
    }
    let n = nodes.len();
    let replicas = replicas.clamp(1, n);
    let ranges = n.min(SLOT_COUNT);

    (0..ranges)
        .map(|i| {
            let start = (i * SLOT_COUNT / ranges) as u16;
            let end = ((i + 1) * SLOT_COUNT / ranges - 1) as u16;
            let owners = (0..replicas).map(|r| nodes[(i + r) % n]).collect();
            SlotRange { start, end, owners }
        })
        .collect()
}

/// Routes keys to slots and slots to their current owners.
#[derive(Debug)]
pub struct SlotRouter {
    key: HashKey,
    table: RwLock<Arc<RoutingTable>>,
}

impl SlotRouter {
    /// Creates a router with an all-unassigned table.
    pub fn new(key: HashKey) -> Self {
        Self {
            key,
            table: RwLock::new(Arc::new(RoutingTable::empty())),
        }
    }

    #[inline]
    pub fn slot_for(&self, key: &[u8]) -> u16 {
        self.key.slot_for(key)
    }

    /// The replica set for a slot. Empty means the slot is not assigned
    /// yet and the caller should retry later.
    pub fn owners(&self, slot: u16) -> Vec<SocketAddrV4> {
        self.table.read().owners(slot).to_vec()
    }

    /// The table currently in effect.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.read())
    }

    pub fn generation(&self) -> u64 {
        self.table.read().generation()
    }

    /// Replaces the table in one step.
    pub fn install(&self, table: RoutingTable) {
        *self.table.write() = Arc::new(table);
    }

    /// Makes `owner` responsible for every slot.
    pub fn assign_all(&self, owner: SocketAddrV4) {
        let generation = self.generation() + 1;
        self.install(RoutingTable::from_ranges(
            generation,
            &[SlotRange {
                start: 0,
                end: u16::MAX,
                owners: vec![owner],
            }],
        ));
    }
}
