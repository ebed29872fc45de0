//! Index data segments
//!
//! A segment is a fixed-size open-addressing table of `(hash, chunk id)`
//! slots with linear probing.

use crate::file_io::{get_u32, get_u64, put_u32, put_u64};

pub(crate) const SEGMENT_HEADER_SIZE: usize = 16;
const SLOT_SIZE: usize = 16;

const OFFSET_ALIVE: usize = 0;
const OFFSET_HASH_SUFFIX: usize = 4;
const OFFSET_DEPTH: usize = 8;

/// Fibonacci hashing multiplier; spreads the high hash bits over the slots
const PROBE_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Slot {
    pub hash: u64,
    pub chunk: u64,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.hash == 0 && self.chunk == 0
    }

    fn is_live(&self) -> bool {
        self.hash != 0
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Segment {
    /// Low `depth` bits shared by every hash stored here
    pub hash_suffix: u32,
    pub depth: u8,
    alive: usize,
    /// Live slots plus tombstones
    used: usize,
    slots: Vec<Slot>,
    pub dirty: bool,
}

impl Segment {
    pub fn slots_per_segment(segment_size: usize) -> usize {
        (segment_size - SEGMENT_HEADER_SIZE) / SLOT_SIZE
    }

    pub fn new(segment_size: usize, hash_suffix: u32, depth: u8) -> Self {
        Self {
            hash_suffix,
            depth,
            alive: 0,
            used: 0,
            slots: vec![Slot::default(); Self::slots_per_segment(segment_size)],
            dirty: true,
        }
    }

    /// Decode a segment, describing any inconsistency in the error
    pub fn decode(raw: &[u8], number: u32) -> std::result::Result<Self, String> {
        let slots: Vec<Slot> = (0..Self::slots_per_segment(raw.len()))
            .map(|i| {
                let at = SEGMENT_HEADER_SIZE + i * SLOT_SIZE;
                Slot {
                    hash: get_u64(raw, at),
                    chunk: get_u64(raw, at + 8),
                }
            })
            .collect();

        let alive = slots.iter().filter(|s| s.is_live()).count();
        let used = slots.iter().filter(|s| !s.is_empty()).count();
        let recorded = get_u32(raw, OFFSET_ALIVE) as usize;
        if recorded != alive {
            return Err(format!(
                "segment {} records {} live entries but holds {}",
                number, recorded, alive
            ));
        }
        if slots.iter().any(|s| s.is_live() && s.chunk == 0) {
            return Err(format!("segment {} holds an entry without a chunk id", number));
        }
        if used == slots.len() {
            return Err(format!("segment {} has no empty slot", number));
        }

        Ok(Self {
            hash_suffix: get_u32(raw, OFFSET_HASH_SUFFIX),
            depth: raw[OFFSET_DEPTH],
            alive,
            used,
            slots,
            dirty: false,
        })
    }

    pub fn encode(&self, raw: &mut [u8]) {
        raw.fill(0);
        put_u32(raw, OFFSET_ALIVE, self.alive as u32);
        put_u32(raw, OFFSET_HASH_SUFFIX, self.hash_suffix);
        raw[OFFSET_DEPTH] = self.depth;
        for (i, slot) in self.slots.iter().enumerate() {
            let at = SEGMENT_HEADER_SIZE + i * SLOT_SIZE;
            put_u64(raw, at, slot.hash);
            put_u64(raw, at + 8, slot.chunk);
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Entries allowed before the segment must split
    pub fn load_limit(&self) -> usize {
        self.slots.len() / 2
    }

    pub fn alive(&self) -> usize {
        self.alive
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn home(&self, hash: u64) -> usize {
        ((hash.wrapping_mul(PROBE_MULTIPLIER) >> 32) % self.slots.len() as u64) as usize
    }

    /// Live slots holding `hash`, in probe order
    pub fn probe(&self, hash: u64) -> Probe<'_> {
        Probe {
            slots: &self.slots,
            hash,
            position: self.home(hash),
            steps: 0,
        }
    }

    fn position_of(&self, hash: u64, chunk: u64) -> Option<usize> {
        self.probe(hash)
            .find(|(_, c)| *c == chunk)
            .map(|(position, _)| position)
    }

    pub fn contains(&self, hash: u64, chunk: u64) -> bool {
        self.position_of(hash, chunk).is_some()
    }

    /// Store a new entry in the first free slot of its probe sequence
    ///
    /// Returns `false` when every slot but the terminating empty one is used.
    pub fn insert(&mut self, hash: u64, chunk: u64) -> bool {
        if self.used + 1 >= self.slots.len() && !self.has_tombstone_on_path(hash) {
            return false;
        }
        let len = self.slots.len();
        let mut position = self.home(hash);
        for _ in 0..len {
            let slot = self.slots[position];
            if !slot.is_live() {
                if slot.is_empty() {
                    self.used += 1;
                }
                self.slots[position] = Slot { hash, chunk };
                self.alive += 1;
                self.dirty = true;
                return true;
            }
            position = (position + 1) % len;
        }
        false
    }

    fn has_tombstone_on_path(&self, hash: u64) -> bool {
        let len = self.slots.len();
        let mut position = self.home(hash);
        for _ in 0..len {
            let slot = self.slots[position];
            if slot.is_empty() {
                return false;
            }
            if !slot.is_live() {
                return true;
            }
            position = (position + 1) % len;
        }
        false
    }

    /// Point the `(hash, old)` entry at `new`
    pub fn replace(&mut self, hash: u64, old: u64, new: u64) -> bool {
        match self.position_of(hash, old) {
            Some(position) => {
                self.slots[position].chunk = new;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Tombstone the `(hash, chunk)` entry
    pub fn remove(&mut self, hash: u64, chunk: u64) -> bool {
        match self.position_of(hash, chunk) {
            Some(position) => {
                self.slots[position].hash = 0;
                self.alive -= 1;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Tombstone every entry holding `hash`; returns how many were removed
    pub fn remove_all(&mut self, hash: u64) -> usize {
        let positions: Vec<usize> = self.probe(hash).map(|(position, _)| position).collect();
        for position in &positions {
            self.slots[*position].hash = 0;
        }
        self.alive -= positions.len();
        if !positions.is_empty() {
            self.dirty = true;
        }
        positions.len()
    }

    pub fn live_entries(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.slots
            .iter()
            .filter(|s| s.is_live())
            .map(|s| (s.hash, s.chunk))
    }

    /// Clear the slots and insert `entries`, dropping all tombstones
    pub fn rebuild(&mut self, entries: Vec<(u64, u64)>) {
        self.slots.iter_mut().for_each(|s| *s = Slot::default());
        self.alive = 0;
        self.used = 0;
        self.dirty = true;
        for (hash, chunk) in entries {
            self.insert(hash, chunk);
        }
    }

    pub fn prune_tombstones(&mut self) {
        if self.used > self.alive {
            let entries: Vec<(u64, u64)> = self.live_entries().collect();
            self.rebuild(entries);
        }
    }

    /// Longest distance, in slots probed, from an entry's home to its slot
    pub fn max_probe_length(&self) -> usize {
        let len = self.slots.len();
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_live())
            .map(|(position, s)| (position + len - self.home(s.hash)) % len + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Iterator over `(slot position, chunk id)` for one hash
pub(crate) struct Probe<'a> {
    slots: &'a [Slot],
    hash: u64,
    position: usize,
    steps: usize,
}

impl Iterator for Probe<'_> {
    type Item = (usize, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.slots.len();
        while self.steps < len {
            let position = self.position;
            let slot = self.slots[position];
            self.position = (position + 1) % len;
            self.steps += 1;

            if slot.is_empty() {
                self.steps = len;
                return None;
            }
            if slot.hash == self.hash {
                return Some((position, slot.chunk));
            }
        }
        None
    }
}
