//! Rank-partitioned identifier allocation.
//!
//! Every cooperating process (rank) mints identifiers from its own partition
//! of the id space: slot `counter * rank_count + rank`. Two ranks under the
//! same rank count can therefore never produce the same slot, and a single
//! rank's ids increase strictly with its counter. No server round trip is
//! involved; the service only learns the per-class maxima when a transaction
//! finishes and reconciles them with a max-reduction.

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::ids::{IdClass, ObjectClass, ObjectId, SequenceId, SLOT_BITS, SLOT_MASK};

/// Derive an identifier from `(rank, rank_count, counter, class)`.
///
/// Pure and deterministic. For a fixed `rank_count`, distinct ranks never
/// collide for any `counter` and `class` whose slot fits the slot space.
/// Out-of-range input is masked; the allocators go through
/// [`try_next_id`] instead.
pub fn next_id(rank: u32, rank_count: u32, counter: u64, class: IdClass) -> u64 {
    let slot = counter
        .wrapping_mul(u64::from(rank_count))
        .wrapping_add(u64::from(rank));
    (class.tag() << SLOT_BITS) | (slot & SLOT_MASK)
}

/// [`next_id`], refusing a rank outside `rank_count` or a counter whose
/// slot would spill into another class.
pub fn try_next_id(rank: u32, rank_count: u32, counter: u64, class: IdClass) -> Result<u64, TypeError> {
    if rank >= rank_count {
        return Err(TypeError::InvalidRank { rank, rank_count });
    }
    counter
        .checked_mul(u64::from(rank_count))
        .and_then(|slot| slot.checked_add(u64::from(rank)))
        .filter(|&slot| slot <= SLOT_MASK)
        .map(|slot| (class.tag() << SLOT_BITS) | slot)
        .ok_or(TypeError::IdSpaceExhausted { counter })
}

/// Position of this process among its cooperating ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankInfo {
    rank: u32,
    rank_count: u32,
}

impl RankInfo {
    /// Create rank information. `rank` must be below `rank_count`.
    pub fn new(rank: u32, rank_count: u32) -> Result<Self, TypeError> {
        if rank_count == 0 || rank >= rank_count {
            return Err(TypeError::InvalidRank { rank, rank_count });
        }
        Ok(Self { rank, rank_count })
    }

    /// A lone process: rank 0 of 1.
    pub fn single() -> Self {
        Self {
            rank: 0,
            rank_count: 1,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn rank_count(&self) -> u32 {
        self.rank_count
    }

    /// The counter value a slot was minted from.
    pub fn counter_of(&self, slot: u64) -> u64 {
        slot / u64::from(self.rank_count)
    }
}

/// Highest object id per class, as reported by one rank or reduced across all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdWatermarks {
    pub kv: Option<ObjectId>,
    pub array: Option<ObjectId>,
    pub blob: Option<ObjectId>,
}

impl IdWatermarks {
    pub fn get(&self, class: ObjectClass) -> Option<ObjectId> {
        match class {
            ObjectClass::Kv => self.kv,
            ObjectClass::Array => self.array,
            ObjectClass::Blob => self.blob,
        }
    }

    fn slot_mut(&mut self, class: ObjectClass) -> &mut Option<ObjectId> {
        match class {
            ObjectClass::Kv => &mut self.kv,
            ObjectClass::Array => &mut self.array,
            ObjectClass::Blob => &mut self.blob,
        }
    }

    /// Raise the watermark of `id`'s class to `id` if it is higher.
    pub fn observe(&mut self, id: ObjectId) {
        let slot = self.slot_mut(id.class());
        if slot.map_or(true, |current| id.slot() > current.slot()) {
            *slot = Some(id);
        }
    }

    /// Per-class max-reduction with another set of watermarks.
    pub fn merge(&mut self, other: &IdWatermarks) {
        for class in ObjectClass::ALL {
            if let Some(id) = other.get(class) {
                self.observe(id);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_none() && self.array.is_none() && self.blob.is_none()
    }
}

/// Per-container object id counters, one per [`ObjectClass`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdAllocator {
    rank: RankInfo,
    counters: [u64; 3],
}

impl IdAllocator {
    pub fn new(rank: RankInfo) -> Self {
        Self {
            rank,
            counters: [0; 3],
        }
    }

    /// Mint the next object id of `class` and advance its counter. The
    /// counter is left alone once the slot space is exhausted.
    pub fn allocate(&mut self, class: ObjectClass) -> Result<ObjectId, TypeError> {
        let counter = &mut self.counters[class.index()];
        let raw = try_next_id(self.rank.rank(), self.rank.rank_count(), *counter, class.into())?;
        *counter += 1;
        Ok(ObjectId::new_unchecked(raw))
    }

    /// Current counter value (the counter the next allocation will use).
    pub fn counter(&self, class: ObjectClass) -> u64 {
        self.counters[class.index()]
    }

    /// The highest id this rank has minted for each class.
    pub fn maxima(&self) -> IdWatermarks {
        let mut marks = IdWatermarks::default();
        for class in ObjectClass::ALL {
            let counter = self.counters[class.index()];
            if counter > 0 {
                let raw = next_id(
                    self.rank.rank(),
                    self.rank.rank_count(),
                    counter - 1,
                    class.into(),
                );
                *marks.slot_mut(class) = Some(ObjectId::new_unchecked(raw));
            }
        }
        marks
    }

    /// Raise counters so every future id lies strictly above `marks`.
    pub fn seed(&mut self, marks: &IdWatermarks) {
        for class in ObjectClass::ALL {
            if let Some(max) = marks.get(class) {
                let needed = self.rank.counter_of(max.slot()) + 1;
                let counter = &mut self.counters[class.index()];
                *counter = (*counter).max(needed);
            }
        }
    }
}

/// Process-wide request sequence counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceAllocator {
    rank: RankInfo,
    counter: u64,
}

impl SequenceAllocator {
    pub fn new(rank: RankInfo) -> Self {
        // Counter 0 on rank 0 would coincide with SequenceId::ZERO.
        Self { rank, counter: 1 }
    }

    /// The id the next call to [`advance`](Self::advance) will return.
    pub fn peek(&self) -> Result<SequenceId, TypeError> {
        try_next_id(
            self.rank.rank(),
            self.rank.rank_count(),
            self.counter,
            IdClass::Sequence,
        )
        .map(SequenceId::new)
    }

    /// Issue the next sequence id.
    pub fn advance(&mut self) -> Result<SequenceId, TypeError> {
        let id = self.peek()?;
        self.counter += 1;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn two_ranks_differ_for_kv() {
        let a = next_id(0, 2, 4, ObjectClass::Kv.into());
        let b = next_id(1, 2, 4, ObjectClass::Kv.into());
        assert_ne!(a, b);
    }

    #[test]
    fn rank_info_validates() {
        assert!(RankInfo::new(0, 1).is_ok());
        assert_eq!(
            RankInfo::new(2, 2),
            Err(TypeError::InvalidRank { rank: 2, rank_count: 2 })
        );
        assert!(RankInfo::new(0, 0).is_err());
    }

    #[test]
    fn allocator_counts_per_class() {
        let mut alloc = IdAllocator::new(RankInfo::single());
        let k0 = alloc.allocate(ObjectClass::Kv).unwrap();
        let k1 = alloc.allocate(ObjectClass::Kv).unwrap();
        let a0 = alloc.allocate(ObjectClass::Array).unwrap();
        assert_eq!(k0.class(), ObjectClass::Kv);
        assert!(k1.slot() > k0.slot());
        assert_eq!(a0.slot(), 0);
        assert_eq!(alloc.counter(ObjectClass::Kv), 2);
        assert_eq!(alloc.counter(ObjectClass::Blob), 0);
    }

    #[test]
    fn maxima_reports_last_minted() {
        let rank = RankInfo::new(1, 3).unwrap();
        let mut alloc = IdAllocator::new(rank);
        assert!(alloc.maxima().is_empty());
        alloc.allocate(ObjectClass::Blob).unwrap();
        let last = alloc.allocate(ObjectClass::Blob).unwrap();
        assert_eq!(alloc.maxima().blob, Some(last));
        assert_eq!(alloc.maxima().kv, None);
    }

    #[test]
    fn seeding_places_new_ids_above_every_rank() {
        let other = RankInfo::new(3, 4).unwrap();
        let mut remote = IdAllocator::new(other);
        for _ in 0..10 {
            remote.allocate(ObjectClass::Kv).unwrap();
        }
        let marks = remote.maxima();

        let mut local = IdAllocator::new(RankInfo::new(0, 4).unwrap());
        local.seed(&marks);
        let fresh = local.allocate(ObjectClass::Kv).unwrap();
        assert!(fresh.slot() > marks.kv.unwrap().slot());
    }

    #[test]
    fn seeding_never_lowers_counters() {
        let mut alloc = IdAllocator::new(RankInfo::single());
        for _ in 0..5 {
            alloc.allocate(ObjectClass::Array).unwrap();
        }
        let mut marks = IdWatermarks::default();
        marks.observe(ObjectId::from_raw((2u64 << SLOT_BITS) | 1).unwrap());
        alloc.seed(&marks);
        assert_eq!(alloc.counter(ObjectClass::Array), 5);
    }

    #[test]
    fn watermark_merge_takes_max() {
        let mut a = IdWatermarks::default();
        a.observe(ObjectId::from_raw((1u64 << SLOT_BITS) | 9).unwrap());
        let mut b = IdWatermarks::default();
        b.observe(ObjectId::from_raw((1u64 << SLOT_BITS) | 4).unwrap());
        b.observe(ObjectId::from_raw((3u64 << SLOT_BITS) | 2).unwrap());
        a.merge(&b);
        assert_eq!(a.kv.unwrap().slot(), 9);
        assert_eq!(a.blob.unwrap().slot(), 2);
    }

    #[test]
    fn sequence_ids_start_above_zero_and_increase() {
        let mut seq = SequenceAllocator::new(RankInfo::single());
        let peeked = seq.peek().unwrap();
        let first = seq.advance().unwrap();
        assert_eq!(peeked, first);
        assert!(first > SequenceId::ZERO);
        assert!(seq.advance().unwrap() > first);
    }

    #[test]
    fn checked_ids_refuse_bad_rank_and_overflow() {
        assert_eq!(
            try_next_id(2, 2, 0, IdClass::Sequence),
            Err(TypeError::InvalidRank { rank: 2, rank_count: 2 })
        );
        let last = SLOT_MASK / 2;
        assert!(try_next_id(1, 2, last, IdClass::Sequence).is_ok());
        assert_eq!(
            try_next_id(0, 2, last + 1, IdClass::Sequence),
            Err(TypeError::IdSpaceExhausted { counter: last + 1 })
        );
        assert!(try_next_id(0, 3, u64::MAX / 2, ObjectClass::Kv.into()).is_err());
    }

    #[test]
    fn exhausted_allocator_stops_minting() {
        let rank = RankInfo::new(0, 4).unwrap();
        let mut alloc = IdAllocator::new(rank);
        let mut marks = IdWatermarks::default();
        marks.observe(ObjectId::from_raw((1u64 << SLOT_BITS) | SLOT_MASK).unwrap());
        alloc.seed(&marks);
        let counter = alloc.counter(ObjectClass::Kv);
        assert!(matches!(
            alloc.allocate(ObjectClass::Kv),
            Err(TypeError::IdSpaceExhausted { .. })
        ));
        assert_eq!(alloc.counter(ObjectClass::Kv), counter);
        assert!(alloc.allocate(ObjectClass::Array).is_ok());
    }

    proptest! {
        #[test]
        fn distinct_ranks_never_collide(
            rank_count in 2u32..1024,
            a in 0u32..1024,
            b in 0u32..1024,
            counter in 0u64..(1 << 40),
            class_tag in 0u64..4,
        ) {
            let a = a % rank_count;
            let b = b % rank_count;
            prop_assume!(a != b);
            let class = IdClass::from_tag(class_tag).unwrap();
            prop_assert_ne!(
                next_id(a, rank_count, counter, class),
                next_id(b, rank_count, counter, class)
            );
            prop_assert_eq!(
                try_next_id(a, rank_count, counter, class),
                Ok(next_id(a, rank_count, counter, class))
            );
        }

        #[test]
        fn one_rank_strictly_increases(
            rank_count in 1u32..1024,
            rank in 0u32..1024,
            counter in 0u64..(1 << 40),
        ) {
            let rank = rank % rank_count;
            let lo = next_id(rank, rank_count, counter, IdClass::Sequence);
            let hi = next_id(rank, rank_count, counter + 1, IdClass::Sequence);
            prop_assert!(hi > lo);
        }
    }
}
