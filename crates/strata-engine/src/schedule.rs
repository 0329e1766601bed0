//! The process-wide schedule of requests and its low-water-mark.
//!
//! Every submitted request is appended here and holds one reference for the
//! schedule. The sweep only ever removes from the head, and only a head that
//! is terminal and referenced by nothing but the schedule itself, so the
//! low-water-mark never reports a request retired out of submission order.

use strata_types::SequenceId;
use tracing::debug;

use crate::arena::RequestArena;
use crate::error::EngineResult;
use crate::list::{ListHead, ListRole};
use crate::request::RequestKey;

#[derive(Debug, Default)]
pub struct GlobalSchedule {
    list: ListHead,
    low_water_mark: SequenceId,
    swept: u64,
}

impl GlobalSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence id through which every request has retired.
    pub fn low_water_mark(&self) -> SequenceId {
        self.low_water_mark
    }

    /// Requests still on the schedule.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Requests removed by sweeps so far.
    pub fn swept(&self) -> u64 {
        self.swept
    }

    pub(crate) fn append(&mut self, arena: &mut RequestArena, key: RequestKey) -> EngineResult<()> {
        arena.push_back(&mut self.list, ListRole::Global, key)
    }

    /// Reclaim retired requests from the head. Returns how many were removed.
    pub(crate) fn sweep(&mut self, arena: &mut RequestArena) -> EngineResult<usize> {
        let mut removed = 0;
        while let Some(head) = self.list.head() {
            let node = arena.node(head)?;
            if !node.is_terminal() || node.ref_count != 1 {
                break;
            }
            let seq = node.seq;
            arena.unlink(&mut self.list, ListRole::Global, head)?;
            self.low_water_mark = self.low_water_mark.max(seq);
            removed += 1;
        }
        if removed > 0 {
            self.swept += removed as u64;
            debug!(
                removed,
                low_water_mark = %self.low_water_mark,
                remaining = self.list.len(),
                "swept schedule"
            );
        }
        Ok(removed)
    }
}
