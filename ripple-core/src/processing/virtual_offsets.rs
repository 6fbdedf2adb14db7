use std::collections::HashMap;

/// Offsets of one virtual partition, ascending, and how many of them are confirmed.
#[derive(Debug, Clone, Default)]
struct Segment {
    offsets: Vec<i64>,
    confirmed: usize,
}

/// Tracks which offsets of a batch split into virtual partitions are confirmed, and derives the
/// highest offset that can be committed without skipping unconfirmed work.
///
/// Confirming an offset also confirms every earlier offset of the same virtual partition, since
/// a virtual partition is processed in order.
#[derive(Debug, Clone, Default)]
pub struct VirtualOffsetManager {
    /// All offsets of the batch, ascending.
    offsets: Vec<i64>,
    /// Segment of every offset.
    segment_of: HashMap<i64, usize>,
    segments: HashMap<usize, Segment>,
    /// Length of the confirmed prefix of `offsets`.
    prefix: usize,
}

impl VirtualOffsetManager {
    /// `assignments` are `(offset, segment)` pairs of the whole batch.
    pub fn new(assignments: impl IntoIterator<Item = (i64, usize)>) -> Self {
        let segment_of: HashMap<i64, usize> = assignments.into_iter().collect();
        let mut offsets: Vec<i64> = segment_of.keys().copied().collect();
        offsets.sort_unstable();

        let mut segments: HashMap<usize, Segment> = HashMap::new();
        for offset in &offsets {
            segments
                .entry(segment_of[offset])
                .or_default()
                .offsets
                .push(*offset);
        }
        VirtualOffsetManager {
            offsets,
            segment_of,
            segments,
            prefix: 0,
        }
    }

    /// Confirms `offset` and all earlier offsets of its segment. Unknown offsets are ignored.
    pub fn mark(&mut self, offset: i64) {
        let Some(segment) = self
            .segment_of
            .get(&offset)
            .and_then(|segment| self.segments.get_mut(segment))
        else {
            return;
        };
        let upto = segment.offsets.partition_point(|candidate| *candidate <= offset);
        segment.confirmed = segment.confirmed.max(upto);

        while self
            .offsets
            .get(self.prefix)
            .is_some_and(|next| self.is_marked(*next))
        {
            self.prefix += 1;
        }
    }

    pub fn is_marked(&self, offset: i64) -> bool {
        self.segment_of
            .get(&offset)
            .and_then(|segment| self.segments.get(segment))
            .is_some_and(|segment| {
                segment.offsets.partition_point(|candidate| *candidate < offset) < segment.confirmed
            })
    }

    /// Highest offset such that it and every offset before it in the batch are confirmed.
    pub fn markable(&self) -> Option<i64> {
        self.offsets[..self.prefix].last().copied()
    }
}
