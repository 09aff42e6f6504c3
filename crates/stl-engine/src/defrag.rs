//! Logical defragmentation.
//!
//! A group's logical span is cut into fixed windows. The window crossed by
//! the most extents is rewritten as one append when it carries enough live
//! data, collapsing its extents into one or two.

use tracing::debug;

use crate::error::StlResult;
use crate::types::{Lba, Priority, SECTOR_SIZE};
use crate::volume::{VolumeInner, VolumeState};
use crate::write::Commit;
use crate::zone::ZoneDevice;

/// Fragmentation of one logical window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowSurvey {
    /// Window start.
    pub(crate) begin: Lba,
    /// Live extents crossing the window.
    pub(crate) extents: usize,
    /// Live sectors inside the window.
    pub(crate) mass: u64,
    /// First live sector inside the window.
    pub(crate) first: Lba,
    /// One past the last live sector inside the window.
    pub(crate) last_end: Lba,
}

/// Most fragmented window of `[start, end)`; the lowest one wins a tie.
/// An extent crossing a window edge counts toward both windows.
pub(crate) fn survey(state: &VolumeState, start: Lba, end: Lba, window: u64) -> Option<WindowSurvey> {
    let mut best: Option<WindowSurvey> = None;
    let mut begin = start;
    while begin < end {
        let finish = (begin + window).min(end);
        let mut cur = WindowSurvey {
            begin,
            extents: 0,
            mass: 0,
            first: finish,
            last_end: begin,
        };
        for extent in state.map.extents_in_range(begin, finish) {
            if extent.is_hole() {
                continue;
            }
            let a = extent.lba.max(begin);
            let b = extent.end().min(finish);
            cur.extents += 1;
            cur.mass += b - a;
            cur.first = cur.first.min(a);
            cur.last_end = cur.last_end.max(b);
        }
        if cur.extents > 0 && best.map_or(true, |b| cur.extents > b.extents) {
            best = Some(cur);
        }
        begin = finish;
    }
    best
}

impl<D: ZoneDevice> VolumeInner<D> {
    /// One defrag pass over group `g`. `idle` lowers the bar for how much
    /// live data a window needs. Returns the rewritten range.
    pub(crate) fn defrag_group(&self, g: u32, idle: bool) -> StlResult<Option<(Lba, Lba)>> {
        let _append = self.append[g as usize].lock();
        let window = self.config.defrag_window(self.sb.band_size) as u64;
        let (start, end) = self.sb.group_lba_range(g);

        let target = survey(&self.state.lock(), start, end, window);
        let Some(target) = target else {
            return Ok(None);
        };
        let min_mass = if idle { window / 8 } else { window / 4 };
        if target.extents < self.config.defrag_min_extents || target.mass < min_mass {
            debug!(
                group = g,
                begin = target.begin,
                extents = target.extents,
                mass = target.mass,
                "defrag skipped"
            );
            return Ok(None);
        }

        let range = (target.first, target.last_end);
        self.state.lock().defrag_window = Some(range);
        let sectors = range.1 - range.0;
        let mut buf = vec![0u8; sectors as usize * SECTOR_SIZE];
        let result = self
            .read_for_maintenance(range.0, &mut buf)
            .and_then(|_| self.append_locked(g, range.0, &buf, Priority::Normal, Commit::Overwrite));

        let mut state = self.state.lock();
        state.defrag_window = None;
        if result.is_ok() {
            state.stats.defrag_passes += 1;
            state.stats.sectors_defragmented += sectors;
        }
        drop(state);
        self.cond.notify_all();
        result?;

        debug!(group = g, begin = range.0, end = range.1, extents = target.extents, "window defragmented");
        Ok(Some(range))
    }
}
