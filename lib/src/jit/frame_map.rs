//! Replay of the event log to compute frame maps
//!
//! A root vector is threaded through the log: `Mark`/`Clear` set and clear bits, `Ip` at a merge
//! point intersects the vector with the table entry for that point, and `Trace` snapshots the
//! vector into the trace element. Nested contexts get a copy of the vector on entry and drop it
//! on exit. Exception handlers start from the intersection of every trace map inside their
//! protected range.
//!
//! The first time a merge point shows up in a pass is its first visit: the downstream events are
//! replayed right after it, so narrowing there needs no further pass. Later occurrences are paths
//! that rejoined already walked code: if one of those narrows the table, everything downstream
//! saw a map that was too wide and the whole log is replayed again. Tables start out full and
//! only ever lose bits, so this terminates.

use super::{Error, Event, EventLog, TraceElement};
use crate::util::BitMap;
use std::collections::{HashMap, HashSet};

/// Frame maps at merge points, keyed on duplicated offset
#[derive(Debug, Clone)]
pub struct MergeTables {
    tables: HashMap<usize, BitMap>,
}

impl MergeTables {
    /// Full tables for every offset visited more than once
    pub fn new(visits: &[u32], map_size: usize) -> MergeTables {
        let tables = visits
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 1)
            .map(|(ip, _)| (ip, BitMap::filled(map_size)))
            .collect();
        MergeTables { tables }
    }

    pub fn get(&self, ip: usize) -> Option<&BitMap> {
        self.tables.get(&ip)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Merge points in ascending order of duplicated offset
    pub fn iter(&self) -> impl Iterator<Item = (usize, &BitMap)> + '_ {
        let mut ips: Vec<usize> = self.tables.keys().copied().collect();
        ips.sort_unstable();
        ips.into_iter().map(move |ip| (ip, &self.tables[&ip]))
    }
}

/// Result of running the analysis to a fixed point
#[derive(Debug)]
pub struct FrameMapAnalysis {
    pub merge_tables: MergeTables,

    /// Replays of the log, including the final one that changed nothing
    pub passes: usize,
}

/// Replay state for one pass
struct Pass<'a> {
    events: &'a [Event],
    position: usize,
    traces: &'a mut [TraceElement],
    merge_tables: &'a mut MergeTables,
    seen: HashSet<usize>,
    code_length: usize,
    map_size: usize,

    /// Whether trace maps are read back (by exception regions) and so can go stale
    traces_are_inputs: bool,
    dirty: bool,
}

impl<'a> Pass<'a> {
    /// Replay events until the end of the current context
    fn replay(&mut self, mut roots: BitMap) {
        while let Some(event) = self.events.get(self.position).copied() {
            self.position += 1;
            match event {
                Event::EnterContext => self.replay(roots.clone()),
                Event::LeaveContext => return,
                Event::Mark(bit) => roots.set(bit),
                Event::Clear(bit) => roots.clear(bit),
                Event::Ip(ip) => {
                    let first_visit = self.seen.insert(ip);
                    if let Some(table) = self.merge_tables.tables.get_mut(&ip) {
                        let narrowed = table.intersect_with(&roots);
                        if narrowed && !first_visit {
                            log::trace!("merge point {} narrowed on a revisit", ip);
                            self.dirty = true;
                        }
                        roots.clone_from(table);
                    }
                }
                Event::Trace(id) => {
                    let trace = &mut self.traces[id.0];
                    if trace.map != roots {
                        if self.traces_are_inputs {
                            self.dirty = true;
                        }
                        trace.map.clone_from(&roots);
                    }
                }
                Event::EnterExceptionRegion { start, end } => {
                    let handler_roots = self.exception_roots(start, end);
                    self.replay(handler_roots);
                }
            }
        }
    }

    /// Intersection of the maps of every trace in the protected range
    fn exception_roots(&self, start: usize, end: usize) -> BitMap {
        let mut covered = self
            .traces
            .iter()
            .filter(|trace| (start..end).contains(&(trace.ip % self.code_length)));
        match covered.next() {
            None => BitMap::zeros(self.map_size),
            Some(first) => {
                let mut roots = first.map.clone();
                for trace in covered {
                    roots.intersect_with(&trace.map);
                }
                roots
            }
        }
    }
}

/// Replay the log until no merge point or trace map changes
///
/// `visits` is the per-duplicated-offset visit count from the walk and `code_length` the length
/// of the undiluted bytecode.
pub fn analyze(
    log: &EventLog,
    traces: &mut [TraceElement],
    visits: &[u32],
    code_length: usize,
    map_size: usize,
    max_passes: usize,
) -> Result<FrameMapAnalysis, Error> {
    let mut merge_tables = MergeTables::new(visits, map_size);
    let traces_are_inputs = log.has_exception_regions();

    for pass_number in 1..=max_passes {
        let mut pass = Pass {
            events: log.events(),
            position: 0,
            traces: &mut *traces,
            merge_tables: &mut merge_tables,
            seen: HashSet::new(),
            code_length: code_length.max(1),
            map_size,
            traces_are_inputs,
            dirty: false,
        };
        pass.replay(BitMap::zeros(map_size));
        let dirty = pass.dirty;
        log::trace!("frame map pass {} (dirty: {})", pass_number, dirty);

        if !dirty {
            return Ok(FrameMapAnalysis {
                merge_tables,
                passes: pass_number,
            });
        }
    }

    Err(Error::FrameMapDivergence { passes: max_passes })
}
