//! Translation of bytecode-relative tables into code offsets
//!
//! Every subroutine copy gets its own entries. Ranges that the walker never reached have no
//! code, so their entries are dropped.

use super::Error;
use crate::backend::Assembler;
use crate::jvm::{BinaryName, ConstantsPool};
use crate::runtime::MethodCode;

/// Exception handler, with code offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRange {
    /// First byte of protected code
    pub start: usize,

    /// Just past the last byte of protected code
    pub end: usize,

    pub handler: usize,

    /// Class of exceptions caught (`None` catches everything)
    ///
    /// Kept by name so that matching during exception delivery walks superclass names and never
    /// has to load anything.
    pub catch_type: Option<BinaryName>,
}

impl ExceptionRange {
    /// Does a trace site with return address at `offset` lie in the protected range?
    ///
    /// The return address of a call at the very end of the range is the end of the range.
    pub fn covers_return_address(&self, offset: usize) -> bool {
        self.start < offset && offset <= self.end
    }
}

/// Line number entry, with a code offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeLineNumber {
    pub offset: usize,
    pub line: u16,
}

/// Which duplicated offsets the walker visited
pub struct Visited<'a> {
    pub visits: &'a [u32],
    pub code_length: usize,
}

impl<'a> Visited<'a> {
    pub fn copies(&self) -> usize {
        if self.code_length == 0 {
            0
        } else {
            self.visits.len() / self.code_length
        }
    }

    pub fn contains(&self, ip: usize) -> bool {
        self.visits.get(ip).map_or(false, |count| *count > 0)
    }

    /// First visited offset in `start..end`
    pub fn first_in(&self, start: usize, end: usize) -> Option<usize> {
        (start..end).find(|ip| self.contains(*ip))
    }

    /// Last visited offset in `start..end`
    pub fn last_in(&self, start: usize, end: usize) -> Option<usize> {
        (start..end).rev().find(|ip| self.contains(*ip))
    }
}

pub fn translate_handlers<A: Assembler>(
    asm: &A,
    code: &MethodCode,
    constants: &ConstantsPool,
    visited: &Visited,
) -> Result<Vec<ExceptionRange>, Error> {
    let mut ranges = vec![];
    for handler in &code.handlers {
        let catch_type = match handler.catch_type {
            Some(index) => Some(constants.get_class_name(index)?),
            None => None,
        };
        let Some(handler_offset) = asm.machine_offset(handler.handler_pc as usize) else {
            log::warn!("dropping handler at {}: never compiled", handler.handler_pc);
            continue;
        };

        for copy in 0..visited.copies() {
            let base = copy * visited.code_length;
            let start = base + handler.start_pc as usize;
            let end = base + handler.end_pc as usize;
            let Some(first) = visited.first_in(start, end) else {
                if copy == 0 {
                    log::warn!(
                        "dropping handler for {}..{}: range never reached",
                        handler.start_pc,
                        handler.end_pc
                    );
                }
                continue;
            };
            let last = visited.last_in(first, end).unwrap_or(first);
            match (asm.machine_offset(first), asm.machine_end_offset(last)) {
                (Some(start), Some(end)) if start < end => ranges.push(ExceptionRange {
                    start,
                    end,
                    handler: handler_offset,
                    catch_type: catch_type.clone(),
                }),
                _ => log::warn!("dropping handler for {}..{} in copy {}", start, end, copy),
            }
        }
    }
    Ok(ranges)
}

pub fn translate_line_numbers<A: Assembler>(
    asm: &A,
    code: &MethodCode,
    visited: &Visited,
) -> Vec<NativeLineNumber> {
    let mut entries = code.line_numbers.clone();
    entries.sort_by_key(|entry| entry.start_pc);

    let mut lines = vec![];
    for copy in 0..visited.copies() {
        let base = copy * visited.code_length;
        for (i, entry) in entries.iter().enumerate() {
            // An entry covers everything up to the next entry
            let limit = entries
                .get(i + 1)
                .map_or(visited.code_length, |next| next.start_pc as usize);
            let start = base + entry.start_pc as usize;
            let found = visited
                .first_in(start, base + limit.max(entry.start_pc as usize))
                .and_then(|ip| asm.machine_offset(ip));
            match found {
                Some(offset) => lines.push(NativeLineNumber {
                    offset,
                    line: entry.line_number,
                }),
                None if copy == 0 => {
                    log::warn!("dropping line {}: code never reached", entry.line_number)
                }
                None => (),
            }
        }
    }
    lines.sort_by_key(|line| line.offset);
    lines
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn visited_searches() {
        let visits = [1, 0, 0, 2, 0, 0, 1, 0];
        let visited = Visited {
            visits: &visits,
            code_length: 4,
        };
        assert_eq!(visited.copies(), 2);
        assert_eq!(visited.first_in(1, 4), Some(3));
        assert_eq!(visited.last_in(0, 3), Some(0));
        assert_eq!(visited.first_in(4, 6), None);
        assert_eq!(visited.first_in(4, 8), Some(6));
        assert!(!visited.contains(12));
    }

    #[test]
    fn return_addresses_at_the_end_are_covered() {
        let range = ExceptionRange {
            start: 10,
            end: 40,
            handler: 60,
            catch_type: None,
        };
        assert!(!range.covers_return_address(10));
        assert!(range.covers_return_address(11));
        assert!(range.covers_return_address(40));
        assert!(!range.covers_return_address(41));
    }
}
