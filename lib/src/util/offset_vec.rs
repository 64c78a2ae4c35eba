use std::fmt::{Debug, Error, Formatter};
use std::iter::{Enumerate, FromIterator};
use std::slice::Iter;

/// Elements that occupy a number of slots (eg. `long` values take two JVM slots)
pub trait Width {
    fn width(&self) -> usize;
}

/// A vector of elements that each occupy some number of slots, addressed either by position or
/// by slot offset (the sum of the widths of all preceding elements).
///
/// The JVM addresses several structures this way:
///
///   - constant pool entries (`long` and `double` constants take two indices)
///   - operand stack slots (`long` and `double` values take two slots)
///
#[derive(Clone, PartialEq, Eq)]
pub struct OffsetVec<T> {
    /// Entries, each tagged with the offset of its first slot
    entries: Vec<(Offset, T)>,

    /// Offset at which the next pushed element will start
    offset_len: Offset,

    /// Offset of the first element (the constant pool starts at 1)
    initial_offset: Offset,
}

/// Slot offset into an `OffsetVec`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub usize);

impl<T: Width> OffsetVec<T> {
    pub fn new() -> OffsetVec<T> {
        OffsetVec::new_starting_at(Offset(0))
    }

    pub fn new_starting_at(initial_offset: Offset) -> OffsetVec<T> {
        OffsetVec {
            entries: vec![],
            offset_len: initial_offset,
            initial_offset,
        }
    }

    /// Number of elements (not slots)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset just past the last slot of the last element
    pub fn offset_len(&self) -> Offset {
        self.offset_len
    }

    /// Number of slots occupied by all elements
    pub fn slot_len(&self) -> usize {
        self.offset_len.0 - self.initial_offset.0
    }

    /// Add an element to the back, returning the offset it starts at
    pub fn push(&mut self, elem: T) -> Offset {
        let offset = self.offset_len;
        self.offset_len.0 += elem.width();
        self.entries.push((offset, elem));
        offset
    }

    /// Remove the element at the back, along with the offset it started at
    pub fn pop(&mut self) -> Option<(Offset, T)> {
        let (offset, elem) = self.entries.pop()?;
        self.offset_len = offset;
        Some((offset, elem))
    }

    /// Element at the back
    pub fn last(&self) -> Option<(Offset, &T)> {
        self.entries.last().map(|(offset, elem)| (*offset, elem))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.offset_len = self.initial_offset;
    }

    /// Find the element starting exactly at this offset
    ///
    /// Note: this uses binary search, since offsets are increasing
    pub fn get_offset(&self, offset: Offset) -> Option<&T> {
        self.entries
            .binary_search_by_key(&offset, |(off, _)| *off)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    pub fn iter(&self) -> OffsetVecIter<'_, T> {
        OffsetVecIter(self.entries.iter().enumerate())
    }
}

impl<T: Width> Default for OffsetVec<T> {
    fn default() -> Self {
        OffsetVec::new()
    }
}

/// Iterator for borrowed `OffsetVec`, yielding offset, position, and element
pub struct OffsetVecIter<'a, T>(Enumerate<Iter<'a, (Offset, T)>>);

impl<'a, T> Iterator for OffsetVecIter<'a, T> {
    type Item = (Offset, usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(idx, (off, elem))| (*off, idx, elem))
    }
}

impl<'a, T: Width> IntoIterator for &'a OffsetVec<T> {
    type Item = (Offset, usize, &'a T);
    type IntoIter = OffsetVecIter<'a, T>;

    fn into_iter(self) -> OffsetVecIter<'a, T> {
        self.iter()
    }
}

impl<T: Width> FromIterator<T> for OffsetVec<T> {
    fn from_iter<A: IntoIterator<Item = T>>(elems: A) -> Self {
        let mut offset_vec = OffsetVec::new();
        for elem in elems {
            offset_vec.push(elem);
        }
        offset_vec
    }
}

impl<T: Debug> Debug for OffsetVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let mut list = f.debug_list();
        for (off, elem) in &self.entries {
            list.entry(&format_args!("#{} = {:?}", off.0, elem));
        }
        list.finish()
    }
}
