use crate::util::BitMap;

/// Frame maps of a compiled method, packed into one array of words
///
/// The first `len` words are the code offsets of the trace sites (return addresses), in
/// ascending order. The frame maps follow as one continuous bit run: the map for entry `i`
/// occupies bits `i * map_bits .. (i + 1) * map_bits` of the remaining words.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FrameMapTable {
    map_bits: usize,
    len: usize,
    words: Box<[u32]>,
}

impl FrameMapTable {
    /// Pack `(offset, map)` entries (in any order) into a table
    pub fn encode<'a>(
        map_bits: usize,
        entries: impl IntoIterator<Item = (usize, &'a BitMap)>,
    ) -> FrameMapTable {
        let mut entries: Vec<(usize, &BitMap)> = entries.into_iter().collect();
        entries.sort_by_key(|(offset, _)| *offset);

        let len = entries.len();
        let bit_words = BitMap::words_for(len * map_bits);
        let mut words = vec![0u32; len + bit_words];
        for (i, (offset, map)) in entries.iter().enumerate() {
            words[i] = *offset as u32;
            for bit in map.iter_ones().filter(|bit| *bit < map_bits) {
                let global = i * map_bits + bit;
                words[len + global / BitMap::WORD_BITS] |= 1 << (global % BitMap::WORD_BITS);
            }
        }

        FrameMapTable {
            map_bits,
            len,
            words: words.into_boxed_slice(),
        }
    }

    /// Number of trace sites
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn map_bits(&self) -> usize {
        self.map_bits
    }

    /// The packed representation
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    fn offsets(&self) -> &[u32] {
        &self.words[..self.len]
    }

    fn map_at(&self, entry: usize) -> BitMap {
        let bits = &self.words[self.len..];
        let mut map = BitMap::zeros(self.map_bits);
        for bit in 0..self.map_bits {
            let global = entry * self.map_bits + bit;
            if bits[global / BitMap::WORD_BITS] & (1 << (global % BitMap::WORD_BITS)) != 0 {
                map.set(bit);
            }
        }
        map
    }

    /// Frame map for the trace site whose return address is at `offset`
    pub fn find(&self, offset: usize) -> Option<BitMap> {
        let offset = u32::try_from(offset).ok()?;
        self.offsets()
            .binary_search(&offset)
            .ok()
            .map(|entry| self.map_at(entry))
    }

    /// All entries, in ascending order of offset
    pub fn iter(&self) -> impl Iterator<Item = (usize, BitMap)> + '_ {
        (0..self.len).map(move |entry| (self.words[entry] as usize, self.map_at(entry)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn map(len: usize, ones: &[usize]) -> BitMap {
        let mut map = BitMap::zeros(len);
        for one in ones {
            map.set(*one);
        }
        map
    }

    #[test]
    fn maps_straddle_words() {
        let first = map(20, &[0, 19]);
        let second = map(20, &[3, 12, 13]);
        let third = map(20, &[]);
        let table = FrameMapTable::encode(20, vec![(96, &second), (40, &first), (200, &third)]);

        assert_eq!(table.len(), 3);
        assert_eq!(&table.words()[..3], &[40, 96, 200]);
        assert_eq!(table.words().len(), 3 + 2);

        assert_eq!(table.find(40), Some(first.clone()));
        assert_eq!(table.find(96), Some(second.clone()));
        assert_eq!(table.find(200), Some(third));
        assert_eq!(table.find(41), None);

        let offsets: Vec<usize> = table.iter().map(|(offset, _)| offset).collect();
        assert_eq!(offsets, vec![40, 96, 200]);
    }

    #[test]
    fn empty_table() {
        let table = FrameMapTable::encode(7, vec![]);
        assert!(table.is_empty());
        assert_eq!(table.find(0), None);
    }
}
