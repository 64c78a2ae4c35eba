use super::Class;
use crate::jit::{ExceptionRange, FrameMapTable, NativeLineNumber, PoolEntry};
use crate::util::BitMap;

/// Installed machine code for a method, along with what the runtime needs to walk its frames
#[derive(Debug)]
pub struct CompiledMethod {
    name: String,

    /// Address of the first byte of code
    start: u64,
    code: Box<[u8]>,

    /// Words in a frame of this method, excluding the return address
    aligned_frame_size: usize,
    frame_maps: FrameMapTable,
    handlers: Vec<ExceptionRange>,
    line_numbers: Vec<NativeLineNumber>,

    /// Keeps alive everything the code refers to
    pool: Vec<PoolEntry>,
}

impl CompiledMethod {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        start: u64,
        code: Box<[u8]>,
        aligned_frame_size: usize,
        frame_maps: FrameMapTable,
        handlers: Vec<ExceptionRange>,
        line_numbers: Vec<NativeLineNumber>,
        pool: Vec<PoolEntry>,
    ) -> CompiledMethod {
        CompiledMethod {
            name,
            start,
            code,
            aligned_frame_size,
            frame_maps,
            handlers,
            line_numbers,
            pool,
        }
    }

    /// Qualified name of the method, for diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Address just past the last byte of code
    pub fn end(&self) -> u64 {
        self.start + self.code.len() as u64
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end()).contains(&address)
    }

    pub fn aligned_frame_size(&self) -> usize {
        self.aligned_frame_size
    }

    pub fn frame_maps(&self) -> &FrameMapTable {
        &self.frame_maps
    }

    pub fn handlers(&self) -> &[ExceptionRange] {
        &self.handlers
    }

    pub fn line_numbers(&self) -> &[NativeLineNumber] {
        &self.line_numbers
    }

    pub fn pool(&self) -> &[PoolEntry] {
        &self.pool
    }

    fn offset_of(&self, address: u64) -> Option<usize> {
        if address < self.start || address > self.end() {
            return None;
        }
        Some((address - self.start) as usize)
    }

    /// Frame map at a trace site, given its return address
    pub fn frame_map(&self, return_address: u64) -> Option<BitMap> {
        self.frame_maps.find(self.offset_of(return_address)?)
    }

    /// First handler that covers a return address and catches `exception`
    pub fn find_handler(&self, return_address: u64, exception: &Class) -> Option<u64> {
        let offset = self.offset_of(return_address)?;
        self.handlers
            .iter()
            .find(|range| {
                range.covers_return_address(offset)
                    && range
                        .catch_type
                        .as_ref()
                        .map_or(true, |catch_type| exception.is_subclass_of(catch_type))
            })
            .map(|range| self.start + range.handler as u64)
    }

    /// Source line of the instruction before a return address
    pub fn line_number(&self, return_address: u64) -> Option<u16> {
        let offset = self.offset_of(return_address)?;
        self.line_numbers
            .iter()
            .take_while(|entry| entry.offset < offset)
            .last()
            .map(|entry| entry.line)
    }
}
