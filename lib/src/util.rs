mod bit_map;
mod offset_vec;
mod ref_id;

pub use bit_map::*;
pub use offset_vec::*;
pub use ref_id::*;
