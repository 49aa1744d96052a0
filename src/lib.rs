//! Banded command lists
//!
//! How does this work
//!    wr = ClistWriter( config, BandStore( stream ) )
//!  Drawing intents
//!    fill_rectangle, copy_mono, fill_path, begin_image, ...
//!      bands_for(y, height)     -- every band the intent touches
//!       write_unknown()         -- imager state the band has not seen
//!       put_op()                -- per band, or put_range_op() for a range
//!        flush()                -- buffer full: runs + index records to the store
//!  End of page
//!    end_page()
//!      flush(end_page)
//!      sentinel record
//!  Replay, one band at a time
//!    rd = ClistReader( config )
//!    rd.play_band( store, band, target )
//!      BandStream               -- the band's runs, in write order
//!       decode opcode, rebuild band and imager state
//!        target.fill_rectangle(), copy_mono(), fill_path(), ...

pub mod error;
pub mod config;
pub mod state;
pub mod matrix;
pub mod path;
pub mod clip;
pub mod opcodes;
pub mod codec;
pub mod rle;
pub mod cfax;
pub mod bits;
pub mod halftone;
pub mod tile_cache;
pub mod store;
pub mod device;
pub mod writer;
pub mod draw;
pub mod reader;
pub mod buffer;
pub mod ppm;

pub use error::{ClistError, Recovery, Result};
pub use config::*;
pub use state::*;
pub use matrix::*;
pub use path::*;
pub use clip::*;
pub use bits::*;
pub use halftone::*;
pub use tile_cache::*;
pub use store::*;
pub use device::*;
pub use writer::*;
pub use reader::*;
pub use buffer::*;
pub use ppm::*;

/// Fixed-point device coordinate, 8 fractional bits
pub type Fixed = i32;

pub const FIXED_SHIFT : i32 = 8;
pub const FIXED_SCALE : Fixed = 1 << FIXED_SHIFT;
pub const FIXED_HALF  : Fixed = FIXED_SCALE / 2;

pub fn int2fixed(v: i32) -> Fixed {
    v << FIXED_SHIFT
}
/// Floor to the containing pixel
pub fn fixed2int(v: Fixed) -> i32 {
    v >> FIXED_SHIFT
}
pub fn fixed2int_ceiling(v: Fixed) -> i32 {
    (v + FIXED_SCALE - 1) >> FIXED_SHIFT
}
pub fn float2fixed(v: f64) -> Fixed {
    (v * f64::from(FIXED_SCALE)).round() as Fixed
}
pub fn fixed2float(v: Fixed) -> f64 {
    f64::from(v) / f64::from(FIXED_SCALE)
}
