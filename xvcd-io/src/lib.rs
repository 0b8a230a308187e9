pub mod bits;
pub mod clock;
pub mod mpsse;
pub mod planner;
pub mod stats;
pub mod usb;
mod utils;

pub use crate::{
    planner::{Chunk, PacketLimits, plan_shift, unpack_chunk},
    stats::Stats,
    utils::{Hex, ShortHex, SpaceHex},
};
