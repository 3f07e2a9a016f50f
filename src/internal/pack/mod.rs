//! Pack file encoder/decoder following the
//! [pack-format spec](https://git-scm.com/docs/pack-format).

pub mod decode;
pub mod delta;
pub mod encode;
pub mod entry;

pub use decode::{DecodedPack, Pack, PackScanner};
