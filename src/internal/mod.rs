//! Internal building blocks (object model, pack and zlib codecs) that storage and the protocol
//! engine are built on.

pub mod object;
pub mod pack;
pub mod zlib;
