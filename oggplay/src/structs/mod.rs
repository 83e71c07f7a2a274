//! Data structures representing container and codec header components.
//!
//! Contains the page and packet units of the container, the identification
//! headers of each supported codec, the index stream records, and the
//! frame and audio buffers produced by the decoder.

pub mod audio;
pub mod comment;
pub mod frame;
pub mod opus;
pub mod packet;
pub mod page;
pub mod skeleton;
pub mod theora;
pub mod vorbis;
