//! Utility functions and supporting infrastructure.
//!
//! Provides bitstream I/O for header parsing, page CRC validation and the
//! error types shared by the pipeline stages.

pub mod bitstream_io;
pub mod crc;
pub mod errors;

#[cfg(test)]
pub(crate) mod testing;
