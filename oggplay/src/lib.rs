#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! Demuxing and seek logic for Ogg containers carrying one video stream
//! (Theora), one audio stream (Vorbis or Opus) and an optional Skeleton
//! index stream.
//!
//! ### Container Organization
//!
//! **Pages**: checksummed units of up to 255 segments, each belonging to one
//! logical stream identified by its serial number.
//! **Packets**: codec payloads laced across segments, possibly spanning
//! pages. The granule position of a page belongs to the last packet that
//! finishes on it.
//!
//! ### Session Lifecycle
//!
//! 1. Stream identification from beginning-of-stream pages
//! 2. Header negotiation until every claimed stream has its headers
//! 3. Steady-state decoding to timestamped frame and audio buffers
//!
//! ### Seeking
//!
//! Seeks use the Skeleton keypoint index when present. Otherwise the byte
//! range is bisected by decoded timestamps, refined to the governing
//! keyframe, and decoding advances linearly to the target.
//!
//! ## Quick Start
//!
//! Steps for reading a file:
//!
//! 1. Push container bytes into a [`process::decode::Decoder`]
//! 2. Call [`process::decode::Decoder::process`] until metadata is loaded
//! 3. Pull frames and audio with `decode_frame`/`dequeue_frame` and
//!    `decode_audio`/`dequeue_audio`
//!
//! ```rust,no_run
//! use oggplay::process::decode::Decoder;
//!
//! let data = std::fs::read("movie.ogv")?;
//! let mut decoder = Decoder::default();
//!
//! for chunk in data.chunks(64 * 1024) {
//!     decoder.receive_input(chunk)?;
//!
//!     while decoder.process()? {
//!         if decoder.is_frame_ready() && decoder.decode_frame() {
//!             let frame = decoder.dequeue_frame();
//!             // Draw the frame
//!         }
//!         if decoder.is_audio_ready() && decoder.decode_audio() {
//!             let audio = decoder.dequeue_audio();
//!             // Queue the samples
//!         }
//!     }
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Playback with clocks, sinks and seeking is driven by
//! [`player::Player`]; [`player::host`] has in-process collaborators.

/// Codec decoder boundary.
///
/// - **Traits** ([`codec::VideoDecoder`], [`codec::AudioDecoder`],
///   [`codec::CodecBackend`]): external bitstream decoders
/// - **Null backend** ([`codec::null`]): blank pictures and silence of the
///   negotiated geometry
pub mod codec;

/// Playback orchestration.
///
/// - **Player** ([`player::Player`]): clock, sinks and the event loop
/// - **Seek jobs** ([`player::seek`]): index and bisection seek phases
/// - **Bisector** ([`player::bisect`]): binary search over byte offsets
/// - **Host** ([`player::host`]): in-process transport, timer and sinks
pub mod player;

/// Processing pipeline from raw bytes to decoded buffers.
///
/// 1. **Page Sync** ([`process::sync`]): page recovery from chunked input
/// 2. **Streams** ([`process::stream`]): packet assembly per serial
/// 3. **Negotiation** ([`process::negotiate`]): codec identification and
///    header bootstrap
/// 4. **Decoding** ([`process::decode`]): timestamped frames and audio
/// 5. **Index** ([`process::index`]): duration and keypoint lookups
pub mod process;

/// Container and codec header data structures.
///
/// - **Pages and Packets** ([`structs::page`], [`structs::packet`])
/// - **Video headers** ([`structs::theora`])
/// - **Audio headers** ([`structs::vorbis`], [`structs::opus`],
///   [`structs::audio`])
/// - **Index stream** ([`structs::skeleton`])
/// - **Buffers** ([`structs::frame`], [`structs::audio`])
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **Bitstream I/O** ([`utils::bitstream_io`]): header field reading
/// - **CRC Validation** ([`utils::crc`]): page checksums
/// - **Error Handling** ([`utils::errors`]): error types and `log_or_err!`
pub mod utils;
