//! ISO base media file format (MP4/MOV).
//!
//! The demuxer walks the box tree with a table of handlers
//! ([`boxes`]) that fill a [`context::MovContext`]; sample tables are then
//! expanded into a flat per-track index ([`index`]). The muxer serializes
//! boxes through [`writer`].

pub mod boxes;
pub mod context;
pub mod demux;
pub mod encryption;
pub mod fragment;
pub mod index;
pub mod items;
pub mod mux;
pub mod reader;
pub mod sample_entry;
pub mod writer;

pub use demux::IMovFormat;
pub use mux::OMovFormat;
