//! Utility functions and supporting infrastructure.
//!
//! Provides bitstream I/O, CRC validation, structured byte writers, error
//! handling and packet pooling.

pub mod bitstream_io;
pub mod buffer_pool;
pub mod byteorder;
pub mod crc;
pub mod errors;
