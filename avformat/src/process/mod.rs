/// Packet bitstream filters.
///
/// Provides the [`BitstreamFilter`](bsf::BitstreamFilter) trait, the
/// [`Bsf`](bsf::Bsf) dispatcher and [`BsfChain`](bsf::BsfChain).
pub mod bsf;

/// Demuxing front end.
///
/// Provides [`DemuxContext`](demux::DemuxContext), which probes, analyzes
/// streams and reconstructs missing decode timestamps.
pub mod demux;

/// Muxing front end.
///
/// Provides [`MuxContext`](mux::MuxContext) for writing packets through an
/// output format.
pub mod mux;

/// Reorder delay, decode timestamp and transport packet size heuristics.
pub mod timestamp;
