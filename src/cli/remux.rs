use anyhow::{Result, anyhow, bail};
use avformat::formats::OutputFormat;
use avformat::process::bsf::{BitstreamFilter, Bsf, BsfChain};
use avformat::process::demux::{DemuxContext, DemuxOptions};
use avformat::process::mux::{MuxContext, MuxOptions};
use avformat::structs::packet::{BitFormat, Packet, SideData};
use avformat::structs::rational::Rational;
use avformat::structs::stream::Stream;
use avformat::utils::buffer_pool::PacketPool;
use avformat::utils::errors::FormatError;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::command::{Cli, RemuxArgs};
use crate::input::{open_input, open_output};

/// Where an input stream's packets go.
struct Route {
    output: usize,
    time_base: Rational,
    filter: Option<BsfChain>,
    /// Configuration record handed to the filter with the first packet, so
    /// start-code output opens with parameter sets.
    record: Option<Vec<u8>>,
}

/// NAL unit delimiting the muxer stores.
fn native_bit_format(format: &OutputFormat) -> Option<BitFormat> {
    match format {
        OutputFormat::Mov(_) | OutputFormat::Flv(_) => Some(BitFormat::Avcc),
        OutputFormat::Mpegts(_) => Some(BitFormat::AnnexB),
        _ => None,
    }
}

/// NAL unit delimiting wanted in the output, if it should change.
fn target_bit_format(args: &RemuxArgs, native: Option<BitFormat>) -> Option<BitFormat> {
    if args.annexb {
        Some(BitFormat::AnnexB)
    } else if args.avcc {
        Some(BitFormat::Avcc)
    } else {
        native
    }
}

/// Filter converting `stream` to `target`, `None` when it already matches.
fn nalu_filter(stream: &Stream, target: Option<BitFormat>) -> Option<Bsf> {
    let target = target?;
    if !stream.codecpar.codec_id.is_nalu_based() {
        return None;
    }
    let current = stream.codecpar.bit_format.unwrap_or(BitFormat::Avcc);
    if current == target {
        return None;
    }
    let name = match target {
        BitFormat::AnnexB => "avcc2annexb",
        BitFormat::Avcc => "annexb2avcc",
    };
    Bsf::by_name(name)
}

/// Writes `packet` through `route`. Unfiltered packets are written in place
/// and stay with the caller for recycling; filtered ones are moved into the
/// filter.
fn write_filtered(muxer: &mut MuxContext, route: &mut Route, packet: &mut Packet) -> Result<u64> {
    packet.stream_index = route.output;
    let Some(filter) = &mut route.filter else {
        muxer.write_packet_mut(packet, route.time_base)?;
        return Ok(1);
    };
    if let Some(record) = route.record.take() {
        if packet.new_extradata().is_none() {
            packet.add_side_data(SideData::NewExtradata(record));
        }
    }
    filter.send_packet(std::mem::take(packet))?;
    let mut written = 0;
    loop {
        match filter.receive_packet() {
            Ok(packet) => {
                muxer.write_packet(packet, route.time_base)?;
                written += 1;
            }
            Err(FormatError::Eof) => return Ok(written),
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn cmd_remux(args: &RemuxArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    let output_name = args.output.to_string_lossy();
    let format = match args.format {
        Some(format) => OutputFormat::by_name(format.muxer_name()),
        None => OutputFormat::from_extension(&output_name),
    }
    .ok_or_else(|| anyhow!("cannot tell the output format of {output_name}, use --format"))?;
    let native = native_bit_format(&format);

    log::info!(
        "Remuxing {} to {} (strict mode: {})",
        args.input.display(),
        args.output.display(),
        cli.strict
    );

    let pool = PacketPool::default();
    let options = DemuxOptions {
        fail_level: cli.fail_level(),
        pool: Some(pool.clone()),
        ..Default::default()
    };
    let mut demux = DemuxContext::open(open_input(&args.input)?, None, options)?;
    for &index in &args.streams {
        if index >= demux.streams().len() {
            bail!("stream {index} does not exist, input has {}", demux.streams().len());
        }
    }

    let mux_options = MuxOptions {
        fragmented: args.fragmented,
        fast_start: args.fast_start,
        force_rf64: args.rf64,
    };
    let mut muxer = MuxContext::new(open_output(&args.output)?, format, mux_options);
    muxer.ctx.metadata = demux.ctx.metadata.clone();

    let target = target_bit_format(args, native);
    let mut routes: Vec<Option<Route>> = Vec::with_capacity(demux.streams().len());
    for stream in demux.streams() {
        if !args.streams.is_empty() && !args.streams.contains(&stream.index) {
            log::debug!("stream {} not selected", stream.index);
            routes.push(None);
            continue;
        }

        let bsf = nalu_filter(stream, target);
        let record = match &bsf {
            Some(Bsf::Avcc2AnnexB(_)) if !stream.codecpar.extradata.is_empty() => {
                Some(stream.codecpar.extradata.clone())
            }
            _ => None,
        };
        let mut filter = bsf.map(|bsf| BsfChain::new(vec![bsf]));
        let codecpar = match &mut filter {
            Some(chain) => {
                chain.init(&stream.codecpar, stream.time_base)?;
                chain.codecpar_out().clone()
            }
            None => stream.codecpar.clone(),
        };
        let output = muxer.add_stream(codecpar, stream.time_base)?;
        let out_stream = &mut muxer.ctx.streams[output];
        out_stream.metadata = stream.metadata.clone();
        out_stream.disposition = stream.disposition;
        out_stream.encryption_init = stream.encryption_init.clone();
        log::info!(
            "stream {} ({}) -> {output}{}",
            stream.index,
            stream.codecpar.codec_id,
            if filter.is_some() { " with bitstream filter" } else { "" }
        );
        routes.push(Some(Route {
            output,
            time_base: stream.time_base,
            filter,
            record,
        }));
    }
    if routes.iter().all(Option::is_none) {
        bail!("no streams to remux");
    }
    muxer.write_header()?;

    let pb = match multi {
        Some(multi) => {
            let pb = match demux.estimated_packet_count() {
                Some(total) => {
                    let pb = multi.add(ProgressBar::new(total));
                    pb.set_style(ProgressStyle::with_template(
                        "{bar:40.cyan/blue} {pos}/{len} packets ({percent}%)\n{msg} | elapsed: {elapsed_precise} | ETA: {eta_precise}",
                    )?);
                    pb.enable_steady_tick(std::time::Duration::from_millis(100));
                    pb
                }
                None => {
                    let pb = multi.add(ProgressBar::new_spinner());
                    pb.set_style(ProgressStyle::with_template(
                        "{spinner:.green} {pos} packets\n{msg} | elapsed: {elapsed_precise}",
                    )?);
                    pb
                }
            };
            pb.set_message(format!("writing {}", muxer.format_name()));
            Some(pb)
        }
        None => None,
    };

    let mut read = 0u64;
    let mut written = 0u64;
    loop {
        let (slot, mut packet) = match demux.read_pooled() {
            Ok(pooled) => pooled.into_parts(),
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e.into()),
        };
        read += 1;
        if let Some(pb) = &pb {
            pb.inc(1);
        }
        if let Some(Some(route)) = routes.get_mut(packet.stream_index) {
            written += write_filtered(&mut muxer, route, &mut packet)?;
        }
        pool.release(slot, packet)?;
    }
    muxer.write_trailer()?;
    demux.close();

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    log::info!("{read} packets read, {written} written");
    log::debug!(
        "packet pool: {} outstanding, {} buffers idle",
        pool.outstanding(),
        pool.available()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avformat::structs::stream::{CodecId, CodecParameters};

    fn stream(codec_id: CodecId, bit_format: Option<BitFormat>) -> Stream {
        let mut stream = Stream::new(0, Rational::new(1, 90000));
        stream.codecpar = CodecParameters::video(codec_id, 1920, 1080);
        stream.codecpar.bit_format = bit_format;
        stream
    }

    #[test]
    fn filters_only_mismatched_nal_streams() {
        let ts_video = stream(CodecId::H264, Some(BitFormat::AnnexB));
        let mp4_video = stream(CodecId::Hevc, Some(BitFormat::Avcc));
        let audio = stream(CodecId::Aac, None);

        let to_avcc = Some(BitFormat::Avcc);
        assert_eq!(nalu_filter(&ts_video, to_avcc).map(|f| f.name()), Some("annexb2avcc"));
        assert!(nalu_filter(&mp4_video, to_avcc).is_none());
        assert!(nalu_filter(&audio, to_avcc).is_none());

        let to_annexb = Some(BitFormat::AnnexB);
        assert_eq!(nalu_filter(&mp4_video, to_annexb).map(|f| f.name()), Some("avcc2annexb"));
        assert!(nalu_filter(&ts_video, to_annexb).is_none());
        assert!(nalu_filter(&ts_video, None).is_none());
    }

    #[test]
    fn containers_pick_their_nal_framing() {
        let native = |name: &str| OutputFormat::by_name(name).and_then(|f| native_bit_format(&f));
        assert_eq!(native("mpegts"), Some(BitFormat::AnnexB));
        assert_eq!(native("flv"), Some(BitFormat::Avcc));
        assert_eq!(native("mp4"), Some(BitFormat::Avcc));
        assert_eq!(native("wav"), None);
    }
}
