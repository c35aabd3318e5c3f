use std::collections::BTreeMap;

use anyhow::Result;
use avformat::process::demux::{DemuxContext, DemuxOptions};
use avformat::structs::rational::MILLI_TIME_BASE;
use avformat::structs::stream::{MediaType, Stream};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;

use super::command::{Cli, InfoArgs, OutputKind};
use crate::input::open_input;
use crate::timestamp::{time_str, ts_secs};

#[derive(Debug, Serialize)]
pub struct ContainerReport {
    pub format: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub streams: Vec<StreamReport>,
}

#[derive(Debug, Serialize)]
pub struct StreamReport {
    pub index: usize,
    pub id: u32,
    pub media_type: String,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<i32>,
    pub time_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_format: Option<String>,
    pub extradata_size: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disposition: Vec<String>,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct AudioReport {
    pub sample_rate: u32,
    pub channels: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits_per_sample: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_size: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct VideoReport {
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<String>,
    pub reorder_delay: u32,
}

fn nonzero<T: Default + PartialEq>(value: T) -> Option<T> {
    (value != T::default()).then_some(value)
}

impl StreamReport {
    pub fn from_stream(stream: &Stream) -> Self {
        let par = &stream.codecpar;
        let (audio, video) = match par.media_type {
            MediaType::Audio => (
                Some(AudioReport {
                    sample_rate: par.sample_rate,
                    channels: par.channels,
                    bits_per_sample: nonzero(par.bits_per_raw_sample).or(nonzero(par.bits_per_coded_sample)),
                    frame_size: nonzero(par.frame_size),
                }),
                None,
            ),
            MediaType::Video => (
                None,
                Some(VideoReport {
                    width: par.width,
                    height: par.height,
                    frame_rate: par.frame_rate.is_valid().then(|| par.frame_rate.to_string()),
                    reorder_delay: par.video_delay,
                }),
            ),
            _ => (None, None),
        };

        let disposition = stream
            .disposition
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();

        Self {
            index: stream.index,
            id: stream.id,
            media_type: stream.media_type().to_string(),
            codec: par.codec_id.to_string(),
            profile: (par.profile >= 0 && par.codec_id.is_nalu_based()).then_some(par.profile),
            time_base: stream.time_base.to_string(),
            start_time: ts_secs(stream.start_time, stream.time_base),
            duration: stream.duration_secs(),
            frames: nonzero(stream.nb_frames),
            bit_rate: nonzero(par.bit_rate),
            audio,
            video,
            bit_format: par.bit_format.map(|f| format!("{f:?}").to_ascii_lowercase()),
            extradata_size: par.extradata.len(),
            disposition,
            encrypted: !stream.encryption_init.is_empty(),
            metadata: stream.metadata.clone(),
        }
    }
}

impl ContainerReport {
    pub fn from_demux(demux: &DemuxContext) -> Self {
        let size = demux.ctx.io.size();
        let duration = ts_secs(demux.ctx.duration, MILLI_TIME_BASE);
        let bit_rate = duration
            .filter(|d| *d > 0.0 && size > 0)
            .map(|d| (size as f64 * 8.0 / d) as u64);
        Self {
            format: demux.format_name().to_string(),
            size,
            duration,
            bit_rate,
            metadata: demux.ctx.metadata.clone(),
            streams: demux.streams().iter().map(StreamReport::from_stream).collect(),
        }
    }
}

pub fn cmd_info(args: &InfoArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Analyzing input: {}", args.input.display());

    let pb = match multi {
        Some(multi) => {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb.set_message("Analyzing streams...");
            Some(pb)
        }
        None => None,
    };

    let options = DemuxOptions {
        fast_open: args.fast,
        fail_level: cli.fail_level(),
        ..Default::default()
    };
    let result = open_input(&args.input)
        .and_then(|io| Ok(DemuxContext::open(io, None, options)?));
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let mut demux = result?;

    let report = ContainerReport::from_demux(&demux);
    demux.close();

    match args.output {
        OutputKind::Text => display_report(&report),
        OutputKind::Yaml => print!("{}", serde_yaml_ng::to_string(&report)?),
        OutputKind::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}

fn display_report(report: &ContainerReport) {
    println!();
    println!("Container Information");
    println!("=====================");
    println!();
    println!("  Format                    {}", report.format);
    if report.size > 0 {
        let size_mb = report.size as f64 / 1_000_000.0;
        println!("  Size                      {size_mb:.2} MB ({} bytes)", report.size);
    }
    if let Some(duration) = report.duration {
        println!("  Duration                  {}", time_str(duration));
    }
    if let Some(bit_rate) = report.bit_rate {
        println!("  Overall bit rate          {:.1} kbps", bit_rate as f64 / 1000.0);
    }
    display_metadata(&report.metadata, "  ");
    println!();

    for stream in &report.streams {
        display_stream(stream);
    }
}

fn display_stream(stream: &StreamReport) {
    println!("Stream #{} ({})", stream.index, stream.media_type);
    println!("    Codec                   {}", stream.codec);
    if stream.id != 0 {
        println!("    Id                      {:#x}", stream.id);
    }
    if let Some(profile) = stream.profile {
        println!("    Profile                 {profile}");
    }
    println!("    Time base               {}", stream.time_base);

    if let Some(audio) = &stream.audio {
        println!("    Sampling rate           {} Hz", audio.sample_rate);
        println!("    Channels                {}", audio.channels);
        if let Some(bits) = audio.bits_per_sample {
            println!("    Bits per sample         {bits}");
        }
        if let Some(frame_size) = audio.frame_size {
            println!("    Frame size              {frame_size} samples");
        }
    }
    if let Some(video) = &stream.video {
        println!("    Dimensions              {}x{}", video.width, video.height);
        if let Some(rate) = &video.frame_rate {
            println!("    Frame rate              {rate}");
        }
        if video.reorder_delay > 0 {
            println!("    Reorder delay           {} frames", video.reorder_delay);
        }
    }

    if let Some(start) = stream.start_time {
        println!("    Start time              {start:.3} s");
    }
    if let Some(duration) = stream.duration {
        println!("    Duration                {}", time_str(duration));
    }
    if let Some(frames) = stream.frames {
        println!("    Frames                  {frames}");
    }
    if let Some(bit_rate) = stream.bit_rate {
        println!("    Bit rate                {:.1} kbps", bit_rate as f64 / 1000.0);
    }
    if let Some(format) = &stream.bit_format {
        println!("    Packet format           {format}");
    }
    if stream.extradata_size > 0 {
        println!("    Extradata               {} bytes", stream.extradata_size);
    }
    if !stream.disposition.is_empty() {
        println!("    Disposition             {}", stream.disposition.join(", "));
    }
    if stream.encrypted {
        println!("    Encrypted               true");
    }
    display_metadata(&stream.metadata, "    ");
    println!();
}

fn display_metadata(metadata: &BTreeMap<String, String>, indent: &str) {
    if metadata.is_empty() {
        return;
    }
    println!("{indent}Metadata");
    for (key, value) in metadata {
        println!("{indent}  {key:24}{value}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avformat::structs::rational::Rational;
    use avformat::structs::stream::{CodecId, CodecParameters, Disposition};

    #[test]
    fn stream_report_fields() -> Result<()> {
        let mut stream = Stream::new(1, Rational::new(1, 48000));
        stream.codecpar = CodecParameters::audio(CodecId::Aac, 48000, 2);
        stream.codecpar.frame_size = 1024;
        stream.codecpar.extradata = vec![0x11, 0x90];
        stream.duration = 96000;
        stream.disposition = Disposition::DEFAULT;
        stream.metadata.insert("language".into(), "eng".into());

        let report = StreamReport::from_stream(&stream);
        assert_eq!(report.duration, Some(2.0));
        assert_eq!(report.disposition, vec!["default".to_string()]);
        assert!(report.video.is_none());

        let json: serde_json::Value = serde_json::to_value(&report)?;
        assert_eq!(json["audio"]["sample_rate"], 48000);
        assert_eq!(json["audio"]["frame_size"], 1024);
        assert_eq!(json["metadata"]["language"], "eng");
        assert!(json.get("bit_rate").is_none());
        assert!(json.get("start_time").is_none());

        let yaml = serde_yaml_ng::to_string(&report)?;
        assert!(yaml.contains("codec: "));
        assert!(yaml.contains("extradata_size: 2"));
        Ok(())
    }
}
