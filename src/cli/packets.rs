use std::io::{self, BufWriter, Write};

use anyhow::{Result, bail};
use avformat::formats::SeekFlags;
use avformat::process::demux::{DemuxContext, DemuxOptions};
use avformat::structs::packet::{Packet, PacketFlags};
use avformat::structs::rational::Rational;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;

use super::command::{Cli, OutputKind, PacketsArgs};
use crate::input::open_input;
use crate::timestamp::{ts_secs, ts_str};

#[derive(Debug, Serialize)]
pub struct PacketReport {
    pub stream: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub pts_time: Option<f64>,
    pub duration: i64,
    pub size: usize,
    pub flags: String,
    pub pos: Option<i64>,
}

/// `K` key, `C` corrupt, `D` discard, `E` end of sequence, `_` when clear.
pub fn flags_str(flags: PacketFlags) -> String {
    [
        (PacketFlags::KEY, 'K'),
        (PacketFlags::CORRUPT, 'C'),
        (PacketFlags::DISCARD, 'D'),
        (PacketFlags::END, 'E'),
    ]
    .iter()
    .map(|&(flag, c)| if flags.contains(flag) { c } else { '_' })
    .collect()
}

impl PacketReport {
    pub fn new(packet: &Packet, time_base: Rational) -> Self {
        let set = |ts: i64| ts_secs(ts, time_base).map(|_| ts);
        Self {
            stream: packet.stream_index,
            pts: set(packet.pts),
            dts: set(packet.dts),
            pts_time: ts_secs(packet.pts, time_base),
            duration: packet.duration,
            size: packet.size(),
            flags: flags_str(packet.flags),
            pos: (packet.pos >= 0).then_some(packet.pos),
        }
    }
}

fn write_text(out: &mut impl Write, packet: &Packet) -> io::Result<()> {
    writeln!(
        out,
        "{:>3} {:>12} {:>12} {:>8} {:>8} {} {:>12}",
        packet.stream_index,
        ts_str(packet.pts),
        ts_str(packet.dts),
        packet.duration,
        packet.size(),
        flags_str(packet.flags),
        if packet.pos >= 0 {
            packet.pos.to_string()
        } else {
            "N/A".to_string()
        }
    )
}

pub fn cmd_packets(args: &PacketsArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    let options = DemuxOptions {
        fail_level: cli.fail_level(),
        ..Default::default()
    };
    let mut demux = DemuxContext::open(open_input(&args.input)?, None, options)?;

    if let Some(index) = args.stream {
        if index >= demux.streams().len() {
            bail!("stream {index} does not exist, input has {}", demux.streams().len());
        }
    }
    if let Some(ms) = args.seek {
        demux.seek(args.stream, ms, SeekFlags::BACKWARD)?;
    }

    let pb = match multi {
        Some(multi) => {
            let pb = match demux.estimated_packet_count() {
                Some(total) => {
                    let pb = multi.add(ProgressBar::new(total));
                    pb.set_style(ProgressStyle::with_template(
                        "{bar:40.cyan/blue} {pos}/{len} packets ({percent}%) | elapsed: {elapsed_precise}",
                    )?);
                    pb
                }
                None => {
                    let pb = multi.add(ProgressBar::new_spinner());
                    pb.set_style(ProgressStyle::with_template(
                        "{spinner:.green} {pos} packets | elapsed: {elapsed_precise}",
                    )?);
                    pb
                }
            };
            Some(pb)
        }
        None => None,
    };

    let time_bases: Vec<Rational> = demux.streams().iter().map(|s| s.time_base).collect();
    let mut out = BufWriter::new(io::stdout().lock());
    if args.output == OutputKind::Text {
        writeln!(out, "{:>3} {:>12} {:>12} {:>8} {:>8} {:4} {:>12}", "idx", "pts", "dts", "duration", "size", "flag", "pos")?;
    }

    let mut listed = 0u64;
    loop {
        if args.limit.is_some_and(|limit| listed >= limit) {
            break;
        }
        let packet = match demux.read_packet() {
            Ok(packet) => packet,
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e.into()),
        };
        if let Some(pb) = &pb {
            pb.inc(1);
        }
        if args.stream.is_some_and(|index| index != packet.stream_index) {
            continue;
        }

        match args.output {
            OutputKind::Text => write_text(&mut out, &packet)?,
            OutputKind::Json | OutputKind::Yaml => {
                let time_base = time_bases
                    .get(packet.stream_index)
                    .copied()
                    .unwrap_or(Rational::new(1, 1000));
                let report = PacketReport::new(&packet, time_base);
                if args.output == OutputKind::Json {
                    writeln!(out, "{}", serde_json::to_string(&report)?)?;
                } else {
                    write!(out, "---\n{}", serde_yaml_ng::to_string(&report)?)?;
                }
            }
        }
        listed += 1;
    }
    out.flush()?;

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    log::info!("{listed} packets listed");
    demux.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avformat::structs::rational::NOPTS_VALUE;

    #[test]
    fn flag_letters() {
        assert_eq!(flags_str(PacketFlags::empty()), "____");
        assert_eq!(flags_str(PacketFlags::KEY | PacketFlags::END), "K__E");
        assert_eq!(flags_str(PacketFlags::CORRUPT), "_C__");
    }

    #[test]
    fn text_line_and_report() -> Result<()> {
        let mut packet = Packet::from_vec(vec![0; 12]);
        packet.stream_index = 1;
        packet.pts = 3000;
        packet.dts = NOPTS_VALUE;
        packet.duration = 1500;
        packet.flags = PacketFlags::KEY;

        let mut out = Vec::new();
        write_text(&mut out, &packet)?;
        let line = String::from_utf8(out)?;
        let columns: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(columns, vec!["1", "3000", "N/A", "1500", "12", "K___", "N/A"]);

        let report = PacketReport::new(&packet, Rational::new(1, 90000));
        assert_eq!(report.dts, None);
        assert_eq!(report.pos, None);
        let json: serde_json::Value = serde_json::to_value(&report)?;
        assert_eq!(json["pts"], 3000);
        assert!(json["dts"].is_null());
        assert!((report.pts_time.unwrap_or_default() - 1.0 / 30.0).abs() < 1e-9);
        Ok(())
    }
}
