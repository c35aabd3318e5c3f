//! Timestamp reconstruction heuristics.
//!
//! Containers that carry only presentation timestamps need decode timestamps
//! recovered from the reordering pattern, and transport streams need their
//! packet size guessed before any timestamp can be read.

use std::collections::VecDeque;

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_DVHS_PACKET_SIZE: usize = 192;
pub const TS_FEC_PACKET_SIZE: usize = 204;

pub const PROBE_PACKET_MAX_BUF: usize = 8192;
pub const PROBE_PACKET_MARGIN: i32 = 5;

const TS_SYNC_BYTE: u8 = 0x47;

/// Estimates how many frames presentation order leads decode order by.
///
/// Timestamps arrive in decode order. Each one enters a sorted working set,
/// which then drains while its front matches the next value of the fully
/// sorted list. The largest size the set reaches is the delay.
///
/// ```rust
/// use avformat::process::timestamp::guess_delay_from_pts;
///
/// assert_eq!(guess_delay_from_pts(&[0, 3, 1, 2]), 2);
/// ```
pub fn guess_delay_from_pts(pts: &[i64]) -> usize {
    if pts.len() < 2 {
        return 0;
    }

    let mut sorted = pts.to_vec();
    sorted.sort_unstable();

    let mut pending: VecDeque<i64> = VecDeque::with_capacity(pts.len());
    let mut next = 0usize;
    let mut delay = 0usize;

    for &value in pts {
        let at = pending.partition_point(|&p| p < value);
        pending.insert(at, value);
        delay = delay.max(pending.len());

        while next < sorted.len() && pending.front() == Some(&sorted[next]) {
            pending.pop_front();
            next += 1;
        }
    }

    delay
}

/// Builds decode timestamps for `pts` given a known reordering `delay`.
///
/// The decode sequence is the sorted presentation sequence shifted by
/// `delay` frames. The first `delay` values have no real predecessor and are
/// extrapolated backward from the smallest pts using the distance between the
/// two largest pts. The result has the same length as `pts` and never
/// decreases.
///
/// ```rust
/// use avformat::process::timestamp::guess_dts_from_pts;
///
/// assert_eq!(guess_dts_from_pts(1, &[3, 1, 2, 4]), vec![0, 1, 2, 3]);
/// ```
pub fn guess_dts_from_pts(delay: usize, pts: &[i64]) -> Vec<i64> {
    if pts.is_empty() {
        return Vec::new();
    }

    let mut sorted = pts.to_vec();
    sorted.sort_unstable();

    if delay == 0 {
        return sorted;
    }

    let n = sorted.len();
    let step = if n >= 2 {
        (sorted[n - 1] - sorted[n - 2]).max(1)
    } else {
        1
    };

    (0..n)
        .map(|i| {
            if i < delay {
                sorted[0] - (delay - i) as i64 * step
            } else {
                sorted[i - delay]
            }
        })
        .collect()
}

/// Scores how well `buf` fits a transport stream of `packet_size` byte packets.
///
/// Counts sync bytes per offset modulo the packet size; the best offset's
/// count is penalised by the share of sync bytes that land elsewhere. With
/// `probe` set a candidate must also have the error indicator clear and must
/// not be followed by another sync byte three bytes on.
pub fn analyze_ts_length(buf: &[u8], packet_size: usize, probe: bool) -> i32 {
    if packet_size == 0 || buf.len() < 4 {
        return 0;
    }

    let mut stat = vec![0i32; packet_size];
    let mut stat_all = 0i32;
    let mut best_score = 0i32;

    for i in 0..buf.len() - 3 {
        if buf[i] != TS_SYNC_BYTE {
            continue;
        }
        if probe && (buf[i + 1] & 0x80 != 0 || buf[i + 3] == TS_SYNC_BYTE) {
            continue;
        }
        let x = i % packet_size;
        stat[x] += 1;
        stat_all += 1;
        best_score = best_score.max(stat[x]);
    }

    best_score - (stat_all - 10 * best_score).max(0) / 10
}

/// Picks 188, 192 or 204 byte packets for `buf`, `None` when it is shorter
/// than one packet.
///
/// A size wins when its score beats the median of the three scores, plus a
/// margin when less than [`PROBE_PACKET_MAX_BUF`] bytes were available. Ties
/// fall back to 188.
pub fn guess_packet_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < TS_PACKET_SIZE {
        return None;
    }

    let score = analyze_ts_length(buf, TS_PACKET_SIZE, false);
    let dvhs_score = analyze_ts_length(buf, TS_DVHS_PACKET_SIZE, false);
    let fec_score = analyze_ts_length(buf, TS_FEC_PACKET_SIZE, false);

    let mut scores = [score, dvhs_score, fec_score];
    scores.sort_unstable();
    let mut margin = scores[1];
    if buf.len() < PROBE_PACKET_MAX_BUF {
        margin += PROBE_PACKET_MARGIN;
    }

    let size = if score > margin {
        TS_PACKET_SIZE
    } else if dvhs_score > margin {
        TS_DVHS_PACKET_SIZE
    } else if fec_score > margin {
        TS_FEC_PACKET_SIZE
    } else {
        TS_PACKET_SIZE
    };
    log::debug!("ts packet size {size} (scores {score}/{dvhs_score}/{fec_score}, margin {margin})");

    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn periodic_sync(packet_size: usize, offset: usize, packets: usize) -> Vec<u8> {
        let mut buf = vec![0u8; packet_size * packets];
        for p in 0..packets {
            buf[p * packet_size + offset] = TS_SYNC_BYTE;
        }
        buf
    }

    #[test]
    fn delay_from_reordered_pts() {
        assert_eq!(guess_delay_from_pts(&[0, 3, 1, 2]), 2);
        assert_eq!(guess_delay_from_pts(&[0, 4, 2, 1, 3, 8, 6, 5, 7]), 3);
        assert_eq!(guess_delay_from_pts(&[5]), 0);
        assert_eq!(guess_delay_from_pts(&[]), 0);
    }

    #[test]
    fn dts_from_pts() {
        let dts = guess_dts_from_pts(1, &[3, 1, 2, 4]);
        assert_eq!(dts, vec![0, 1, 2, 3]);

        let dts = guess_dts_from_pts(2, &[0, 3000, 1000, 2000]);
        assert_eq!(dts, vec![-2000, -1000, 0, 1000]);
        assert!(dts.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(guess_dts_from_pts(0, &[2, 0, 1]), vec![0, 1, 2]);
        assert!(guess_dts_from_pts(3, &[]).is_empty());
    }

    #[test]
    fn ts_length_scores() {
        let buf = periodic_sync(TS_PACKET_SIZE, 0, 40);
        let score = analyze_ts_length(&buf, TS_PACKET_SIZE, false);
        let dvhs = analyze_ts_length(&buf, TS_DVHS_PACKET_SIZE, false);
        let fec = analyze_ts_length(&buf, TS_FEC_PACKET_SIZE, false);
        assert_eq!(score, 40);
        assert!(score > dvhs && score > fec);
        assert_eq!(analyze_ts_length(&buf, TS_PACKET_SIZE, true), 40);
    }

    #[test]
    fn packet_size_guess() {
        // m2ts: 4 byte prefix before each sync byte
        let m2ts = periodic_sync(TS_DVHS_PACKET_SIZE, 4, 40);
        assert_eq!(guess_packet_size(&m2ts), Some(TS_DVHS_PACKET_SIZE));

        let fec = periodic_sync(TS_FEC_PACKET_SIZE, 0, 40);
        assert_eq!(guess_packet_size(&fec), Some(TS_FEC_PACKET_SIZE));

        assert_eq!(guess_packet_size(&periodic_sync(TS_PACKET_SIZE, 0, 40)), Some(188));
        assert_eq!(guess_packet_size(&[0x47; 100]), None);
    }
}
