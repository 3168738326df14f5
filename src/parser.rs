//! Calibration-driven frame parser.
//!
//! Satlantic instruments emit fixed-layout frames with no sync or checksum;
//! the only framing information is the set of 10-byte headers declared by
//! the loaded calibration table. Two access patterns are provided:
//!
//! - [`SatParser::split`] cuts a complete byte buffer (a log file) into
//!   frames, decoding the trailing 7-byte time tags,
//! - [`SatParser::find_frame`] scans a live receive buffer for the earliest
//!   complete frame, leaving a partial frame in place for the next refill.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::calibration::Calibration;
use crate::protocol::{unpack7, SATHDR};

/// Cap on the number of ignored leading bytes reported in a warning.
const IGNORED_REPORT_LIMIT: usize = 1000;

/// One frame recovered from a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct SatFrame {
    pub header: Vec<u8>,
    /// Raw frame bytes, header included, trailing time tag stripped when it
    /// decoded.
    pub frame: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Outcome of a streaming scan over a receive buffer.
#[derive(Debug)]
pub enum FrameScan {
    /// A complete frame was cut out of the buffer.
    Frame {
        header: Vec<u8>,
        frame: Bytes,
        /// Unrecognized bytes that preceded the frame, if any.
        junk: Bytes,
    },
    /// No complete frame yet; the caller must refill the buffer.
    Incomplete {
        /// Unrecognized bytes discarded ahead of any possible header.
        junk: Bytes,
    },
}

/// Splits byte streams on the headers known to a calibration table.
#[derive(Debug, Clone)]
pub struct SatParser {
    headers: Vec<Vec<u8>>,
    max_header_len: usize,
}

impl SatParser {
    pub fn new(cal: &Calibration) -> Self {
        Self::from_headers(cal.headers())
    }

    /// Build from an explicit header set; `SATHDR` is always recognized.
    pub fn from_headers(mut headers: Vec<Vec<u8>>) -> Self {
        if !headers.iter().any(|h| h == SATHDR) {
            headers.push(SATHDR.to_vec());
        }
        // Longest first so overlapping headers match greedily.
        headers.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let max_header_len = headers.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            headers,
            max_header_len,
        }
    }

    /// Position and header of the earliest header occurrence at or after
    /// `from`.
    fn find_next(&self, buf: &[u8], from: usize) -> Option<(usize, &[u8])> {
        if from >= buf.len() {
            return None;
        }
        let mut best: Option<(usize, &[u8])> = None;
        for header in &self.headers {
            let limit = best.map_or(buf.len(), |(p, _)| p);
            let window = &buf[from..limit.min(buf.len())];
            if let Some(pos) = find_subsequence(window, header) {
                let abs = from + pos;
                match best {
                    Some((p, _)) if p <= abs => {}
                    _ => best = Some((abs, header)),
                }
            }
        }
        best
    }

    /// Cut a complete buffer into frames.
    ///
    /// Bytes before the first known header are reported as ignored (up to
    /// [`IGNORED_REPORT_LIMIT`] shown); `SATHDR` slots are dropped. The last
    /// 7 bytes of each piece become the frame timestamp when they decode to
    /// a plausible instant, and stay part of the frame otherwise.
    pub fn split(&self, buf: &[u8]) -> Vec<SatFrame> {
        let mut frames = Vec::new();
        let Some((first, _)) = self.find_next(buf, 0) else {
            if !buf.is_empty() {
                warn!("no frames found in {} bytes", buf.len());
            }
            return frames;
        };
        if first > 0 {
            let shown = &buf[..first.min(IGNORED_REPORT_LIMIT)];
            warn!(
                "ignored first {} bytes: {:?}",
                first,
                String::from_utf8_lossy(shown)
            );
        }
        let mut pos = first;
        while let Some((start, header)) = self.find_next(buf, pos) {
            let end = self
                .find_next(buf, start + header.len())
                .map_or(buf.len(), |(p, _)| p);
            pos = end;
            if header == SATHDR {
                continue;
            }
            let piece = &buf[start..end];
            let (frame, timestamp) = match piece
                .len()
                .checked_sub(7)
                .and_then(|at| unpack7(&piece[at..]).map(|ts| (at, ts)))
            {
                Some((at, ts)) => (piece[..at].to_vec(), Some(ts)),
                None => (piece.to_vec(), None),
            };
            frames.push(SatFrame {
                header: header.to_vec(),
                frame,
                timestamp,
            });
        }
        frames
    }

    /// Scan a live receive buffer for the earliest complete frame.
    ///
    /// A frame is complete once a following header occurrence bounds it; the
    /// trailing partial frame stays in the buffer. Unrecognized bytes are
    /// cut out and returned so the caller can still log them.
    pub fn find_frame(&self, buf: &mut BytesMut) -> FrameScan {
        match self.find_next(buf, 0) {
            None => {
                // Nothing recognizable; keep a tail that could be the start
                // of a header split across reads.
                let keep = self.max_header_len.saturating_sub(1).min(buf.len());
                let junk = buf.split_to(buf.len() - keep).freeze();
                FrameScan::Incomplete { junk }
            }
            Some((start, header)) => {
                let header = header.to_vec();
                match self.find_next(buf, start + header.len()) {
                    None => FrameScan::Incomplete {
                        junk: buf.split_to(start).freeze(),
                    },
                    Some((end, _)) => {
                        let junk = buf.split_to(start).freeze();
                        let frame = buf.split_to(end - start).freeze();
                        FrameScan::Frame {
                            header,
                            frame,
                            junk,
                        }
                    }
                }
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
