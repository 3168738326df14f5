//! U-blox binary protocol support for the two-antenna RTK receiver.
//!
//! Only the two messages the autopilot consumes are decoded: `NAV-PVT`
//! (position / velocity / time) and `NAV-RELPOSNED` (moving-baseline
//! heading between the two antennas). Anything else on the wire is framed,
//! checksum-verified and reported as unsupported.

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};
use bitflags::bitflags;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::error::{Result, SasError};

const SYNC1: u8 = 0xB5;
const SYNC2: u8 = 0x62;
/// Largest payload we accept before assuming a corrupted length field.
const MAX_PAYLOAD: usize = 1024;

bitflags! {
    /// Validity flags of the `NAV-PVT` time solution (field `valid`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[binrw]
    #[br(map = |x: u8| NavPvtValid::from_bits_truncate(x))]
    #[bw(map = |x: &NavPvtValid| x.bits())]
    pub struct NavPvtValid: u8 {
        const VALID_DATE = 1 << 0;
        const VALID_TIME = 1 << 1;
        const FULLY_RESOLVED = 1 << 2;
        const VALID_MAG = 1 << 3;
    }
}

bitflags! {
    /// Fix status flags of `NAV-PVT` (field `flags`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[binrw]
    #[br(map = |x: u8| NavPvtFlags::from_bits_truncate(x))]
    #[bw(map = |x: &NavPvtFlags| x.bits())]
    pub struct NavPvtFlags: u8 {
        const GNSS_FIX_OK = 1 << 0;
        const DIFF_SOLN = 1 << 1;
        const HEAD_VEH_VALID = 1 << 5;
        const CARR_SOLN_FLOAT = 1 << 6;
        const CARR_SOLN_FIXED = 1 << 7;
    }
}

bitflags! {
    /// Status flags of `NAV-RELPOSNED` (field `flags`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[binrw]
    #[br(map = |x: u32| RelPosNedFlags::from_bits_truncate(x))]
    #[bw(map = |x: &RelPosNedFlags| x.bits())]
    pub struct RelPosNedFlags: u32 {
        const GNSS_FIX_OK = 1 << 0;
        const DIFF_SOLN = 1 << 1;
        const REL_POS_VALID = 1 << 2;
        const CARR_SOLN_FLOAT = 1 << 3;
        const CARR_SOLN_FIXED = 1 << 4;
        const IS_MOVING = 1 << 5;
        const REF_POS_MISS = 1 << 6;
        const REF_OBS_MISS = 1 << 7;
        const REL_POS_HEADING_VALID = 1 << 8;
        const REL_POS_NORMALIZED = 1 << 9;
    }
}

/// `NAV-PVT` payload (class 0x01, id 0x07, length 92)
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct NavPvt {
    /// GPS millisecond time of week (Field 1)
    pub itow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    pub valid: NavPvtValid,
    /// Time accuracy estimate in ns (Field 9)
    pub t_acc: u32,
    /// Fraction of second in ns, may be negative (Field 10)
    pub nano: i32,
    /// 0 no fix, 1 dead reckoning, 2 2D, 3 3D, 4 GNSS+DR, 5 time only
    pub fix_type: u8,
    pub flags: NavPvtFlags,
    pub flags2: u8,
    pub num_sv: u8,
    /// Longitude in 1e-7 degrees (Field 15)
    pub lon: i32,
    /// Latitude in 1e-7 degrees (Field 16)
    pub lat: i32,
    /// Height above ellipsoid in mm (Field 17)
    pub height: i32,
    /// Height above mean sea level in mm (Field 18)
    pub h_msl: i32,
    /// Horizontal accuracy in mm (Field 19)
    pub h_acc: u32,
    /// Vertical accuracy in mm (Field 20)
    pub v_acc: u32,
    pub vel_n: i32,
    pub vel_e: i32,
    pub vel_d: i32,
    /// Ground speed in mm/s (Field 24)
    pub g_speed: i32,
    /// Heading of motion in 1e-5 degrees (Field 25)
    pub head_mot: i32,
    /// Speed accuracy in mm/s (Field 26)
    pub s_acc: u32,
    /// Heading accuracy (motion and vehicle) in 1e-5 degrees (Field 27)
    pub head_acc: u32,
    pub p_dop: u16,
    pub reserved1: [u8; 6],
    /// Heading of vehicle in 1e-5 degrees (Field 30)
    pub head_veh: i32,
    pub mag_dec: i16,
    pub mag_acc: u16,
}

impl NavPvt {
    pub const CLASS: u8 = 0x01;
    pub const ID: u8 = 0x07;
    pub const LEN: usize = 92;

    pub fn lat_deg(&self) -> f64 {
        self.lat as f64 * 1e-7
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon as f64 * 1e-7
    }

    /// Height above mean sea level in meters.
    pub fn height_msl_m(&self) -> f64 {
        self.h_msl as f64 * 1e-3
    }

    pub fn h_acc_m(&self) -> f64 {
        self.h_acc as f64 * 1e-3
    }

    pub fn v_acc_m(&self) -> f64 {
        self.v_acc as f64 * 1e-3
    }

    pub fn speed_mps(&self) -> f64 {
        self.g_speed as f64 * 1e-3
    }

    pub fn speed_acc_mps(&self) -> f64 {
        self.s_acc as f64 * 1e-3
    }

    pub fn heading_motion_deg(&self) -> f64 {
        self.head_mot as f64 * 1e-5
    }

    pub fn heading_vehicle_deg(&self) -> f64 {
        self.head_veh as f64 * 1e-5
    }

    pub fn heading_acc_deg(&self) -> f64 {
        self.head_acc as f64 * 1e-5
    }

    /// Time accuracy in microseconds.
    pub fn time_acc_us(&self) -> u32 {
        self.t_acc / 1000
    }

    /// UTC instant of the solution, microsecond precision.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        let micro = if self.nano > 0 {
            (self.nano / 1000) as u32
        } else {
            0
        };
        Utc.with_ymd_and_hms(
            self.year as i32,
            self.month as u32,
            self.day as u32,
            self.hour as u32,
            self.min as u32,
            self.sec as u32,
        )
        .single()
        .map(|dt| dt + chrono::Duration::microseconds(micro as i64))
    }

    pub fn datetime_valid(&self) -> bool {
        self.valid.contains(NavPvtValid::VALID_DATE)
            && self.valid.contains(NavPvtValid::VALID_TIME)
    }
}

/// `NAV-RELPOSNED` payload, message version 1 (class 0x01, id 0x3C, length 64)
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct NavRelPosNed {
    pub version: u8,
    pub reserved1: u8,
    pub ref_station_id: u16,
    pub itow: u32,
    /// North component of the relative position vector in cm (Field 5)
    pub rel_pos_n: i32,
    pub rel_pos_e: i32,
    pub rel_pos_d: i32,
    /// Baseline length in cm (Field 8)
    pub rel_pos_length: i32,
    /// Baseline heading in 1e-5 degrees (Field 9)
    pub rel_pos_heading: i32,
    pub reserved2: [u8; 4],
    pub rel_pos_hp_n: i8,
    pub rel_pos_hp_e: i8,
    pub rel_pos_hp_d: i8,
    pub rel_pos_hp_length: i8,
    pub acc_n: u32,
    pub acc_e: u32,
    pub acc_d: u32,
    pub acc_length: u32,
    /// Heading accuracy in 1e-5 degrees (Field 19)
    pub acc_heading: u32,
    pub reserved3: [u8; 4],
    pub flags: RelPosNedFlags,
}

impl NavRelPosNed {
    pub const CLASS: u8 = 0x01;
    pub const ID: u8 = 0x3C;
    pub const LEN: usize = 64;

    pub fn heading_deg(&self) -> f64 {
        self.rel_pos_heading as f64 * 1e-5
    }

    pub fn heading_acc_deg(&self) -> f64 {
        self.acc_heading as f64 * 1e-5
    }

    pub fn heading_valid(&self) -> bool {
        self.flags.contains(RelPosNedFlags::REL_POS_HEADING_VALID)
    }

    pub fn fix_ok(&self) -> bool {
        self.flags.contains(RelPosNedFlags::GNSS_FIX_OK)
    }
}

/// A checksum-verified frame, not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct UbxFrame {
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

/// Decoded messages the GPS reader dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum UbxPacket {
    Pvt(NavPvt),
    RelPosNed(NavRelPosNed),
    Unsupported { class: u8, id: u8 },
}

impl UbxFrame {
    pub fn decode(&self) -> Result<UbxPacket> {
        match (self.class, self.id) {
            (NavPvt::CLASS, NavPvt::ID) => {
                let mut cursor = Cursor::new(self.payload.as_slice());
                NavPvt::read_le(&mut cursor)
                    .map(UbxPacket::Pvt)
                    .map_err(|e| SasError::InvalidFrame(format!("NAV-PVT: {e}")))
            }
            (NavRelPosNed::CLASS, NavRelPosNed::ID) => {
                let mut cursor = Cursor::new(self.payload.as_slice());
                NavRelPosNed::read_le(&mut cursor)
                    .map(UbxPacket::RelPosNed)
                    .map_err(|e| SasError::InvalidFrame(format!("NAV-RELPOSNED: {e}")))
            }
            (class, id) => Ok(UbxPacket::Unsupported { class, id }),
        }
    }
}

/// 8-bit Fletcher checksum over class, id, length and payload.
fn checksum(data: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;
    for &byte in data {
        ck_a = ck_a.wrapping_add(byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

/// Frame a payload for the wire (tests and request messages).
pub fn build_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(SYNC1);
    frame.push(SYNC2);
    frame.push(class);
    frame.push(id);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    let (ck_a, ck_b) = checksum(&frame[2..]);
    frame.push(ck_a);
    frame.push(ck_b);
    frame
}

/// Buffering frame scanner.
///
/// Feed received bytes with [`consume`](UbxParser::consume); call it again
/// with an empty slice to drain further frames already buffered.
#[derive(Debug, Default)]
pub struct UbxParser {
    buf: Vec<u8>,
}

impl UbxParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume(&mut self, input: &[u8]) -> Option<UbxFrame> {
        self.buf.extend_from_slice(input);
        loop {
            // Hunt for the sync pair.
            let Some(start) = self
                .buf
                .windows(2)
                .position(|w| w == [SYNC1, SYNC2])
            else {
                // Keep a possible lone first sync byte at the tail.
                let keep = usize::from(self.buf.last() == Some(&SYNC1));
                self.buf.drain(..self.buf.len() - keep);
                return None;
            };
            if start > 0 {
                debug!("discarding {start} bytes ahead of UBX sync");
                self.buf.drain(..start);
            }
            if self.buf.len() < 8 {
                return None;
            }
            let payload_len =
                u16::from_le_bytes([self.buf[4], self.buf[5]]) as usize;
            if payload_len > MAX_PAYLOAD {
                debug!("implausible UBX length {payload_len}, resyncing");
                self.buf.drain(..2);
                continue;
            }
            let total = 6 + payload_len + 2;
            if self.buf.len() < total {
                return None;
            }
            let (ck_a, ck_b) = checksum(&self.buf[2..6 + payload_len]);
            if ck_a != self.buf[total - 2] || ck_b != self.buf[total - 1] {
                debug!("UBX checksum mismatch, resyncing");
                self.buf.drain(..2);
                continue;
            }
            let frame = UbxFrame {
                class: self.buf[2],
                id: self.buf[3],
                payload: self.buf[6..6 + payload_len].to_vec(),
            };
            self.buf.drain(..total);
            return Some(frame);
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn sample_pvt() -> NavPvt {
        NavPvt {
            itow: 318191000,
            year: 2024,
            month: 6,
            day: 11,
            hour: 16,
            min: 23,
            sec: 11,
            valid: NavPvtValid::VALID_DATE
                | NavPvtValid::VALID_TIME
                | NavPvtValid::FULLY_RESOLVED,
            t_acc: 25_000,
            nano: 250_000_000,
            fix_type: 3,
            flags: NavPvtFlags::GNSS_FIX_OK,
            flags2: 0,
            num_sv: 17,
            lon: -687_000_000,
            lat: 449_000_000,
            height: 21_000,
            h_msl: 0,
            h_acc: 1_200,
            v_acc: 2_400,
            vel_n: 100,
            vel_e: 50,
            vel_d: -10,
            g_speed: 2_500,
            head_mot: 1_000_000,
            s_acc: 120,
            head_acc: 150_000,
            p_dop: 150,
            reserved1: [0; 6],
            head_veh: 1_100_000,
            mag_dec: -1430,
            mag_acc: 80,
        }
    }

    pub fn sample_relposned(heading_1e5: i32, valid: bool) -> NavRelPosNed {
        let mut flags = RelPosNedFlags::GNSS_FIX_OK
            | RelPosNedFlags::DIFF_SOLN
            | RelPosNedFlags::REL_POS_VALID
            | RelPosNedFlags::CARR_SOLN_FIXED;
        if valid {
            flags |= RelPosNedFlags::REL_POS_HEADING_VALID;
        }
        NavRelPosNed {
            version: 1,
            reserved1: 0,
            ref_station_id: 0,
            itow: 318191000,
            rel_pos_n: 80,
            rel_pos_e: 60,
            rel_pos_d: 2,
            rel_pos_length: 100,
            rel_pos_heading: heading_1e5,
            reserved2: [0; 4],
            rel_pos_hp_n: 0,
            rel_pos_hp_e: 0,
            rel_pos_hp_d: 0,
            rel_pos_hp_length: 0,
            acc_n: 100,
            acc_e: 100,
            acc_d: 200,
            acc_length: 150,
            acc_heading: 50_000,
            reserved3: [0; 4],
            flags,
        }
    }

    pub fn encode_pvt(packet: &NavPvt) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        packet.write_le(&mut cursor).expect("serialize packet");
        build_frame(NavPvt::CLASS, NavPvt::ID, &cursor.into_inner())
    }

    pub fn encode_relposned(packet: &NavRelPosNed) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        packet.write_le(&mut cursor).expect("serialize packet");
        build_frame(NavRelPosNed::CLASS, NavRelPosNed::ID, &cursor.into_inner())
    }
}
