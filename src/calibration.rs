//! Calibration table for the radiometer stack.
//!
//! A calibration bundle (a `.sip` zip archive, a directory, or a single
//! file) holds one `.cal`/`.tdf` text file per optical head. Each file
//! declares the 10-byte frame header (`INSTRUMENT` + `SN` rows) and the
//! fixed field layout of that head's frames. The table drives both frame
//! identification (the header set the parser splits on) and wavelength
//! labeling of the spectral channels.
//!
//! Radiometric coefficients present in the files are skipped: calibration
//! of the optical counts is a downstream concern.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, SasError};

/// Logical role of a sensor head, derived from its calibration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Water-leaving radiance.
    Lt,
    LtDark,
    /// Sky radiance.
    Li,
    LiDark,
    /// Downwelling irradiance.
    Es,
    EsDark,
    /// Tilt-heading sensor.
    Ths,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::Lt,
        Channel::LtDark,
        Channel::Li,
        Channel::LiDark,
        Channel::Es,
        Channel::EsDark,
        Channel::Ths,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Lt => "Lt",
            Channel::LtDark => "Lt_dark",
            Channel::Li => "Li",
            Channel::LiDark => "Li_dark",
            Channel::Es => "Es",
            Channel::EsDark => "Es_dark",
            Channel::Ths => "THS",
        }
    }

    /// The shutter-closed counterpart of a bright optical channel.
    pub fn dark(self) -> Option<Channel> {
        match self {
            Channel::Lt => Some(Channel::LtDark),
            Channel::Li => Some(Channel::LiDark),
            Channel::Es => Some(Channel::EsDark),
            _ => None,
        }
    }
}

/// On-wire encoding of one frame field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// `BU`: big-endian unsigned integer (1, 2 or 4 bytes).
    BinaryUnsigned,
    /// `BS`: big-endian signed integer (1, 2 or 4 bytes).
    BinarySigned,
    /// `BF`: big-endian IEEE-754 single.
    BinaryFloat,
    /// `BD`: big-endian IEEE-754 double.
    BinaryDouble,
    /// `AS`/`AI`/`AF`: fixed-width ASCII.
    Ascii,
}

impl FieldType {
    fn parse(token: &str) -> Result<FieldType> {
        match token {
            "BU" => Ok(FieldType::BinaryUnsigned),
            "BS" => Ok(FieldType::BinarySigned),
            "BF" => Ok(FieldType::BinaryFloat),
            "BD" => Ok(FieldType::BinaryDouble),
            "AS" | "AI" | "AF" => Ok(FieldType::Ascii),
            other => Err(SasError::Calibration(format!(
                "unknown field data type {other:?}"
            ))),
        }
    }
}

/// One field row of a calibration file.
#[derive(Debug, Clone)]
pub struct CalField {
    /// First token: the variable group (`LT`, `ES`, `ROLL`, `INTTIME`, ...).
    pub kind: String,
    /// Second token: the field id; a wavelength for spectral channels.
    pub id: String,
    pub units: String,
    pub len: usize,
    pub ftype: FieldType,
}

/// Calibration of one sensor head.
#[derive(Debug, Clone)]
pub struct CalEntry {
    /// Frame header bytes, `INSTRUMENT` id + `SN` id (e.g. `SATHSL0234`).
    pub header: Vec<u8>,
    pub channel: Channel,
    /// All fields in wire order, the header rows included.
    pub fields: Vec<CalField>,
    /// Fixed frame length in bytes (sum of field lengths).
    pub frame_len: usize,
    /// Dominant optical group (`LT`, `LI`, `ES`), empty for the THS.
    pub core_group: String,
    /// Wavelength labels of the spectral fields, in wire order.
    pub wavelengths: Vec<f64>,
}

impl CalEntry {
    fn field_value(&self, frame: &[u8], offset: usize, field: &CalField) -> Result<f64> {
        let end = offset + field.len;
        if frame.len() < end {
            return Err(SasError::InvalidFrame(format!(
                "frame too short for {}: {} < {}",
                field.kind,
                frame.len(),
                end
            )));
        }
        let raw = &frame[offset..end];
        let value = match field.ftype {
            FieldType::BinaryUnsigned => match field.len {
                1 => raw[0] as f64,
                2 => u16::from_be_bytes([raw[0], raw[1]]) as f64,
                4 => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
                n => {
                    return Err(SasError::Calibration(format!(
                        "unsupported BU length {n}"
                    )))
                }
            },
            FieldType::BinarySigned => match field.len {
                1 => raw[0] as i8 as f64,
                2 => i16::from_be_bytes([raw[0], raw[1]]) as f64,
                4 => i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
                n => {
                    return Err(SasError::Calibration(format!(
                        "unsupported BS length {n}"
                    )))
                }
            },
            FieldType::BinaryFloat => {
                if field.len != 4 {
                    return Err(SasError::Calibration("BF field must be 4 bytes".into()));
                }
                f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64
            }
            FieldType::BinaryDouble => {
                if field.len != 8 {
                    return Err(SasError::Calibration("BD field must be 8 bytes".into()));
                }
                f64::from_be_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ])
            }
            FieldType::Ascii => {
                let text = String::from_utf8_lossy(raw);
                text.trim_matches(|c: char| c.is_whitespace() || c == ',' || c == '\0')
                    .parse()
                    .unwrap_or(f64::NAN)
            }
        };
        Ok(value)
    }

    /// Collect the values of every field of `kind` in wire order.
    pub fn vector(&self, frame: &[u8], kind: &str) -> Result<Vec<f64>> {
        if frame.len() < self.frame_len {
            return Err(SasError::InvalidFrame(format!(
                "{} frame truncated: {} < {}",
                String::from_utf8_lossy(&self.header),
                frame.len(),
                self.frame_len
            )));
        }
        let mut values = Vec::new();
        let mut offset = 0;
        for field in &self.fields {
            if field.kind == kind {
                values.push(self.field_value(frame, offset, field)?);
            }
            offset += field.len;
        }
        Ok(values)
    }

    /// Value of the first field of `kind`.
    pub fn scalar(&self, frame: &[u8], kind: &str) -> Result<f64> {
        let mut offset = 0;
        for field in &self.fields {
            if field.kind == kind {
                return self.field_value(frame, offset, field);
            }
            offset += field.len;
        }
        Err(SasError::InvalidFrame(format!("no {kind} field")))
    }

    /// The spectral vector of an optical head.
    pub fn optical_vector(&self, frame: &[u8]) -> Result<Vec<f64>> {
        self.vector(frame, &self.core_group)
    }
}

/// The loaded calibration table.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    entries: HashMap<Vec<u8>, CalEntry>,
    immersed: bool,
}

impl Calibration {
    /// Build a table from already-parsed entries (used by tests and tools).
    pub fn from_entries(entries: Vec<CalEntry>, immersed: bool) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.header.clone(), e)).collect(),
            immersed,
        }
    }

    /// Load from a `.sip` archive, a directory of `.cal`/`.tdf` files, or a
    /// single calibration file.
    pub fn load(path: &Path, immersed: bool) -> Result<Self> {
        let mut entries = Vec::new();
        if path.is_dir() {
            for dir_entry in fs::read_dir(path)? {
                let p = dir_entry?.path();
                if is_cal_file(&p) {
                    entries.push(parse_cal_text(
                        &p.to_string_lossy(),
                        &fs::read_to_string(&p)?,
                    )?);
                }
            }
        } else if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("sip")) {
            let file = fs::File::open(path)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| SasError::Calibration(format!("bad sip archive: {e}")))?;
            for i in 0..archive.len() {
                let mut member = archive
                    .by_index(i)
                    .map_err(|e| SasError::Calibration(format!("bad sip member: {e}")))?;
                let name = member.name().to_string();
                if is_cal_file(Path::new(&name)) {
                    let mut text = String::new();
                    member.read_to_string(&mut text)?;
                    entries.push(parse_cal_text(&name, &text)?);
                }
            }
        } else {
            entries.push(parse_cal_text(
                &path.to_string_lossy(),
                &fs::read_to_string(path)?,
            )?);
        }
        if entries.is_empty() {
            return Err(SasError::Calibration(format!(
                "no calibration files found in {}",
                path.display()
            )));
        }
        for entry in &entries {
            debug!(
                "calibration {}: {} ({} bytes/frame, {} wavelengths)",
                String::from_utf8_lossy(&entry.header),
                entry.channel.as_str(),
                entry.frame_len,
                entry.wavelengths.len()
            );
        }
        Ok(Self::from_entries(entries, immersed))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn immersed(&self) -> bool {
        self.immersed
    }

    /// All frame headers known to this table.
    pub fn headers(&self) -> Vec<Vec<u8>> {
        self.entries.keys().cloned().collect()
    }

    pub fn entry(&self, header: &[u8]) -> Option<&CalEntry> {
        self.entries.get(header)
    }

    pub fn entry_for(&self, channel: Channel) -> Option<&CalEntry> {
        self.entries.values().find(|e| e.channel == channel)
    }

    /// Wavelength labels of a bright optical channel.
    pub fn wavelengths(&self, channel: Channel) -> Option<&[f64]> {
        self.entry_for(channel).map(|e| e.wavelengths.as_slice())
    }

    /// Dispatch map: frame header to channel role.
    pub fn dispatcher(&self) -> HashMap<Vec<u8>, Channel> {
        self.entries
            .iter()
            .map(|(h, e)| (h.clone(), e.channel))
            .collect()
    }
}

fn is_cal_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| {
        e.eq_ignore_ascii_case("cal") || e.eq_ignore_ascii_case("tdf")
    })
}

/// Split a calibration line into tokens, honoring single-quoted units.
/// A quoted token may be empty (`''`) and still counts.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut token_quoted = false;
    for c in line.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                token_quoted = true;
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() || token_quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                token_quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || token_quoted {
        tokens.push(current);
    }
    tokens
}

/// Parse one calibration file into a [`CalEntry`].
fn parse_cal_text(name: &str, text: &str) -> Result<CalEntry> {
    let mut fields: Vec<CalField> = Vec::new();
    let mut instrument = String::new();
    let mut serial = String::new();
    let mut coefficient_lines = 0usize;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if coefficient_lines > 0 {
            coefficient_lines -= 1;
            continue;
        }
        let tokens = tokenize(line);
        if tokens.len() < 7 {
            return Err(SasError::Calibration(format!(
                "{name}: malformed line {line:?}"
            )));
        }
        let kind = tokens[0].clone();
        let id = tokens[1].clone();
        let units = tokens[2].clone();
        let len: usize = tokens[3]
            .parse()
            .map_err(|_| SasError::Calibration(format!("{name}: bad field length in {line:?}")))?;
        let ftype = FieldType::parse(&tokens[4])?;
        coefficient_lines = tokens[5].parse().unwrap_or(0);

        match kind.as_str() {
            "INSTRUMENT" => instrument = id.clone(),
            "SN" => serial = id.clone(),
            _ => {}
        }
        fields.push(CalField {
            kind,
            id,
            units,
            len,
            ftype,
        });
    }

    if instrument.is_empty() || serial.is_empty() {
        return Err(SasError::Calibration(format!(
            "{name}: missing INSTRUMENT or SN row"
        )));
    }

    let header = format!("{instrument}{serial}").into_bytes();
    let frame_len = fields.iter().map(|f| f.len).sum();

    // Dominant optical group decides Lt vs Li vs Es.
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for field in &fields {
        if matches!(field.kind.as_str(), "LT" | "LI" | "ES") {
            *counts.entry(field.kind.as_str()).or_default() += 1;
        }
    }
    let core_group = counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(g, _)| g.to_string())
        .unwrap_or_default();

    let channel = classify(&instrument, &core_group).ok_or_else(|| {
        SasError::Calibration(format!(
            "{name}: unable to find the role of frame header {instrument}{serial}"
        ))
    })?;

    let wavelengths = fields
        .iter()
        .filter(|f| !core_group.is_empty() && f.kind == core_group)
        .filter_map(|f| f.id.parse::<f64>().ok())
        .collect();

    Ok(CalEntry {
        header,
        channel,
        fields,
        frame_len,
        core_group,
        wavelengths,
    })
}

fn classify(instrument: &str, core_group: &str) -> Option<Channel> {
    if instrument.contains("SATTHS") {
        return Some(Channel::Ths);
    }
    match (core_group, instrument) {
        ("LT", i) if i.contains("SATHSL") => Some(Channel::Lt),
        ("LI", i) if i.contains("SATHSL") => Some(Channel::Li),
        ("ES", i) if i.contains("SATHSE") => Some(Channel::Es),
        ("LT", i) if i.contains("SATHLD") => Some(Channel::LtDark),
        ("LI", i) if i.contains("SATHLD") => Some(Channel::LiDark),
        ("ES", i) if i.contains("SATHED") => Some(Channel::EsDark),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A three-pixel radiance head calibration, as text.
    pub fn radiance_cal(instrument: &str, serial: &str, group: &str) -> String {
        format!(
            "# {instrument}{serial} test head\n\
             INSTRUMENT {instrument} '' 6 AS 0 NONE\n\
             SN {serial} '' 4 AS 0 NONE\n\
             INTTIME {group} 'sec' 2 BU 0 COUNT\n\
             {group} 380.30 'uW/cm^2/nm/sr' 2 BU 1 OPTIC3\n\
             2000.0 1.0 1.0\n\
             {group} 412.50 'uW/cm^2/nm/sr' 2 BU 1 OPTIC3\n\
             2000.0 1.0 1.0\n\
             {group} 442.10 'uW/cm^2/nm/sr' 2 BU 1 OPTIC3\n\
             2000.0 1.0 1.0\n\
             CHECK SUM '' 1 BU 0 NONE\n\
             CRLF TERMINATOR '' 2 AS 0 NONE\n"
        )
    }

    pub fn ths_cal(serial: &str) -> String {
        format!(
            "INSTRUMENT SATTHS '' 6 AS 0 NONE\n\
             SN {serial} '' 4 AS 0 NONE\n\
             ROLL NONE 'degrees' 8 AF 1 POLYU\n\
             0 1\n\
             PITCH NONE 'degrees' 8 AF 1 POLYU\n\
             0 1\n\
             COMP NONE 'degrees' 8 AF 1 POLYU\n\
             0 1\n\
             CRLF TERMINATOR '' 2 AS 0 NONE\n"
        )
    }

    /// The standard test table: Lt + Lt dark + Es + THS.
    pub fn test_calibration() -> Calibration {
        let entries = vec![
            super::parse_cal_text("HSL0234.cal", &radiance_cal("SATHSL", "0234", "LT")).unwrap(),
            super::parse_cal_text("HLD0234.cal", &radiance_cal("SATHLD", "0234", "LT")).unwrap(),
            super::parse_cal_text("HSL0235.cal", &radiance_cal("SATHSL", "0235", "LI")).unwrap(),
            super::parse_cal_text("HSE0237.cal", &radiance_cal("SATHSE", "0237", "ES")).unwrap(),
            super::parse_cal_text("THS0046.cal", &ths_cal("0046")).unwrap(),
        ];
        Calibration::from_entries(entries, false)
    }

    /// A 21-byte radiance frame with the given pixel counts.
    pub fn radiance_frame(header: &[u8], inttime: u16, pixels: [u16; 3]) -> Vec<u8> {
        let mut frame = header.to_vec();
        frame.extend_from_slice(&inttime.to_be_bytes());
        for px in pixels {
            frame.extend_from_slice(&px.to_be_bytes());
        }
        frame.push(0x00); // checksum placeholder
        frame.extend_from_slice(b"\r\n");
        frame
    }

    /// A THS frame with fixed-width ASCII fields.
    pub fn ths_frame(roll: f64, pitch: f64, compass: f64) -> Vec<u8> {
        let mut frame = b"SATTHS0046".to_vec();
        frame.extend_from_slice(format!("{roll:8.2}").as_bytes());
        frame.extend_from_slice(format!("{pitch:8.2}").as_bytes());
        frame.extend_from_slice(format!("{compass:8.2}").as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame
    }
}
