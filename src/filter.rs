//! Station file policy: which files in the watch directory are measurement
//! files, how each one is delimited, and how a data line is parsed.

use std::path::{Path, PathBuf};
use ignore::WalkBuilder;
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationFileKind {
    /// `.csv`: comma separated, first line is a header
    Csv,
    /// `.txt`: semicolon separated, no header
    Text,
}

impl StationFileKind {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("csv") {
            Some(Self::Csv)
        } else if ext.eq_ignore_ascii_case("txt") {
            Some(Self::Text)
        } else {
            None
        }
    }

    pub fn delimiter(self) -> char {
        match self {
            Self::Csv => ',',
            Self::Text => ';',
        }
    }

    pub fn has_header(self) -> bool {
        matches!(self, Self::Csv)
    }

    /// Parse one data line into a measurement. `None` for anything that is not
    /// `station<delim>temperature` with a numeric temperature. Trailing empty
    /// fields are dropped first, so `Hamburg;42.0;` still parses.
    pub fn parse_line(self, line: &str) -> Option<Measurement> {
        let mut fields: Vec<&str> = line.split(self.delimiter()).collect();
        while fields.last().is_some_and(|field| field.is_empty()) {
            fields.pop();
        }
        let &[station, temperature] = fields.as_slice() else {
            return None;
        };
        let (station, temperature) = (station.trim(), temperature.trim());
        if station.is_empty() {
            return None;
        }

        let temperature = temperature.parse::<f64>().ok()?;
        if !temperature.is_finite() {
            return None;
        }

        Some(Measurement {
            station: station.to_string(),
            temperature,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub station: String,
    pub temperature: f64,
}

impl Measurement {
    /// Upper-cased first character of the station name.
    pub fn initial(&self) -> Option<char> {
        self.station.chars().next().and_then(|c| c.to_uppercase().next())
    }

    /// Scan output row: `station;temperature` with one decimal.
    pub fn to_output_line(&self) -> String {
        format!("{};{}\n", self.station, format_one_decimal(self.temperature))
    }
}

/// One decimal place, ties rounded away from zero (`12.25` -> `12.3`).
///
/// Rounding works on the shortest decimal form of the value, so a literal
/// such as `0.15` rounds up even though its binary value is slightly below.
pub fn format_one_decimal(value: f64) -> String {
    if !value.is_finite() {
        return format!("{:.1}", value);
    }

    // Display never uses exponent notation for f64
    let repr = value.abs().to_string();
    let (int_part, frac_part) = repr.split_once('.').unwrap_or((repr.as_str(), ""));
    let mut frac = frac_part.bytes();
    let tenths = frac.next().unwrap_or(b'0');
    let round_up = frac.next().is_some_and(|hundredths| hundredths >= b'5');

    let mut digits: Vec<u8> = int_part.bytes().chain(std::iter::once(tenths)).collect();
    if round_up {
        let mut carry = true;
        for digit in digits.iter_mut().rev() {
            if *digit == b'9' {
                *digit = b'0';
            } else {
                *digit += 1;
                carry = false;
                break;
            }
        }
        if carry {
            digits.insert(0, b'1');
        }
    }

    let split = digits.len() - 1;
    let mut out = String::with_capacity(digits.len() + 2);
    if value.is_sign_negative() {
        out.push('-');
    }
    out.extend(digits[..split].iter().map(|&d| d as char));
    out.push('.');
    out.push(digits[split] as char);
    out
}

pub fn is_station_file<P: AsRef<Path>>(path: P) -> bool {
    StationFileKind::from_path(path).is_some()
}

/// Regular station files directly inside `dir` (no recursion).
pub fn list_station_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }
    let mut files = Vec::new();

    for result in WalkBuilder::new(dir)
        .max_depth(Some(1))
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .build()
    {
        match result {
            Ok(entry) => {
                let is_file = entry.file_type().is_some_and(|ft| ft.is_file());
                if is_file && is_station_file(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            Err(err) => {
                tracing::warn!("Error walking directory {}: {}", dir.display(), err);
            }
        }
    }

    files.sort();
    Ok(files)
}
