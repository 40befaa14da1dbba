//! Unit strings as reported by PostgreSQL (`8kB`, `200ms`, `min`, ...).
//!
//! A unit string is an optional numeric multiplier followed by a suffix. The
//! suffix maps to a canonical base unit and a factor; the multiplier scales it.

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UnitError {
    #[error("empty unit string")]
    Empty,
    #[error("invalid multiplier in unit {0:?}")]
    InvalidMultiplier(String),
    #[error("unknown unit suffix {0:?}")]
    UnknownSuffix(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseUnit {
    Bytes,
    Seconds,
}

impl BaseUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseUnit::Bytes => "bytes",
            BaseUnit::Seconds => "seconds",
        }
    }
}

const KB: f64 = 1024.0;

static SUFFIXES: &[(&str, BaseUnit, f64)] = &[
    ("B", BaseUnit::Bytes, 1.0),
    ("kB", BaseUnit::Bytes, KB),
    ("MB", BaseUnit::Bytes, KB * KB),
    ("GB", BaseUnit::Bytes, KB * KB * KB),
    ("TB", BaseUnit::Bytes, KB * KB * KB * KB),
    ("us", BaseUnit::Seconds, 0.000_001),
    ("ms", BaseUnit::Seconds, 0.001),
    ("s", BaseUnit::Seconds, 1.0),
    ("min", BaseUnit::Seconds, 60.0),
    ("h", BaseUnit::Seconds, 3600.0),
    ("d", BaseUnit::Seconds, 86400.0),
];

/// A parsed unit: multiply a raw value by `factor` to get `base` units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    pub base: BaseUnit,
    pub factor: f64,
}

impl Unit {
    pub fn parse(s: &str) -> Result<Unit, UnitError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UnitError::Empty);
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (multiplier, suffix) = s.split_at(split);

        let multiplier = if multiplier.is_empty() {
            1.0
        } else {
            multiplier
                .parse::<f64>()
                .map_err(|_| UnitError::InvalidMultiplier(s.to_string()))?
        };

        let (_, base, factor) = SUFFIXES
            .iter()
            .find(|(name, _, _)| *name == suffix.trim())
            .ok_or_else(|| UnitError::UnknownSuffix(suffix.to_string()))?;

        Ok(Unit {
            base: *base,
            factor: multiplier * factor,
        })
    }

    pub fn normalize(&self, value: f64) -> f64 {
        value * self.factor
    }
}

/// Parses a quantity such as `10s` or `1.5min` into seconds.
pub fn parse_seconds(s: &str) -> Result<f64, UnitError> {
    let unit = Unit::parse(s)?;
    match unit.base {
        BaseUnit::Seconds => Ok(unit.factor),
        BaseUnit::Bytes => Err(UnitError::UnknownSuffix(s.to_string())),
    }
}
