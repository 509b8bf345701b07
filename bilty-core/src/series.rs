use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ReservationError, ReservationResult};

/// A branch's GR number book: `prefix` followed by a zero-padded counter in
/// `start..=end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrSeries {
    pub branch_id: Uuid,
    pub prefix: String,
    pub start: u64,
    pub end: u64,
    #[serde(default = "default_width")]
    pub width: usize,
}

pub const MAX_GR_NUMBER: u64 = i64::MAX as u64;

fn default_width() -> usize {
    6
}

impl GrSeries {
    pub fn new(branch_id: Uuid, prefix: impl Into<String>, start: u64, end: u64) -> ReservationResult<Self> {
        let series = Self {
            branch_id,
            prefix: prefix.into(),
            start,
            end,
            width: default_width(),
        };
        series.validate()?;
        Ok(series)
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    pub fn validate(&self) -> ReservationResult<()> {
        validate_prefix(&self.prefix)?;
        if self.start > self.end {
            return Err(ReservationError::InvalidRequest(format!(
                "series {} has start {} after end {}",
                self.prefix, self.start, self.end
            )));
        }
        // Numbers are stored as BIGINT.
        if self.end > MAX_GR_NUMBER {
            return Err(ReservationError::InvalidRequest(format!(
                "series {} ends at {}, above the largest storable number {}",
                self.prefix, self.end, MAX_GR_NUMBER
            )));
        }
        Ok(())
    }

    pub fn format(&self, number: u64) -> String {
        format!("{}{:0width$}", self.prefix, number, width = self.width)
    }

    pub fn parse(&self, gr_no: &str) -> Option<u64> {
        let digits = gr_no.strip_prefix(self.prefix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn contains(&self, number: u64) -> bool {
        number >= self.start && number <= self.end
    }

    pub fn capacity(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }
}

/// Prefixes end up in URLs and GR numbers printed on bilties.
pub fn validate_prefix(prefix: &str) -> ReservationResult<()> {
    if prefix.is_empty() {
        return Err(ReservationError::InvalidRequest("series prefix is empty".into()));
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/')
    {
        return Err(ReservationError::InvalidRequest(format!(
            "series prefix {:?} contains unsupported characters",
            prefix
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let series = GrSeries::new(Uuid::new_v4(), "KOL", 1, 999_999).unwrap();
        assert_eq!(series.format(42), "KOL000042");
        assert_eq!(series.parse("KOL000042"), Some(42));
        assert_eq!(series.parse("DEL000042"), None);
        assert_eq!(series.parse("KOL"), None);
        assert_eq!(series.parse("KOL00a042"), None);

        // Padding never truncates.
        let narrow = series.clone().with_width(2);
        assert_eq!(narrow.format(12345), "KOL12345");
    }

    #[test]
    fn test_validation() {
        let branch = Uuid::new_v4();
        assert!(GrSeries::new(branch, "", 1, 10).is_err());
        assert!(GrSeries::new(branch, "KO L", 1, 10).is_err());
        assert!(GrSeries::new(branch, "KOL", 10, 1).is_err());

        let series = GrSeries::new(branch, "KOL/24-", 10, 19).unwrap();
        assert_eq!(series.capacity(), 10);
        assert!(series.contains(10));
        assert!(series.contains(19));
        assert!(!series.contains(20));
    }

    #[test]
    fn test_numbers_must_fit_a_bigint() {
        let branch = Uuid::new_v4();
        assert!(GrSeries::new(branch, "KOL", 1, u64::MAX).is_err());
        assert!(GrSeries::new(branch, "KOL", 1, MAX_GR_NUMBER + 1).is_err());

        let widest = GrSeries::new(branch, "KOL", 0, MAX_GR_NUMBER).unwrap();
        assert_eq!(widest.capacity(), MAX_GR_NUMBER + 1);

        // Built by hand, bypassing validation: capacity saturates.
        let unchecked = GrSeries {
            branch_id: branch,
            prefix: "KOL".into(),
            start: 0,
            end: u64::MAX,
            width: 6,
        };
        assert_eq!(unchecked.capacity(), u64::MAX);
    }
}
