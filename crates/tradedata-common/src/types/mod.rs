//! Common types used across TradeData

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TradeDataError};

// ============================================================================
// Period
// ============================================================================

/// A calendar month for which trade statistics are published.
///
/// Periods order chronologically and render as `YYYY-MM`.
///
/// # Examples
///
/// ```rust
/// use tradedata_common::Period;
///
/// let period: Period = "01/2019".parse().unwrap();
/// assert_eq!(period.to_string(), "2019-01");
/// assert_eq!(period.next().to_string(), "2019-02");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1900..=9999).contains(&year) {
            return Err(TradeDataError::InvalidPeriod(format!("{}-{:02}", year, month)));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// First day of the month, the representation used in the database
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Two-digit year followed by two-digit month, as used in archive file names
    pub fn yymm(&self) -> String {
        format!("{:02}{:02}", self.year.rem_euclid(100), self.month)
    }

    /// All periods from `start` to `end`, inclusive
    pub fn range(start: Period, end: Period) -> impl Iterator<Item = Period> {
        std::iter::successors(Some(start), |p| Some(p.next())).take_while(move |p| *p <= end)
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl std::str::FromStr for Period {
    type Err = TradeDataError;

    /// Accepts `YYYY-MM`, `YYYY/MM`, `MM/YYYY`, `YYYYMM` and `YYYYMMDD`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || TradeDataError::InvalidPeriod(s.to_string());

        let parse_num = |part: &str| -> Result<i64> {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<i64>().map_err(|_| invalid())
        };

        let (year, month) = if let Some((a, b)) = s.split_once(['-', '/']) {
            match (a.len(), b.len()) {
                (4, 1..=2) => (parse_num(a)?, parse_num(b)?),
                (1..=2, 4) => (parse_num(b)?, parse_num(a)?),
                _ => return Err(invalid()),
            }
        } else {
            if !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            match s.len() {
                6 | 8 => (parse_num(&s[..4])?, parse_num(&s[4..6])?),
                _ => return Err(invalid()),
            }
        };

        let year = i32::try_from(year).map_err(|_| invalid())?;
        let month = u32::try_from(month).map_err(|_| invalid())?;
        Period::new(year, month)
    }
}

impl TryFrom<String> for Period {
    type Error = TradeDataError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

// ============================================================================
// Trade flow
// ============================================================================

/// Direction of a trade movement relative to the UK
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeFlow {
    Import,
    Export,
}

impl TradeFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeFlow::Import => "import",
            TradeFlow::Export => "export",
        }
    }
}

impl std::fmt::Display for TradeFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradeFlow {
    type Err = TradeDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "import" | "imports" | "i" | "arrivals" => Ok(TradeFlow::Import),
            "export" | "exports" | "e" | "dispatches" => Ok(TradeFlow::Export),
            other => Err(TradeDataError::InvalidFlow(other.to_string())),
        }
    }
}

// ============================================================================
// Dataset families
// ============================================================================

/// A family of monthly trade files published under a fixed file prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dataset {
    /// Exports to non-EU countries (`SMKE19`)
    NonEuExports,
    /// Imports from non-EU countries (`SMKI19`)
    NonEuImports,
    /// Dispatches to EU member states (`SMKX46`)
    EuDispatches,
    /// Arrivals from EU member states (`SMKM46`)
    EuArrivals,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Dataset::NonEuExports,
        Dataset::NonEuImports,
        Dataset::EuDispatches,
        Dataset::EuArrivals,
    ];

    /// File prefix used by the publisher
    pub fn prefix(&self) -> &'static str {
        match self {
            Dataset::NonEuExports => "SMKE19",
            Dataset::NonEuImports => "SMKI19",
            Dataset::EuDispatches => "SMKX46",
            Dataset::EuArrivals => "SMKM46",
        }
    }

    pub fn flow(&self) -> TradeFlow {
        match self {
            Dataset::NonEuExports | Dataset::EuDispatches => TradeFlow::Export,
            Dataset::NonEuImports | Dataset::EuArrivals => TradeFlow::Import,
        }
    }

    pub fn is_eu(&self) -> bool {
        matches!(self, Dataset::EuDispatches | Dataset::EuArrivals)
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

impl std::str::FromStr for Dataset {
    type Err = TradeDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SMKE19" | "EXPORTS" => Ok(Dataset::NonEuExports),
            "SMKI19" | "IMPORTS" => Ok(Dataset::NonEuImports),
            "SMKX46" | "DISPATCHES" => Ok(Dataset::EuDispatches),
            "SMKM46" | "ARRIVALS" => Ok(Dataset::EuArrivals),
            _ => Err(TradeDataError::UnknownDataset(s.to_string())),
        }
    }
}

impl TryFrom<String> for Dataset {
    type Error = TradeDataError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Dataset> for String {
    fn from(dataset: Dataset) -> Self {
        dataset.prefix().to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_period_formats() {
        let expected = Period::new(2019, 1).unwrap();
        for input in ["2019-01", "2019/01", "01/2019", "1/2019", "201901", "20190101"] {
            assert_eq!(input.parse::<Period>().unwrap(), expected, "input {}", input);
        }
    }

    #[test]
    fn test_period_rejects_garbage() {
        for input in ["", "2019-13", "2019", "19-01", "abcdef", "2019-1a", "00/2019"] {
            assert!(input.parse::<Period>().is_err(), "input {}", input);
        }
    }

    #[test]
    fn test_period_range_and_yymm() {
        let start: Period = "2019-11".parse().unwrap();
        let end: Period = "2020-02".parse().unwrap();
        let periods: Vec<String> = Period::range(start, end).map(|p| p.yymm()).collect();
        assert_eq!(periods, vec!["1911", "1912", "2001", "2002"]);
        assert_eq!(Period::range(end, start).count(), 0);
    }

    #[test]
    fn test_period_serde_as_string() {
        let period: Period = "2020-01".parse().unwrap();
        assert_eq!(period.first_day(), NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert_eq!(Period::from_date(period.first_day()), period);
    }

    #[test]
    fn test_dataset_flow_and_prefix() {
        assert_eq!(Dataset::NonEuExports.flow(), TradeFlow::Export);
        assert_eq!(Dataset::EuDispatches.flow(), TradeFlow::Export);
        assert_eq!(Dataset::NonEuImports.flow(), TradeFlow::Import);
        assert_eq!(Dataset::EuArrivals.flow(), TradeFlow::Import);
        assert_eq!("smkm46".parse::<Dataset>().unwrap(), Dataset::EuArrivals);
        assert_eq!("imports".parse::<Dataset>().unwrap(), Dataset::NonEuImports);
        assert!("SMKA12".parse::<Dataset>().is_err());
    }

    #[test]
    fn test_trade_flow_from_str() {
        assert_eq!("Import".parse::<TradeFlow>().unwrap(), TradeFlow::Import);
        assert_eq!("E".parse::<TradeFlow>().unwrap(), TradeFlow::Export);
        assert!("sideways".parse::<TradeFlow>().is_err());
    }

    proptest! {
        #[test]
        fn prop_period_display_round_trips(year in 1900i32..9999, month in 1u32..=12) {
            let period = Period::new(year, month).unwrap();
            prop_assert_eq!(period.to_string().parse::<Period>().unwrap(), period);
        }
    }
}
