//! Per-era column layouts
//!
//! The publisher changed file formats several times. Rather than branching in
//! the parse loop, each format is described once in [`LAYOUTS`] and selected
//! by dataset family and period.

use csv::ByteRecord;
use tradedata_common::{Dataset, Period};

use crate::error::{IngestError, Result};

/// How a field is located in a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Col {
    /// Zero-based position, for files without a header row
    Index(usize),
    /// Accepted header names, compared ignoring case and punctuation
    Names(&'static [&'static str]),
}

/// Which dataset families a layout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Non-EU exports and imports
    NonEu,
    /// EU dispatches and arrivals
    Eu,
    All,
}

impl Scope {
    fn covers(self, dataset: Dataset) -> bool {
        match self {
            Scope::NonEu => !dataset.is_eu(),
            Scope::Eu => dataset.is_eu(),
            Scope::All => true,
        }
    }
}

/// Declarative description of one file format era
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub name: &'static str,
    pub scope: Scope,
    /// First (year, month) the layout applies to
    pub from: (i32, u32),
    /// Last (year, month) the layout applies to, inclusive
    pub until: Option<(i32, u32)>,
    pub delimiter: u8,
    pub has_header: bool,
    pub quoting: bool,
    pub commodity: Col,
    pub partner: Col,
    /// When absent, rows inherit the release period
    pub period: Option<Col>,
    pub value: Col,
    pub net_mass: Option<Col>,
    pub quantity: Option<Col>,
    pub unit: Option<Col>,
}

const COMMODITY_NAMES: &[&str] = &["COMCODE", "COMMODITY", "COMMODITY_CODE", "CN8"];
// Code columns before name columns: a file may carry both
const PARTNER_NAMES: &[&str] = &[
    "COD-ALPHA",
    "COUNTRY_CODE",
    "PARTNER_COUNTRY",
    "PARTNER",
    "COUNTRY",
];
const PERIOD_NAMES: &[&str] = &["ACCOUNT-PERIOD", "PERIOD", "MONTH", "MONTH_ID"];
const VALUE_NAMES: &[&str] = &["VALUE", "STAT-VALUE", "TRADE_VALUE", "VALUE_GBP"];
const NET_MASS_NAMES: &[&str] = &["NET-MASS", "NET_MASS"];
const QUANTITY_NAMES: &[&str] = &["SUPP-UNIT", "SUPP_UNIT", "SUPPLEMENTARY_UNIT", "QUANTITY"];
const UNIT_NAMES: &[&str] = &["UNIT", "UNIT_CODE", "SUPP-UNIT-CODE"];

/// Known formats, most specific first
pub static LAYOUTS: &[ColumnLayout] = &[
    ColumnLayout {
        name: "non-eu-legacy",
        scope: Scope::NonEu,
        from: (1900, 1),
        until: Some((2015, 12)),
        delimiter: b'|',
        has_header: false,
        quoting: false,
        commodity: Col::Index(0),
        partner: Col::Index(4),
        period: Some(Col::Index(5)),
        value: Col::Index(10),
        net_mass: Some(Col::Index(11)),
        quantity: Some(Col::Index(12)),
        unit: None,
    },
    ColumnLayout {
        name: "eu-legacy",
        scope: Scope::Eu,
        from: (1900, 1),
        until: Some((2015, 12)),
        delimiter: b'|',
        has_header: false,
        quoting: false,
        commodity: Col::Index(0),
        partner: Col::Index(4),
        period: Some(Col::Index(2)),
        value: Col::Index(7),
        net_mass: Some(Col::Index(8)),
        quantity: Some(Col::Index(9)),
        unit: None,
    },
    ColumnLayout {
        name: "pipe-header",
        scope: Scope::All,
        from: (2016, 1),
        until: Some((2020, 12)),
        delimiter: b'|',
        has_header: true,
        quoting: false,
        commodity: Col::Names(COMMODITY_NAMES),
        partner: Col::Names(PARTNER_NAMES),
        period: Some(Col::Names(PERIOD_NAMES)),
        value: Col::Names(VALUE_NAMES),
        net_mass: Some(Col::Names(NET_MASS_NAMES)),
        quantity: Some(Col::Names(QUANTITY_NAMES)),
        unit: Some(Col::Names(UNIT_NAMES)),
    },
    ColumnLayout {
        name: "csv",
        scope: Scope::All,
        from: (2021, 1),
        until: None,
        delimiter: b',',
        has_header: true,
        quoting: true,
        commodity: Col::Names(COMMODITY_NAMES),
        partner: Col::Names(PARTNER_NAMES),
        period: Some(Col::Names(PERIOD_NAMES)),
        value: Col::Names(VALUE_NAMES),
        net_mass: Some(Col::Names(NET_MASS_NAMES)),
        quantity: Some(Col::Names(QUANTITY_NAMES)),
        unit: Some(Col::Names(UNIT_NAMES)),
    },
];

impl ColumnLayout {
    pub fn applies_to(&self, dataset: Dataset, period: Period) -> bool {
        let key = (period.year(), period.month());
        self.scope.covers(dataset) && key >= self.from && self.until.map_or(true, |until| key <= until)
    }

    /// Resolve every column to a position, using the header row when the layout has one
    pub fn resolve(&self, header: Option<&ByteRecord>) -> Result<ResolvedColumns> {
        let headers = match header {
            Some(record) => Some(decode_header(record)?),
            None => None,
        };
        let headers = headers.as_deref();

        Ok(ResolvedColumns {
            commodity: self.required(self.commodity, headers, "commodity")?,
            partner: self.required(self.partner, headers, "partner country")?,
            period: self.optional(self.period, headers),
            value: self.required(self.value, headers, "value")?,
            net_mass: self.optional(self.net_mass, headers),
            quantity: self.optional(self.quantity, headers),
            unit: self.optional(self.unit, headers),
        })
    }

    fn required(&self, col: Col, headers: Option<&[String]>, what: &str) -> Result<usize> {
        locate(col, headers).ok_or_else(|| {
            IngestError::MalformedInput(format!(
                "{} layout: no {} column in header {:?}",
                self.name,
                what,
                headers.unwrap_or_default()
            ))
        })
    }

    fn optional(&self, col: Option<Col>, headers: Option<&[String]>) -> Option<usize> {
        col.and_then(|col| locate(col, headers))
    }
}

/// Layout for a dataset family and period
pub fn layout_for(dataset: Dataset, period: Period) -> Option<&'static ColumnLayout> {
    LAYOUTS.iter().find(|layout| layout.applies_to(dataset, period))
}

/// Column positions for one member file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub commodity: usize,
    pub partner: usize,
    pub period: Option<usize>,
    pub value: usize,
    pub net_mass: Option<usize>,
    pub quantity: Option<usize>,
    pub unit: Option<usize>,
}

fn locate(col: Col, headers: Option<&[String]>) -> Option<usize> {
    match col {
        Col::Index(index) => Some(index),
        Col::Names(names) => {
            let headers = headers?;
            names.iter().find_map(|name| {
                let wanted = normalize_header(name);
                headers.iter().position(|header| *header == wanted)
            })
        },
    }
}

fn decode_header(record: &ByteRecord) -> Result<Vec<String>> {
    record
        .iter()
        .map(|field| {
            std::str::from_utf8(field)
                .map(normalize_header)
                .map_err(|_| IngestError::MalformedInput("header row is not valid UTF-8".to_string()))
        })
        .collect()
}

/// Uppercase, alphanumerics only, byte-order mark dropped
fn normalize_header(name: &str) -> String {
    name.trim_start_matches('\u{feff}')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn period(s: &str) -> Period {
        s.parse().unwrap()
    }

    #[test]
    fn test_layout_selection_by_era() {
        assert_eq!(layout_for(Dataset::NonEuExports, period("2015-12")).unwrap().name, "non-eu-legacy");
        assert_eq!(layout_for(Dataset::EuArrivals, period("2012-06")).unwrap().name, "eu-legacy");
        assert_eq!(layout_for(Dataset::EuArrivals, period("2016-01")).unwrap().name, "pipe-header");
        assert_eq!(layout_for(Dataset::NonEuImports, period("2020-12")).unwrap().name, "pipe-header");
        assert_eq!(layout_for(Dataset::NonEuImports, period("2021-01")).unwrap().name, "csv");
    }

    #[test]
    fn test_every_dataset_and_era_has_a_layout() {
        for dataset in Dataset::ALL {
            for p in ["1995-01", "2015-12", "2016-01", "2020-12", "2021-01", "2030-06"] {
                assert!(layout_for(dataset, period(p)).is_some(), "{} {}", dataset, p);
            }
        }
    }

    #[test]
    fn test_resolve_named_columns_in_any_order() {
        let layout = layout_for(Dataset::NonEuImports, period("2022-03")).unwrap();
        let header = ByteRecord::from(vec![
            "\u{feff}Value", "Period", "CountryCode", "CommodityCode", "NetMass",
        ]);
        let columns = layout.resolve(Some(&header)).unwrap();
        assert_eq!(columns.value, 0);
        assert_eq!(columns.period, Some(1));
        assert_eq!(columns.partner, 2);
        assert_eq!(columns.commodity, 3);
        assert_eq!(columns.net_mass, Some(4));
        assert_eq!(columns.quantity, None);
    }

    #[test]
    fn test_partner_prefers_code_column_over_name() {
        let layout = layout_for(Dataset::NonEuImports, period("2022-03")).unwrap();
        let header = ByteRecord::from(vec![
            "CommodityCode", "Country", "CountryCode", "Period", "Value",
        ]);
        let columns = layout.resolve(Some(&header)).unwrap();
        assert_eq!(columns.partner, 2);

        let header = ByteRecord::from(vec!["Comcode", "Partner", "Partner_Country", "Value"]);
        assert_eq!(layout.resolve(Some(&header)).unwrap().partner, 2);
    }

    #[test]
    fn test_resolve_rejects_unexpected_schema() {
        let layout = layout_for(Dataset::NonEuImports, period("2022-03")).unwrap();
        let header = ByteRecord::from(vec!["Name", "Description"]);
        let err = layout.resolve(Some(&header)).unwrap_err();
        assert!(matches!(err, IngestError::MalformedInput(_)));
    }

    #[test]
    fn test_positional_layout_needs_no_header() {
        let layout = layout_for(Dataset::EuDispatches, period("2014-04")).unwrap();
        let columns = layout.resolve(None).unwrap();
        assert_eq!(columns.commodity, 0);
        assert_eq!(columns.period, Some(2));
        assert_eq!(columns.value, 7);
    }
}
