//! Canonical commodity and country code sets
//!
//! Partner codes come from the built-in ISO list or a country lookup file.
//! Commodity codes are checked for shape, and against a commodity lookup
//! (such as an SMKA12 control file) when one is loaded.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::info;

use crate::error::{IngestError, Result};

/// ISO 3166-1 alpha-2 codes
const ISO_ALPHA2: &str = "\
AD AE AF AG AI AL AM AO AQ AR AS AT AU AW AX AZ \
BA BB BD BE BF BG BH BI BJ BL BM BN BO BQ BR BS BT BV BW BY BZ \
CA CC CD CF CG CH CI CK CL CM CN CO CR CU CV CW CX CY CZ \
DE DJ DK DM DO DZ EC EE EG EH ER ES ET FI FJ FK FM FO FR \
GA GB GD GE GF GG GH GI GL GM GN GP GQ GR GS GT GU GW GY \
HK HM HN HR HT HU ID IE IL IM IN IO IQ IR IS IT JE JM JO JP \
KE KG KH KI KM KN KP KR KW KY KZ LA LB LC LI LK LR LS LT LU LV LY \
MA MC MD ME MF MG MH MK ML MM MN MO MP MQ MR MS MT MU MV MW MX MY MZ \
NA NC NE NF NG NI NL NO NP NR NU NZ OM PA PE PF PG PH PK PL PM PN PR PS PT PW PY \
QA RE RO RS RU RW SA SB SC SD SE SG SH SI SJ SK SL SM SN SO SR SS ST SV SX SY SZ \
TC TD TF TG TH TJ TK TL TM TN TO TR TT TV TW TZ UA UG UM US UY UZ \
VA VC VE VG VI VN VU WF WS YE YT ZA ZM ZW";

/// Publisher-specific partner codes (Kosovo, Ceuta, Melilla, Northern Ireland,
/// ship and aircraft stores, unspecified countries)
const PUBLISHER_CODES: &str = "XK XS XC XL XI QP QQ QR QS QU QV QW QX QY QZ";

/// Valid partner codes plus the three-digit sequence code lookup
#[derive(Debug, Clone)]
pub struct CodeSets {
    countries: HashSet<String>,
    /// Zero-padded sequence code -> alpha-2 code
    sequence: HashMap<String, String>,
    /// Known commodity codes; any well-formed code passes when unset
    commodities: Option<HashSet<String>>,
}

impl Default for CodeSets {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CodeSets {
    /// ISO alpha-2 codes plus publisher codes, no sequence lookup
    pub fn builtin() -> Self {
        let countries = ISO_ALPHA2
            .split_whitespace()
            .chain(PUBLISHER_CODES.split_whitespace())
            .map(str::to_string)
            .collect();
        Self {
            countries,
            sequence: HashMap::new(),
            commodities: None,
        }
    }

    /// Load a country lookup; it replaces the built-in set.
    ///
    /// Columns are read by position (name, alpha-2 code, sequence code) after
    /// one header row, whatever the header calls them.
    pub fn from_lookup_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            IngestError::Config(format!("Cannot open country lookup {}: {}", path.display(), e))
        })?;
        let codes = Self::from_lookup_reader(file)?;
        info!(
            path = %path.display(),
            countries = codes.countries.len(),
            sequence_codes = codes.sequence.len(),
            "Loaded country lookup"
        );
        Ok(codes)
    }

    pub fn from_lookup_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut countries = HashSet::new();
        let mut sequence = HashMap::new();
        for row in csv.records() {
            let row = row.map_err(|e| IngestError::Config(format!("Bad country lookup row: {}", e)))?;
            let code = row.get(1).unwrap_or_default().to_ascii_uppercase();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                continue;
            }
            if let Some(seq) = row.get(2).and_then(pad_sequence) {
                sequence.insert(seq, code.clone());
            }
            countries.insert(code);
        }

        if countries.is_empty() {
            return Err(IngestError::Config("Country lookup contains no codes".to_string()));
        }
        Ok(Self {
            countries,
            sequence,
            commodities: None,
        })
    }

    pub fn is_country(&self, code: &str) -> bool {
        self.countries.contains(code)
    }

    /// Canonical alpha-2 partner code for an alpha-2 or sequence code
    pub fn normalize_country(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.chars().all(|c| c.is_ascii_digit()) {
            let seq = pad_sequence(raw)?;
            return self.sequence.get(&seq).cloned();
        }

        let code = raw.to_ascii_uppercase();
        self.countries.contains(&code).then_some(code)
    }

    /// Restrict commodity codes to those listed in a lookup file
    pub fn with_commodity_lookup(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            IngestError::Config(format!("Cannot open commodity lookup {}: {}", path.display(), e))
        })?;
        let codes = self.with_commodity_reader(file)?;
        info!(
            path = %path.display(),
            commodities = codes.commodities.as_ref().map_or(0, HashSet::len),
            "Loaded commodity lookup"
        );
        Ok(codes)
    }

    /// Read commodity codes from the first column of a pipe or comma
    /// delimited file. Rows whose first field is not a commodity code (headers,
    /// trailers) are ignored. An 8-digit code also admits its 6-digit heading.
    pub fn with_commodity_reader<R: Read>(mut self, reader: R) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        let delimiter = if reader.fill_buf()?.contains(&b'|') { b'|' } else { b',' };

        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut commodities = HashSet::new();
        for row in csv.records() {
            let row = row.map_err(|e| IngestError::Config(format!("Bad commodity lookup row: {}", e)))?;
            let Some(code) = row.get(0).and_then(commodity_shape) else {
                continue;
            };
            if code.len() == 8 {
                commodities.insert(code[..6].to_string());
            }
            commodities.insert(code);
        }

        if commodities.is_empty() {
            return Err(IngestError::Config("Commodity lookup contains no codes".to_string()));
        }
        self.commodities = Some(commodities);
        Ok(self)
    }

    /// Canonical commodity code, or `None` when malformed or not in the
    /// loaded commodity lookup
    pub fn normalize_commodity(&self, raw: &str) -> Option<String> {
        let code = commodity_shape(raw)?;
        match &self.commodities {
            Some(known) if !known.contains(&code) => None,
            _ => Some(code),
        }
    }
}

/// 6-digit HS or 8-digit CN code.
///
/// Codes that lost a leading zero (5 or 7 digits) are padded back.
fn commodity_shape(raw: &str) -> Option<String> {
    let code: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match code.len() {
        6 | 8 => Some(code),
        5 | 7 => Some(format!("0{}", code)),
        _ => None,
    }
}

fn pad_sequence(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > 3 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{:0>3}", raw))
}
