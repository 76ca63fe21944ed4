//! Archive parsing
//!
//! [`Parser::parse`] opens a downloaded archive, keeps the members for the
//! release month, selects the column layout for the release's dataset and
//! period, and returns a lazy [`RecordStream`].
//!
//! Row-level problems (unknown codes, unparseable numbers, rows from another
//! period) are routed to the [`SkippedRecords`] channel and parsing continues.
//! Only structural problems end the stream with
//! [`IngestError::MalformedInput`]: an unreadable archive, a missing header
//! column, a non-UTF-8 header.
//!
//! Parsing is blocking I/O and CPU work; run it on a blocking thread.

pub mod archive;
pub mod codes;
pub mod layout;

pub use codes::CodeSets;
pub use layout::{layout_for, Col, ColumnLayout, ResolvedColumns, Scope, LAYOUTS};

use bigdecimal::BigDecimal;
use csv::ByteRecord;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use tradedata_common::{Dataset, Period, TradeFlow};

use crate::error::{IngestError, Result};
use crate::models::{DownloadArtifact, ReleaseId, SkippedRecord, SkippedRecords, TradeRecord};
use archive::{Member, ScratchDir};

/// Decodes downloaded archives into trade records
#[derive(Debug, Clone, Default)]
pub struct Parser {
    codes: Arc<CodeSets>,
}

impl Parser {
    pub fn new(codes: Arc<CodeSets>) -> Self {
        Self { codes }
    }

    /// Open `artifact` and return a stream over its records.
    ///
    /// The archive is extracted next to the artifact; the scratch files are
    /// removed when the stream is dropped. Restart by calling `parse` again.
    pub fn parse(&self, artifact: &DownloadArtifact, skipped: &SkippedRecords) -> Result<RecordStream> {
        let layout = layout_for(artifact.dataset, artifact.period).ok_or_else(|| {
            IngestError::MalformedInput(format!(
                "No column layout for {} {}",
                artifact.dataset, artifact.period
            ))
        })?;

        let mut scratch = artifact.path.clone().into_os_string();
        scratch.push(".extracted");
        let (scratch, members) = archive::extract(&artifact.path, scratch.into())?;
        let members = archive::select_members(members, artifact.dataset.prefix(), &artifact.period.yymm())?;

        info!(
            release = %artifact.release_id,
            layout = layout.name,
            members = members.len(),
            "Parsing archive"
        );

        let mut stream = RecordStream {
            context: RowContext {
                release_id: artifact.release_id.clone(),
                period: artifact.period,
                flow: artifact.dataset.flow(),
                codes: self.codes.clone(),
            },
            dataset: artifact.dataset,
            layout,
            skipped: skipped.clone(),
            members: members.into(),
            current: None,
            finished: false,
            _scratch: scratch,
        };

        // Validate the first member's structure before handing the stream out
        stream.open_next()?;
        Ok(stream)
    }
}

struct RowContext {
    release_id: ReleaseId,
    period: Period,
    flow: TradeFlow,
    codes: Arc<CodeSets>,
}

struct MemberCursor {
    name: String,
    reader: csv::Reader<BufReader<File>>,
    columns: ResolvedColumns,
    row: ByteRecord,
    line: u64,
}

/// Lazy sequence of records from one archive
pub struct RecordStream {
    context: RowContext,
    dataset: Dataset,
    layout: &'static ColumnLayout,
    skipped: SkippedRecords,
    members: VecDeque<Member>,
    current: Option<MemberCursor>,
    finished: bool,
    _scratch: ScratchDir,
}

impl RecordStream {
    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    /// Open the next member; `Ok(false)` when none remain
    fn open_next(&mut self) -> Result<bool> {
        let Some(member) = self.members.pop_front() else {
            return Ok(false);
        };

        let file = File::open(&member.path)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.layout.delimiter)
            .has_headers(self.layout.has_header)
            .quoting(self.layout.quoting)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(BufReader::new(file));

        let columns = if self.layout.has_header {
            let header = reader
                .byte_headers()
                .map_err(|e| IngestError::MalformedInput(format!("{}: {}", member.name, e)))?
                .clone();
            self.layout
                .resolve(Some(&header))
                .map_err(|e| IngestError::MalformedInput(format!("{}: {}", member.name, e)))?
        } else {
            self.layout.resolve(None)?
        };

        debug!(member = %member.name, ?columns, "Opened member");
        self.current = Some(MemberCursor {
            name: member.name,
            reader,
            columns,
            row: ByteRecord::new(),
            line: u64::from(self.layout.has_header),
        });
        Ok(true)
    }

    fn fail(&mut self, err: IngestError) -> Option<Result<TradeRecord>> {
        self.finished = true;
        self.current = None;
        Some(Err(err))
    }
}

impl Iterator for RecordStream {
    type Item = Result<TradeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if self.current.is_none() {
                match self.open_next() {
                    Ok(true) => {},
                    Ok(false) => {
                        self.finished = true;
                        return None;
                    },
                    Err(e) => return self.fail(e),
                }
            }

            let Some(cursor) = self.current.as_mut() else {
                continue;
            };

            match cursor.reader.read_byte_record(&mut cursor.row) {
                Ok(true) => {
                    cursor.line += 1;
                    if cursor.row.iter().all(<[u8]>::is_empty) {
                        continue;
                    }
                    match decode_row(&cursor.row, &cursor.columns, &self.context) {
                        Ok(record) => return Some(Ok(record)),
                        Err(reason) => {
                            debug!(member = %cursor.name, line = cursor.line, %reason, "Skipping row");
                            self.skipped.push(SkippedRecord {
                                release_id: self.context.release_id.clone(),
                                source: cursor.name.clone(),
                                line: cursor.line,
                                reason,
                                raw: render_raw(&cursor.row, self.layout.delimiter),
                            });
                        },
                    }
                },
                Ok(false) => {
                    self.current = None;
                },
                Err(e) => {
                    let err = IngestError::MalformedInput(format!(
                        "{}: unreadable at line {}: {}",
                        cursor.name,
                        cursor.line + 1,
                        e
                    ));
                    return self.fail(err);
                },
            }
        }
    }
}

/// Decode one row; `Err` carries the reason it was skipped
fn decode_row(row: &ByteRecord, columns: &ResolvedColumns, ctx: &RowContext) -> std::result::Result<TradeRecord, String> {
    let raw_commodity = field(row, columns.commodity)?;
    let commodity_code = ctx
        .codes
        .normalize_commodity(raw_commodity)
        .ok_or_else(|| format!("unrecognized commodity code '{}'", raw_commodity))?;

    let raw_partner = field(row, columns.partner)?;
    let partner_country = ctx
        .codes
        .normalize_country(raw_partner)
        .ok_or_else(|| format!("unrecognized partner country '{}'", raw_partner))?;

    let period = match columns.period {
        Some(index) => {
            let raw = field(row, index)?;
            Period::from_str(raw).map_err(|_| format!("invalid period '{}'", raw))?
        },
        None => ctx.period,
    };
    if period != ctx.period {
        return Err(format!("period {} outside release period {}", period, ctx.period));
    }

    let raw_value = field(row, columns.value)?;
    let value = parse_decimal(raw_value).ok_or_else(|| format!("invalid value '{}'", raw_value))?;

    Ok(TradeRecord {
        period,
        commodity_code,
        flow: ctx.flow,
        partner_country,
        value,
        net_mass: optional_decimal(row, columns.net_mass, "net mass")?,
        quantity: optional_decimal(row, columns.quantity, "quantity")?,
        unit: match columns.unit {
            Some(index) => Some(field(row, index)?).filter(|u| !u.is_empty()).map(str::to_string),
            None => None,
        },
    })
}

fn field(row: &ByteRecord, index: usize) -> std::result::Result<&str, String> {
    let bytes = row
        .get(index)
        .ok_or_else(|| format!("row has {} fields, expected at least {}", row.len(), index + 1))?;
    std::str::from_utf8(bytes)
        .map(str::trim)
        .map_err(|_| format!("field {} is not valid UTF-8", index + 1))
}

fn optional_decimal(row: &ByteRecord, index: Option<usize>, what: &str) -> std::result::Result<Option<BigDecimal>, String> {
    let Some(index) = index else {
        return Ok(None);
    };
    // Short rows simply lack trailing optional fields
    let Some(bytes) = row.get(index) else {
        return Ok(None);
    };
    let raw = std::str::from_utf8(bytes)
        .map_err(|_| format!("field {} is not valid UTF-8", index + 1))?
        .trim();
    if raw.is_empty() {
        return Ok(None);
    }
    parse_decimal(raw)
        .map(Some)
        .ok_or_else(|| format!("invalid {} '{}'", what, raw))
}

/// Exact decimal parse; thousands separators are ignored
pub fn parse_decimal(raw: &str) -> Option<BigDecimal> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

fn render_raw(row: &ByteRecord, delimiter: u8) -> String {
    let separator = char::from(delimiter).to_string();
    row.iter()
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(&separator)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::path::Path;
    use tradedata_common::checksum::{Checksum, ChecksumAlgorithm};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn artifact_with(dir: &Path, dataset: Dataset, period: &str, members: &[(&str, &str)]) -> DownloadArtifact {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();

        let period: Period = period.parse().unwrap();
        let release_id = ReleaseId::for_dataset(dataset, period);
        let path = dir.join(format!("{}.zip", release_id));
        std::fs::write(&path, &bytes).unwrap();

        DownloadArtifact {
            release_id,
            dataset,
            period,
            size: bytes.len() as u64,
            checksum: Checksum::of_file(&path, ChecksumAlgorithm::Sha256).unwrap(),
            path,
            complete: true,
        }
    }

    #[test]
    fn test_pipe_header_era() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_with(
            dir.path(),
            Dataset::EuArrivals,
            "2020-01",
            &[(
                "SMKM462001",
                "COMCODE|COD-ALPHA|ACCOUNT-PERIOD|VALUE|NET-MASS|SUPP-UNIT|UNIT\n\
                 010121|FR|01/2020|100.00|250|3|NAR\n\
                 1012900|de|2020/01|1,234.567||| \n",
            )],
        );

        let skipped = SkippedRecords::new();
        let records: Vec<TradeRecord> = Parser::default()
            .parse(&artifact, &skipped)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!(skipped.is_empty());

        let first = &records[0];
        assert_eq!(first.commodity_code, "010121");
        assert_eq!(first.partner_country, "FR");
        assert_eq!(first.flow, TradeFlow::Import);
        assert_eq!(first.value.to_string(), "100.00");
        assert_eq!(first.net_mass, Some(BigDecimal::from(250)));
        assert_eq!(first.unit.as_deref(), Some("NAR"));

        let second = &records[1];
        assert_eq!(second.commodity_code, "01012900");
        assert_eq!(second.partner_country, "DE");
        assert_eq!(second.value, BigDecimal::from_str("1234.567").unwrap());
        assert_eq!(second.net_mass, None);
        assert_eq!(second.unit, None);
    }

    #[test]
    fn test_legacy_positional_era() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_with(
            dir.path(),
            Dataset::NonEuExports,
            "2014-03",
            &[("SMKE191403", "84713000|0|0|0|US|03/2014|0|0|0|0|5000.10|12|1\n")],
        );

        let skipped = SkippedRecords::new();
        let records: Vec<TradeRecord> = Parser::default()
            .parse(&artifact, &skipped)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].flow, TradeFlow::Export);
        assert_eq!(records[0].partner_country, "US");
        assert_eq!(records[0].quantity, Some(BigDecimal::from(1)));
    }

    #[test]
    fn test_bad_rows_go_to_side_channel() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_with(
            dir.path(),
            Dataset::NonEuImports,
            "2021-06",
            &[(
                "imports.csv",
                "CommodityCode,CountryCode,Period,Value\n\
                 01012100,CN,2021-06,10.5\n\
                 01012100,??,2021-06,11\n\
                 01012100,US,2021-05,12\n\
                 ABC,US,2021-06,13\n\
                 01012100,JP,2021-06,lots\n\
                 01012100,\"KR\",202106,\"1,000.25\"\n",
            )],
        );

        let skipped = SkippedRecords::new();
        let records: Vec<TradeRecord> = Parser::default()
            .parse(&artifact, &skipped)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, BigDecimal::from_str("1000.25").unwrap());
        assert_eq!(skipped.len(), 4);

        let reasons: Vec<String> = skipped.records().into_iter().map(|s| s.reason).collect();
        assert!(reasons[0].contains("partner country"));
        assert!(reasons[1].contains("outside release period"));
        assert!(reasons[2].contains("commodity"));
        assert!(reasons[3].contains("value"));
        assert_eq!(skipped.records()[0].line, 3);
    }

    #[test]
    fn test_commodity_outside_lookup_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_with(
            dir.path(),
            Dataset::NonEuImports,
            "2021-06",
            &[(
                "imports.csv",
                "CommodityCode,CountryCode,Period,Value\n\
                 01012100,CN,2021-06,10.5\n\
                 99999999,US,2021-06,11\n",
            )],
        );
        let codes = CodeSets::builtin()
            .with_commodity_reader("01012100|Pure-bred breeding horses\n".as_bytes())
            .unwrap();

        let skipped = SkippedRecords::new();
        let records: Vec<TradeRecord> = Parser::new(Arc::new(codes))
            .parse(&artifact, &skipped)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].commodity_code, "01012100");
        assert_eq!(skipped.len(), 1);
        assert!(skipped.records()[0].reason.contains("commodity code '99999999'"));
    }

    #[test]
    fn test_unexpected_schema_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_with(
            dir.path(),
            Dataset::NonEuImports,
            "2021-06",
            &[("imports.csv", "Name,Description\nfoo,bar\n")],
        );

        let result = Parser::default().parse(&artifact, &SkippedRecords::new());
        assert!(matches!(result, Err(IngestError::MalformedInput(_))));
    }

    #[test]
    fn test_scratch_files_removed_with_stream() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_with(
            dir.path(),
            Dataset::NonEuImports,
            "2021-06",
            &[("imports.csv", "CommodityCode,CountryCode,Period,Value\n01012100,CN,2021-06,1\n")],
        );

        let stream = Parser::default().parse(&artifact, &SkippedRecords::new()).unwrap();
        let scratch = dir.path().join("smki19-2021-06.zip.extracted");
        assert!(scratch.exists());
        drop(stream);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_parse_decimal_keeps_precision() {
        let value = parse_decimal("105.50").unwrap();
        assert_eq!(value.to_string(), "105.50");
        assert_eq!(parse_decimal("12,345,678.901").unwrap(), BigDecimal::from_str("12345678.901").unwrap());
        assert!(parse_decimal("").is_none());
        assert!(parse_decimal("n/a").is_none());
    }
}
