//! Archive extraction
//!
//! Published archives are zip files whose members are either tabular text
//! files or further zip files. Tabular members are extracted to a scratch
//! directory so the parser can stream them one at a time.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{IngestError, Result};

/// Deepest level of zip-inside-zip that is followed
const MAX_NESTING: usize = 4;

/// Member extensions that never hold trade rows
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "htm", "html", "xml"];

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const EMPTY_ZIP_MAGIC: &[u8; 4] = b"PK\x05\x06";

/// One extracted tabular file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Name inside the archive, nested names joined with `/`
    pub name: String,
    pub path: PathBuf,
}

/// Scratch directory removed when dropped
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }
}

/// Extract every tabular member of `archive` into `scratch`.
///
/// A file that is not a zip archive is treated as a single tabular member.
pub fn extract(archive: &Path, scratch: PathBuf) -> Result<(ScratchDir, Vec<Member>)> {
    let dir = ScratchDir::create(scratch)?;
    let mut file = File::open(archive)?;

    let mut magic = [0u8; 4];
    let read = read_prefix(&mut file, &mut magic)?;
    file.rewind()?;

    let display_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut members = Vec::new();
    if read == 4 && (&magic == ZIP_MAGIC || &magic == EMPTY_ZIP_MAGIC) {
        let mut extractor = Extractor {
            dir: dir.path(),
            members: &mut members,
        };
        extractor.walk(BufReader::new(file), "", 0)?;
    } else {
        members.push(Member {
            name: display_name.clone(),
            path: archive.to_path_buf(),
        });
    }

    if members.is_empty() {
        return Err(IngestError::MalformedInput(format!(
            "{}: archive contains no data files",
            display_name
        )));
    }

    debug!(archive = %display_name, members = members.len(), "Archive extracted");
    Ok((dir, members))
}

/// Keep the members named for one month (`{prefix}{yymm}`, any case, at any
/// nesting level).
///
/// Archives whose members carry no month in their names are returned whole.
/// An archive naming other months but not this one has nothing to load.
pub fn select_members(members: Vec<Member>, prefix: &str, yymm: &str) -> Result<Vec<Member>> {
    let months: Vec<Option<String>> = members
        .iter()
        .map(|member| member_month(&member.name, prefix))
        .collect();
    if months.iter().all(Option::is_none) {
        return Ok(members);
    }

    let total = members.len();
    let selected: Vec<Member> = members
        .into_iter()
        .zip(months)
        .filter(|(_, month)| month.as_deref() == Some(yymm))
        .map(|(member, _)| member)
        .collect();

    if selected.is_empty() {
        return Err(IngestError::MalformedInput(format!(
            "archive has no {}{} member among {} files",
            prefix, yymm, total
        )));
    }
    debug!(prefix, yymm, selected = selected.len(), total, "Selected monthly members");
    Ok(selected)
}

/// Month digits following `prefix` in the innermost name that has them
fn member_month(name: &str, prefix: &str) -> Option<String> {
    name.rsplit('/').find_map(|part| {
        let part = part.to_ascii_uppercase();
        let start = part.find(prefix)? + prefix.len();
        let digits = part.get(start..start + 4)?;
        digits.bytes().all(|b| b.is_ascii_digit()).then(|| digits.to_string())
    })
}

struct Extractor<'a> {
    dir: &'a Path,
    members: &'a mut Vec<Member>,
}

impl Extractor<'_> {
    fn walk<R: Read + Seek>(&mut self, reader: R, prefix: &str, depth: usize) -> Result<()> {
        if depth > MAX_NESTING {
            return Err(IngestError::MalformedInput(format!(
                "{}: archives nested deeper than {} levels",
                prefix, MAX_NESTING
            )));
        }

        let mut archive = ZipArchive::new(reader).map_err(|e| malformed(prefix, e))?;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| malformed(prefix, e))?;
            if entry.is_dir() {
                continue;
            }

            let name = if prefix.is_empty() {
                entry.name().to_string()
            } else {
                format!("{}/{}", prefix, entry.name())
            };
            let extension = Path::new(entry.name())
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase());

            match extension.as_deref() {
                Some("zip") => {
                    let mut nested = Vec::new();
                    entry
                        .read_to_end(&mut nested)
                        .map_err(|e| malformed(&name, e))?;
                    drop(entry);
                    self.walk(Cursor::new(nested), &name, depth + 1)?;
                },
                Some(ext) if DOCUMENT_EXTENSIONS.contains(&ext) => {
                    debug!(member = %name, "Skipping non-tabular member");
                },
                _ => {
                    let path = self.dir.join(format!("{:04}.dat", self.members.len()));
                    let mut out = File::create(&path)?;
                    io::copy(&mut entry, &mut out).map_err(|e| malformed(&name, e))?;
                    self.members.push(Member { name, path });
                },
            }
        }
        Ok(())
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8; 4]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn malformed(context: &str, err: impl std::fmt::Display) -> IngestError {
    let context = if context.is_empty() { "archive" } else { context };
    IngestError::MalformedInput(format!("{}: unreadable archive: {}", context, err))
}
