//! Lookup of a document line by 1-based number.
//!
//! Line terminators (`\n`, `\r\n`) are not part of a line, and a final line
//! without a terminator still counts.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use super::errors::{MailboxError, Result};

pub trait LineSource {
    /// Number of lines in the document.
    fn line_count(&self) -> usize;

    /// The line at `number` (1-based), `None` when out of range.
    fn line(&self, number: usize) -> Result<Option<Vec<u8>>>;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineSourceKind {
    /// Reopen the document and scan it on every lookup.
    Scan,
    /// Load the document once and keep line offsets.
    #[default]
    Indexed,
}

pub fn open(kind: LineSourceKind, path: impl AsRef<Path>) -> Result<Box<dyn LineSource + Send + Sync>> {
    Ok(match kind {
        LineSourceKind::Scan => Box::new(ScanningLineSource::open(path)?),
        LineSourceKind::Indexed => Box::new(IndexedLineSource::open(path)?),
    })
}

fn trim_terminator(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
}

fn next_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, path: &Path) -> Result<bool> {
    buf.clear();
    let n = reader
        .read_until(b'\n', buf)
        .map_err(|e| MailboxError::line_source(path, e))?;
    Ok(n > 0)
}

pub struct ScanningLineSource {
    path: PathBuf,
    line_count: usize,
}

impl ScanningLineSource {
    pub fn open(path: impl AsRef<Path>) -> Result<ScanningLineSource> {
        let path = path.as_ref().to_path_buf();
        let mut reader = Self::reader(&path)?;
        let mut buf = Vec::new();
        let mut line_count = 0;
        while next_line(&mut reader, &mut buf, &path)? {
            line_count += 1;
        }
        Ok(ScanningLineSource { path, line_count })
    }

    fn reader(path: &Path) -> Result<BufReader<File>> {
        let file = File::open(path).map_err(|e| MailboxError::line_source(path, e))?;
        Ok(BufReader::new(file))
    }
}

impl LineSource for ScanningLineSource {
    fn line_count(&self) -> usize {
        self.line_count
    }

    fn line(&self, number: usize) -> Result<Option<Vec<u8>>> {
        if number == 0 {
            return Ok(None);
        }
        let mut reader = Self::reader(&self.path)?;
        let mut buf = Vec::new();
        let mut current = 0;
        while next_line(&mut reader, &mut buf, &self.path)? {
            current += 1;
            if current == number {
                trim_terminator(&mut buf);
                return Ok(Some(buf));
            }
        }
        Ok(None)
    }
}

pub struct IndexedLineSource {
    contents: Vec<u8>,
    lines: Vec<Range<usize>>,
}

impl IndexedLineSource {
    pub fn open(path: impl AsRef<Path>) -> Result<IndexedLineSource> {
        let path = path.as_ref();
        let contents = fs::read(path).map_err(|e| MailboxError::line_source(path, e))?;
        Ok(IndexedLineSource::from_bytes(contents))
    }

    pub fn from_bytes(contents: Vec<u8>) -> IndexedLineSource {
        let mut lines = Vec::new();
        let mut start = 0;
        for (i, &b) in contents.iter().enumerate() {
            if b == b'\n' {
                let end = if i > start && contents[i - 1] == b'\r' { i - 1 } else { i };
                lines.push(start..end);
                start = i + 1;
            }
        }
        if start < contents.len() {
            lines.push(start..contents.len());
        }
        IndexedLineSource { contents, lines }
    }
}

impl LineSource for IndexedLineSource {
    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn line(&self, number: usize) -> Result<Option<Vec<u8>>> {
        Ok(number
            .checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(|range| self.contents[range.clone()].to_vec()))
    }
}
