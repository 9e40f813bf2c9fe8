// SPDX-License-Identifier: Apache-2.0

//! Line-oriented reading from a single tailed file.
//!
//! The reader consumes bytes forward from a starting offset and yields only
//! complete lines (byte runs through a terminating LF). Bytes after the last
//! LF are held as a partial remainder and prepended to the first line of the
//! next read, so a committed offset always lands on a line boundary.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

pub struct LineReader {
    reader: BufReader<File>,
    /// Next byte position to read from the file
    pos: u64,
    /// Bytes consumed past the last LF, awaiting their line terminator
    remainder: Vec<u8>,
}

impl LineReader {
    /// Open a file read-only and position it at `offset`.
    pub fn open(path: impl AsRef<Path>, offset: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        Ok(Self {
            reader: BufReader::new(file),
            pos: offset,
            remainder: Vec::new(),
        })
    }

    /// The offset immediately after the last complete line consumed so far.
    /// Remainder bytes sit above this position and are not covered until
    /// their LF arrives.
    pub fn offset(&self) -> u64 {
        self.pos - self.remainder.len() as u64
    }

    /// Read up to `max_lines` complete lines. Returns an empty vector when
    /// no complete line is available (EOF, possibly with a partial line now
    /// held in the remainder).
    ///
    /// Payloads are whitespace-trimmed; the remainder from a previous call
    /// is joined onto the first line read here.
    pub fn read_lines(&mut self, max_lines: usize) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut buf = Vec::new();

        while lines.len() < max_lines {
            buf.clear();
            let n = self.reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            self.pos += n as u64;

            if buf.last() != Some(&b'\n') {
                // no terminator yet, hold until more bytes arrive
                self.remainder.extend_from_slice(&buf);
                break;
            }

            buf.pop();
            let payload = if self.remainder.is_empty() {
                trim_line(&buf)
            } else {
                let mut joined = std::mem::take(&mut self.remainder);
                joined.extend_from_slice(&buf);
                trim_line(&joined)
            };
            lines.push(payload);
        }

        Ok(lines)
    }
}

fn trim_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
