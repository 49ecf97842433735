//! Maps a controller byte offset in a G-code file to a line number and the
//! command text at that offset.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::AgentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePosition {
    /// 1-based count of non-comment lines up to and including the current one.
    pub line_number: u64,
    /// Remainder of the current line from the offset, trimmed.
    pub command: String,
}

/// Forward-scanning cursor over an open G-code file.
///
/// Print offsets only grow during a job, so the cursor remembers where the
/// last lookup landed and scans on from there. A smaller offset rescans
/// from the top.
#[derive(Debug)]
pub struct GcodeCursor {
    path: PathBuf,
    reader: BufReader<File>,
    line_start: u64,
    lines_before: u64,
}

fn is_comment(line: &[u8]) -> bool {
    line.trim_ascii_start().first() == Some(&b';')
}

impl GcodeCursor {
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        let file = File::open(path).map_err(|e| AgentError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line_start: 0,
            lines_before: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn locate(&mut self, position: u64) -> Result<LinePosition, AgentError> {
        if position < self.line_start {
            self.line_start = 0;
            self.lines_before = 0;
        }
        self.reader
            .seek(SeekFrom::Start(self.line_start))
            .map_err(|e| AgentError::io(&self.path, e))?;

        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| AgentError::io(&self.path, e))?;
            if read == 0 {
                // Offset at or past the end: the trailing empty segment counts.
                return Ok(LinePosition {
                    line_number: self.lines_before + 1,
                    command: String::new(),
                });
            }

            let line_end = self.line_start + read as u64;
            let terminated = buf.last() == Some(&b'\n');
            if terminated && line_end <= position {
                if !is_comment(&buf) {
                    self.lines_before += 1;
                }
                self.line_start = line_end;
                continue;
            }

            let split = ((position - self.line_start) as usize).min(buf.len());
            let (prefix, rest) = buf.split_at(split);
            let current = if is_comment(prefix) { 0 } else { 1 };
            return Ok(LinePosition {
                line_number: self.lines_before + current,
                command: String::from_utf8_lossy(rest).trim().to_owned(),
            });
        }
    }
}
