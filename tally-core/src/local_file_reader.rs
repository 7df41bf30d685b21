use anyhow::Result;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use crate::error_bail;

/// Read lines from a list of local files, one file after another.
///
/// Lines are returned as raw bytes without the line terminator. Decoding is left to the
/// caller.
pub struct LocalFileReader {
    filenames: Vec<String>,

    /// Byte offset to start each file from.
    offsets: Vec<u64>,

    reader: Option<BufReader<File>>,

    pos: usize,
}

impl LocalFileReader {
    /// Create a reader for `filenames`.
    ///
    /// If `from_beginning` is false, content already in the files is skipped and only lines
    /// appended later are returned.
    pub fn new(filenames: &[String], from_beginning: bool) -> Result<Self> {
        let mut offsets = Vec::with_capacity(filenames.len());

        // Check if all files exist
        for filename in filenames {
            let path = Path::new(filename);
            if !path.exists() {
                error_bail!("File not found: {}", filename);
            }

            if from_beginning {
                offsets.push(0);
            } else {
                offsets.push(std::fs::metadata(path)?.len());
            }
        }

        Ok(LocalFileReader {
            filenames: filenames.to_vec(),
            offsets,
            reader: None,
            pos: 0,
        })
    }

    fn open_next_file(&mut self) -> Result<bool> {
        if self.pos >= self.filenames.len() {
            return Ok(false);
        }

        let filename = &self.filenames[self.pos];
        let mut file = File::open(Path::new(filename))?;
        file.seek(SeekFrom::Start(self.offsets[self.pos]))?;

        self.pos += 1;
        self.reader = Some(BufReader::new(file));

        Ok(true)
    }

    fn read_line(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            if let Some(reader) = self.reader.as_mut() {
                let mut line = Vec::new();

                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => {}
                    Ok(_) => {
                        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                            line.pop();
                        }

                        return Some(Ok(line));
                    }
                    Err(e) => return Some(Err(e.into())),
                }
            }

            match self.open_next_file() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Iterator for LocalFileReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_line()
    }
}
