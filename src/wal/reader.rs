//! WAL Reader
//!
//! Handles reading entries from the WAL file.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::entry::{WalEntry, HEADER_SIZE};
use crate::error::{LsmError, Result};

/// Reads entries from the WAL file
pub struct WalReader {
    reader: BufReader<File>,
    /// Offset just past the last entry successfully read
    position: u64,
    last_lsn: u64,
}

/// Fill `buf` from `reader`, returning how many bytes arrived before EOF
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            last_lsn: 0,
        })
    }

    /// Read the next entry from the WAL
    ///
    /// Returns `Ok(None)` at a clean end of file and `WalCorruption` for a
    /// torn or damaged frame.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let mut header = [0u8; HEADER_SIZE];
        let got = read_up_to(&mut self.reader, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_SIZE {
            return Err(LsmError::WalCorruption(format!(
                "Torn header at offset {}: {} of {} bytes",
                self.position, got, HEADER_SIZE
            )));
        }

        let (lsn, crc, len) = WalEntry::parse_header(&header)?;
        let mut data = vec![0u8; len as usize];
        let got = read_up_to(&mut self.reader, &mut data)?;
        if got < data.len() {
            return Err(LsmError::WalCorruption(format!(
                "Torn entry at offset {}: {} of {} data bytes",
                self.position,
                got,
                data.len()
            )));
        }

        let entry = WalEntry::decode_data(lsn, crc, &data)?;
        if entry.lsn <= self.last_lsn {
            return Err(LsmError::WalCorruption(format!(
                "LSN went backwards at offset {}: {} after {}",
                self.position, entry.lsn, self.last_lsn
            )));
        }

        self.last_lsn = entry.lsn;
        self.position += (HEADER_SIZE + data.len()) as u64;
        Ok(Some(entry))
    }

    /// Offset just past the last valid entry
    pub fn position(&self) -> u64 {
        self.position
    }

    /// LSN of the last valid entry (0 if none)
    pub fn last_lsn(&self) -> u64 {
        self.last_lsn
    }

    /// Iterate over all valid entries
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL entries; stops after the first error
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
