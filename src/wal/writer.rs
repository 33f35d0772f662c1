//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::reader::WalReader;
use super::{Operation, WalEntry};
use crate::config::WalSyncStrategy;
use crate::error::{LsmError, Result};

/// Writes entries to the WAL file
pub struct WalWriter {
    path: PathBuf,
    file: File,
    /// File length covering every acknowledged frame
    committed_len: u64,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
    /// LSN the next append will receive
    current_lsn: u64,
    sync_strategy: WalSyncStrategy,
    /// Entries written since the last fsync
    unsynced: usize,
}

impl WalWriter {
    /// Open or create a WAL file
    ///
    /// An existing file is appended to; LSNs continue after its last valid
    /// entry, and a damaged tail is cut off first.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let mut last_lsn = 0;
        if path.exists() {
            let mut reader = WalReader::open(path)?;
            let damaged = loop {
                match reader.next_entry() {
                    Ok(Some(_)) => continue,
                    Ok(None) => break false,
                    Err(_) => break true,
                }
            };
            last_lsn = reader.last_lsn();
            if damaged {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(reader.position())?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            committed_len,
            poisoned: false,
            current_lsn: last_lsn + 1,
            sync_strategy,
            unsynced: 0,
        })
    }

    /// Append an operation to the WAL, returning its LSN
    ///
    /// The frame is handed to the OS before returning; fsync follows the
    /// sync strategy. A failed append leaves no bytes behind and does not
    /// consume its LSN.
    pub fn append(&mut self, operation: Operation) -> Result<u64> {
        if self.poisoned {
            return Err(LsmError::Storage(format!(
                "WAL {} is unusable after a failed rollback",
                self.path.display()
            )));
        }

        let lsn = self.current_lsn;
        let frame = WalEntry::new(lsn, operation).serialize()?;
        let sync_due = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.unsynced + 1 >= count,
        };

        if let Err(e) = self.write_frame(&frame, sync_due) {
            self.roll_back();
            return Err(e);
        }

        self.committed_len += frame.len() as u64;
        self.current_lsn += 1;
        self.unsynced = if sync_due { 0 } else { self.unsynced + 1 };
        Ok(lsn)
    }

    fn write_frame(&mut self, frame: &[u8], sync: bool) -> Result<()> {
        self.file.write_all(frame)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cut the file back to the last acknowledged frame and reopen it
    fn roll_back(&mut self) {
        let result = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_len(self.committed_len))
            .and_then(|_| OpenOptions::new().append(true).open(&self.path));

        match result {
            Ok(file) => {
                self.file = file;
                tracing::warn!(
                    path = %self.path.display(),
                    committed_bytes = self.committed_len,
                    "Rolled back failed WAL append"
                );
            }
            Err(e) => {
                self.poisoned = true;
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to roll back WAL append; refusing further writes"
                );
            }
        }
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Get the LSN the next append will receive
    pub fn current_lsn(&self) -> u64 {
        self.current_lsn
    }

    /// Entries appended since the last fsync
    pub fn unsynced_entries(&self) -> usize {
        self.unsynced
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
