//! Append-only block files (`blk00000.dat`, ...).
//!
//! Each record is the network magic, a little-endian length and the serialized block.
//! A [`FileLocation`] points at the record start.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RECORD_HEADER_LEN: u64 = 8;
pub const DEFAULT_MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            file_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            offset: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
            len: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    BadMagic { file_id: u32, offset: u64 },
    LengthMismatch,
    TooLarge(usize),
    Poisoned,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid block file location"),
            FlatFileError::BadMagic { file_id, offset } => {
                write!(f, "bad record magic in block file {file_id} at offset {offset}")
            }
            FlatFileError::LengthMismatch => write!(f, "block file record length mismatch"),
            FlatFileError::TooLarge(len) => write!(f, "record of {len} bytes exceeds file size"),
            FlatFileError::Poisoned => write!(f, "block file lock poisoned"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<FlatFileState>,
}

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_len: u64,
}

impl FlatFileStore {
    /// Opens the `blk*.dat` series under `dir`, continuing the last file that has room.
    pub fn open(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        Self::open_with_prefix(dir, "blk", magic, max_file_size)
    }

    pub fn open_with_prefix(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            magic,
            max_file_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_len,
            }),
        })
    }

    /// Appends one record, rolling over to a fresh file when the current one is full.
    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let needed = RECORD_HEADER_LEN + bytes.len() as u64;
        if needed > self.max_file_size {
            return Err(FlatFileError::TooLarge(bytes.len()));
        }
        let len = u32::try_from(bytes.len()).map_err(|_| FlatFileError::TooLarge(bytes.len()))?;
        let mut state = self.state.lock().map_err(|_| FlatFileError::Poisoned)?;
        if state.current_len + needed > self.max_file_size {
            state.current_file += 1;
            state.current_len = 0;
            stakd_log::log_debug!("opening new block file {}", state.current_file);
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut record = Vec::with_capacity(needed as usize);
        record.extend_from_slice(&self.magic);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(bytes);
        file.write_all(&record)?;
        file.flush()?;
        state.current_len += needed;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let mut file = File::open(self.file_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(FlatFileError::BadMagic {
                file_id: location.file_id,
                offset: location.offset,
            });
        }
        let stored_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if stored_len != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// True when every block file referenced by `file_ids` exists on disk.
    pub fn files_present(&self, file_ids: impl IntoIterator<Item = u32>) -> bool {
        file_ids
            .into_iter()
            .all(|file_id| self.file_path(file_id).exists())
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{}{file_id:05}.dat", self.prefix))
    }
}

fn locate_active_file(
    dir: &Path,
    prefix: &str,
    max_file_size: u64,
) -> Result<(u32, u64), FlatFileError> {
    let mut file_id = 0u32;
    let mut last_existing: Option<(u32, u64)> = None;
    loop {
        let path = dir.join(format!("{prefix}{file_id:05}.dat"));
        if !path.exists() {
            break;
        }
        last_existing = Some((file_id, std::fs::metadata(&path)?.len()));
        file_id += 1;
    }

    Ok(match last_existing {
        Some((last_id, len)) if len >= max_file_size => (last_id + 1, 0),
        Some((last_id, len)) => (last_id, len),
        None => (0, 0),
    })
}
