use std::{
    io,
    path::{Path, PathBuf},
};

use bytes::{Bytes, BytesMut};

use crate::{config::Common, PeerId, PieceIdx};

/// In-memory store of piece payloads, indexed by piece number.
///
/// Payloads are immutable once written; reads hand out cheap `Bytes` clones.
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Option<Bytes>>,
    file_size: u64,
}

impl PieceStore {
    pub fn empty(common: &Common) -> Self {
        Self {
            pieces: vec![None; common.total_pieces() as usize],
            file_size: common.file_size,
        }
    }

    /// Seeder initialization: slice the on-disk file into piece-size chunks.
    /// The final chunk carries the remainder when the file size is not a
    /// multiple of the piece size.
    pub fn from_file(path: impl AsRef<Path>, common: &Common) -> io::Result<Self> {
        let data = Bytes::from(std::fs::read(path.as_ref())?);
        if data.len() as u64 != common.file_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} is {} bytes, configuration says {}",
                    path.as_ref().display(),
                    data.len(),
                    common.file_size
                ),
            ));
        }

        let total = common.total_pieces();
        let mut pieces = Vec::with_capacity(total as usize);
        for index in 0..total {
            let start = index as usize * common.piece_size as usize;
            let end = start + common.piece_length(index) as usize;
            pieces.push(Some(data.slice(start..end)));
        }
        Ok(Self {
            pieces,
            file_size: common.file_size,
        })
    }

    pub fn len(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn get(&self, index: PieceIdx) -> Option<Bytes> {
        self.pieces.get(u32::from(index) as usize)?.clone()
    }

    /// Write-if-absent. Returns false when the slot was already populated or
    /// the index is out of range; the stored payload never changes after the
    /// first write.
    pub fn insert_if_absent(&mut self, index: PieceIdx, data: Bytes) -> bool {
        match self.pieces.get_mut(u32::from(index) as usize) {
            Some(slot @ None) => {
                *slot = Some(data);
                true
            }
            _ => false,
        }
    }

    /// Concatenate every piece in index order into one buffer of the
    /// configured file length. Fails if any piece is still missing.
    pub fn assemble(&self) -> io::Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(self.file_size as usize);
        for (index, piece) in self.pieces.iter().enumerate() {
            let piece = piece.as_ref().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("piece {index} has not been downloaded"),
                )
            })?;
            buffer.extend_from_slice(piece);
        }
        Ok(buffer.freeze())
    }

    pub fn write_assembled(&self, path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::write(path, self.assemble()?)
    }
}

/// Create the per-peer working directory `<root>/<peer id>` and clear every
/// regular file in it except the shared input file.
pub fn prepare_working_dir(
    root: impl AsRef<Path>,
    peer_id: PeerId,
    input_file: &str,
) -> io::Result<PathBuf> {
    let dir = root.as_ref().join(peer_id.to_string());
    std::fs::create_dir_all(&dir)?;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name() != *input_file {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(dir)
}
