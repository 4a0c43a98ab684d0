// SPDX-License-Identifier: Apache-2.0

//! Checkpointed reading of tracked files.
//!
//! A checkpoint records how far one handler namespace has consumed one file
//! identity. Records live under `<state_dir>/<namespace>/<dev:ino>` and are
//! replaced atomically on every update.

mod reader;
mod store;

use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};

use crate::monitor::error::{Error, Result};
use crate::monitor::file_id::FileId;

pub use reader::{CheckpointReader, DEFAULT_MAX_BATCH_BYTES, ReadBatch};
pub use store::CheckpointStore;

const MAGIC: &[u8; 4] = b"LMCP";
const VERSION: u8 = 1;

/// Persisted tailing progress for one (namespace, identity) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub file_id: FileId,
    pub track_link: PathBuf,
    pub offset: u64,
}

impl Checkpoint {
    pub fn new(file_id: FileId, track_link: PathBuf, offset: u64) -> Self {
        Self {
            file_id,
            track_link,
            offset,
        }
    }

    /// Binary layout: magic, version, u32-prefixed identity string,
    /// u32-prefixed track link path, u64 offset. Integers are big endian.
    pub fn encode(&self) -> BytesMut {
        let id = self.file_id.to_string();
        let link = self.track_link.to_string_lossy();

        let mut buf = BytesMut::with_capacity(4 + 1 + 4 + id.len() + 4 + link.len() + 8);
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32(id.len() as u32);
        buf.put_slice(id.as_bytes());
        buf.put_u32(link.len() as u32);
        buf.put_slice(link.as_bytes());
        buf.put_u64(self.offset);
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < MAGIC.len() + 1 || &data[..MAGIC.len()] != MAGIC {
            return Err(Error::Checkpoint("bad checkpoint header".to_string()));
        }
        data.advance(MAGIC.len());

        let version = data.get_u8();
        if version != VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version {}",
                version
            )));
        }

        let id = read_string(&mut data, "identity")?;
        let file_id = id
            .parse::<FileId>()
            .map_err(Error::Checkpoint)?;
        let link = read_string(&mut data, "track link")?;

        if data.remaining() < 8 {
            return Err(Error::Checkpoint("truncated checkpoint offset".to_string()));
        }
        let offset = data.get_u64();

        Ok(Self {
            file_id,
            track_link: PathBuf::from(link),
            offset,
        })
    }
}

fn read_string(data: &mut &[u8], what: &str) -> Result<String> {
    if data.remaining() < 4 {
        return Err(Error::Checkpoint(format!("truncated checkpoint {}", what)));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(Error::Checkpoint(format!("truncated checkpoint {}", what)));
    }
    let s = String::from_utf8(data[..len].to_vec())
        .map_err(|e| Error::Checkpoint(format!("invalid checkpoint {}: {}", what, e)))?;
    data.advance(len);
    Ok(s)
}
