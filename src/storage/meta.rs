//! Persisted server metadata: the current term, the vote cast in that
//! term, and the index of the last committed configuration entry.
//! Flushed to stable storage on every change, before any RPC response
//! that depends on it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{Storage, StorageLevel};
use crate::error::Result;
use crate::{LogIndex, MemberId, Term};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub current_term: Term,
    pub voted_for: Option<MemberId>,
    pub last_config_index: LogIndex,
}

pub struct MetaStore {
    path: Option<PathBuf>,
    metadata: ServerMetadata,
}

impl MetaStore {
    pub fn open(storage: &Storage) -> Result<Self> {
        match storage.level {
            StorageLevel::Memory => Ok(Self {
                path: None,
                metadata: ServerMetadata::default(),
            }),
            StorageLevel::Disk => {
                std::fs::create_dir_all(&storage.directory)?;
                let path = storage.directory.join("meta.json");
                let metadata = if path.exists() {
                    let bytes = std::fs::read(&path)?;
                    serde_json::from_slice(&bytes)?
                } else {
                    ServerMetadata::default()
                };
                Ok(Self {
                    path: Some(path),
                    metadata,
                })
            }
        }
    }

    pub fn metadata(&self) -> ServerMetadata {
        self.metadata
    }

    pub fn current_term(&self) -> Term {
        self.metadata.current_term
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        self.metadata.voted_for
    }

    /// Adopts a higher term, clearing the vote. Persists before
    /// returning.
    pub fn store_term(&mut self, term: Term) -> Result<()> {
        if term > self.metadata.current_term {
            self.metadata.current_term = term;
            self.metadata.voted_for = None;
            self.persist()?;
        }
        Ok(())
    }

    /// Records a vote in the current term. Persists before returning.
    pub fn store_vote(&mut self, candidate: MemberId) -> Result<()> {
        self.metadata.voted_for = Some(candidate);
        self.persist()
    }

    pub fn store_config_index(&mut self, index: LogIndex) -> Result<()> {
        if index > self.metadata.last_config_index {
            self.metadata.last_config_index = index;
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec(&self.metadata)?;
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        Ok(())
    }
}
