//! Per-instance identity record kept on the engine's storage mount.
//!
//! Created once when storage is formatted. The rank is set at most once
//! (from a join reply or from configuration); the whole file is removed
//! on reset-format. Every write goes through a temp file and a rename.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use strata_core::Rank;

use crate::error::{EngineError, EngineResult};

pub const SUPERBLOCK_FILE: &str = "superblock";
const SUPERBLOCK_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u8,
    pub uuid: Uuid,
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<Rank>,
    #[serde(default)]
    pub valid_rank: bool,
}

impl Superblock {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            version: SUPERBLOCK_VERSION,
            uuid: Uuid::new_v4(),
            system: system.into(),
            rank: None,
            valid_rank: false,
        }
    }

    pub fn path(mount: &Path) -> PathBuf {
        mount.join(SUPERBLOCK_FILE)
    }

    /// Read the superblock under `mount`; `None` if there is none.
    pub fn read(mount: &Path) -> EngineResult<Option<Self>> {
        let path = Self::path(mount);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::io(path, e)),
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| EngineError::InvalidSuperblock {
                path,
                msg: e.to_string(),
            })
    }

    pub fn write(&self, mount: &Path) -> EngineResult<()> {
        let path = Self::path(mount);
        let content = toml::to_string(self).map_err(|e| EngineError::InvalidSuperblock {
            path: path.clone(),
            msg: e.to_string(),
        })?;

        let tmp = mount.join(format!(".{SUPERBLOCK_FILE}.tmp"));
        std::fs::write(&tmp, content).map_err(|e| EngineError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| EngineError::io(&path, e))
    }

    /// Remove the superblock; `false` if there was none.
    pub fn remove(mount: &Path) -> EngineResult<bool> {
        let path = Self::path(mount);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    /// The assigned rank, if it has been made valid.
    pub fn valid_rank(&self) -> Option<Rank> {
        if self.valid_rank { self.rank } else { None }
    }

    /// Assign the rank. Setting the same rank again is a no-op; changing a
    /// valid rank is an error.
    pub fn set_rank(&mut self, rank: Rank) -> EngineResult<bool> {
        match self.valid_rank() {
            Some(existing) if existing == rank => Ok(false),
            Some(existing) => Err(EngineError::RankMismatch {
                existing,
                requested: rank,
            }),
            None => {
                self.rank = Some(rank);
                self.valid_rank = true;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Superblock::read(dir.path()).unwrap(), None);
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = Superblock::new("strata");
        sb.write(dir.path()).unwrap();
        assert_eq!(Superblock::read(dir.path()).unwrap(), Some(sb.clone()));

        sb.set_rank(Rank::new(3)).unwrap();
        sb.write(dir.path()).unwrap();
        let back = Superblock::read(dir.path()).unwrap().unwrap();
        assert_eq!(back.valid_rank(), Some(Rank::new(3)));
        assert!(!dir.path().join(".superblock.tmp").exists());
    }

    #[test]
    fn rank_is_set_once() {
        let mut sb = Superblock::new("strata");
        assert!(sb.set_rank(Rank::new(1)).unwrap());
        assert!(!sb.set_rank(Rank::new(1)).unwrap());
        assert!(matches!(
            sb.set_rank(Rank::new(2)),
            Err(EngineError::RankMismatch { .. })
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(Superblock::path(dir.path()), "not = [valid").unwrap();
        assert!(matches!(
            Superblock::read(dir.path()),
            Err(EngineError::InvalidSuperblock { .. })
        ));
    }

    #[test]
    fn remove_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Superblock::remove(dir.path()).unwrap());
        Superblock::new("strata").write(dir.path()).unwrap();
        assert!(Superblock::remove(dir.path()).unwrap());
    }
}
