use std::path::PathBuf;

use kmem_core::config::StorageSettings;

use crate::errors::{PipelineError, PipelineResult};

pub const ARTIFACTS_DIR: &str = "documents";
pub const DB_FILE: &str = "kmem.sqlite3";

pub fn data_root(settings: &StorageSettings) -> PipelineResult<PathBuf> {
    if let Some(path) = &settings.data_root {
        return Ok(path.clone());
    }
    if let Ok(override_dir) = std::env::var("KMEM_DATA_DIR") {
        return Ok(PathBuf::from(override_dir));
    }

    let dir = dirs::data_dir().ok_or(PipelineError::MissingDataDir)?;
    Ok(dir.join("kmem"))
}

pub fn artifacts_root(settings: &StorageSettings) -> PipelineResult<PathBuf> {
    Ok(data_root(settings)?.join(ARTIFACTS_DIR))
}

pub fn db_path(settings: &StorageSettings) -> PipelineResult<PathBuf> {
    if let Some(path) = &settings.db_path {
        return Ok(path.clone());
    }
    Ok(data_root(settings)?.join(DB_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_settings_win() {
        let settings = StorageSettings {
            data_root: Some(PathBuf::from("/srv/kmem")),
            db_path: None,
        };
        assert_eq!(
            artifacts_root(&settings).unwrap(),
            PathBuf::from("/srv/kmem/documents")
        );
        assert_eq!(db_path(&settings).unwrap(), PathBuf::from("/srv/kmem/kmem.sqlite3"));

        let settings = StorageSettings {
            data_root: Some(PathBuf::from("/srv/kmem")),
            db_path: Some(PathBuf::from("/tmp/other.db")),
        };
        assert_eq!(db_path(&settings).unwrap(), PathBuf::from("/tmp/other.db"));
    }
}
