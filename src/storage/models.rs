//! Model file discovery

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::storage::{get_data_dir, StorageError};

/// A `.gguf` file found on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Full path to the model file
    pub path: PathBuf,
    /// Filename of the model
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub last_modified: SystemTime,
}

impl ModelInfo {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            path,
            filename,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
        })
    }

    /// Registry key for this file: the filename without its extension
    pub fn key(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.filename)
            .to_string()
    }

    /// Human-readable size
    pub fn size_string(&self) -> String {
        let bytes = self.size_bytes as f64;

        if bytes < 1024.0 {
            format!("{} B", bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else if bytes < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Lists the `.gguf` files directly inside `directory`, sorted by filename.
///
/// A missing directory yields an empty list rather than an error.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_gguf = path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("gguf");
        if !is_gguf {
            continue;
        }

        match ModelInfo::from_path(path.clone()) {
            Ok(info) => {
                tracing::debug!("Found model: {}", info.filename);
                models.push(info);
            }
            Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));
    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());

    Ok(models)
}

/// Default models directory: `<data_dir>/models`
pub fn default_models_directory() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("models"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_model_info_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let model_path = temp_dir.path().join("gemma-3-4b-it.Q4_K_M.gguf");
        File::create(&model_path).unwrap();

        let info = ModelInfo::from_path(model_path.clone()).unwrap();

        assert_eq!(info.filename, "gemma-3-4b-it.Q4_K_M.gguf");
        assert_eq!(info.key(), "gemma-3-4b-it.Q4_K_M");
        assert_eq!(info.path, model_path);
        assert_eq!(info.size_bytes, 0);
    }

    #[test]
    fn test_size_string() {
        let info = ModelInfo {
            path: PathBuf::from("test.gguf"),
            filename: "test.gguf".to_string(),
            size_bytes: 1024,
            last_modified: SystemTime::now(),
        };
        assert_eq!(info.size_string(), "1.00 KB");

        let large = ModelInfo {
            size_bytes: 1024 * 1024 * 1024 * 3,
            ..info
        };
        assert!(large.size_string().contains("GB"));
    }

    #[test]
    fn test_scan_models_directory() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("model2.gguf")).unwrap();
        let mut first = File::create(temp_dir.path().join("model1.gguf")).unwrap();
        first.write_all(b"GGUF").unwrap();
        File::create(temp_dir.path().join("not_a_model.txt")).unwrap();
        fs::create_dir(temp_dir.path().join("dir.gguf")).unwrap();

        let models = scan_models_directory(temp_dir.path()).unwrap();

        let names: Vec<&str> = models.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["model1.gguf", "model2.gguf"]);
        assert_eq!(models[0].size_bytes, 4);
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let models = scan_models_directory(Path::new("/this/path/does/not/exist")).unwrap();
        assert!(models.is_empty());
    }
}
