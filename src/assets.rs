//! Model files split into numbered chunks
//!
//! Large models ship as `<path>.0`, `<path>.1`, ... so each piece stays under
//! hosting size limits. They are concatenated in numeric order on load.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FilterError, FilterResult};

pub const DEFAULT_CHUNK_SIZE_MB: usize = 50;

fn chunk_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Concatenate `<path>.0`, `<path>.1`, ... until the first missing index.
/// Falls back to `<path>` itself when no chunk exists.
pub fn read_file_chunked(path: &Path) -> FilterResult<Vec<u8>> {
    let mut result = Vec::new();
    let mut index = 0;
    loop {
        let chunk = chunk_path(path, index);
        if !chunk.is_file() {
            break;
        }
        result.extend_from_slice(&fs::read(&chunk)?);
        index += 1;
    }

    if index > 0 {
        log::debug!("[assets] Joined {} chunks for {}", index, path.display());
        return Ok(result);
    }
    if path.is_file() {
        return Ok(fs::read(path)?);
    }
    Err(FilterError::Configuration(format!(
        "model file not found: {} (no chunks either)",
        path.display()
    )))
}

/// Split `path` into `<path>.N` files of at most `chunk_size_mb` MB each.
/// Returns the number of chunks written.
pub fn split_file_into_chunks(path: &Path, chunk_size_mb: usize) -> FilterResult<usize> {
    if chunk_size_mb == 0 {
        return Err(FilterError::Configuration("chunk size must be non-zero".into()));
    }
    let data = fs::read(path)?;
    let mut written = 0;
    for (i, chunk) in data.chunks(chunk_size_mb * 1024 * 1024).enumerate() {
        fs::write(chunk_path(path, i), chunk)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joins_chunks_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        // written newest first; `.10` sorts before `.2` as text
        for i in (0..=10usize).rev() {
            fs::write(chunk_path(&model, i), format!("{};", i)).unwrap();
        }
        fs::write(chunk_path(&model, 12), b"orphan").unwrap();

        assert_eq!(read_file_chunked(&model).unwrap(), b"0;1;2;3;4;5;6;7;8;9;10;");
    }

    #[test]
    fn test_falls_back_to_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("plain.onnx");
        fs::write(&model, b"whole").unwrap();
        assert_eq!(read_file_chunked(&model).unwrap(), b"whole");
    }

    #[test]
    fn test_missing_model_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file_chunked(&dir.path().join("nope.onnx")).unwrap_err();
        assert!(matches!(err, FilterError::Configuration(_)));
    }

    #[test]
    fn test_split_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(2 * 1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&model, &data).unwrap();

        assert_eq!(split_file_into_chunks(&model, 1).unwrap(), 3);
        fs::remove_file(&model).unwrap();
        assert_eq!(read_file_chunked(&model).unwrap(), data);
    }
}
