//! Utility functions shared by the executor, the join engine and the
//! workflow driver.
//!

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use glob::{glob, Pattern};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::JobError;
use crate::KeyValue;

/// Resolve an input to the files it names, sorted by path.
///
/// A directory names every regular file directly inside it; anything that
/// is not an existing file or directory is treated as a glob pattern.
pub fn resolve_input(input: &str) -> Result<Vec<PathBuf>, JobError> {
    let path = Path::new(input);
    let pattern = if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    } else if path.is_dir() {
        format!("{}/*", Pattern::escape(&path.to_string_lossy()))
    } else {
        input.to_string()
    };

    let mut files: Vec<PathBuf> = glob(&pattern)?
        .flatten()
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(JobError::NoInput(input.to_string()));
    }
    Ok(files)
}

/// Read every file an input names into one stream.
///
/// A record boundary is inserted after any file that does not end in a
/// newline, so the last line of one file never runs into the next.
pub fn read_input(input: &str) -> Result<Bytes, JobError> {
    let mut buf = BytesMut::new();
    for path in resolve_input(input)? {
        let raw = fs::read(&path)?;
        let (text, encoding, had_errors) = encoding_rs::UTF_8.decode(&raw);
        if had_errors {
            warn!(path = %path.display(), "replaced malformed byte sequences in input");
        }
        debug!(path = %path.display(), encoding = encoding.name(), bytes = raw.len(), "read input file");
        buf.put_slice(text.as_bytes());
        if !text.is_empty() && !text.ends_with('\n') {
            buf.put_u8(codec::RECORD_SEPARATOR);
        }
    }
    Ok(buf.freeze())
}

/// Write records to `path` all-or-nothing: the stream goes to a temp file
/// in the same directory which is then renamed into place.
pub fn commit_output(path: &Path, records: &[KeyValue]) -> Result<(), JobError> {
    let commit_err = |source: std::io::Error| JobError::Commit {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(commit_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    let written = fs::write(&tmp, codec::encode_stream(records)).and_then(|_| fs::rename(&tmp, path));
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(commit_err(source));
    }
    Ok(())
}

/// Number of non-blank lines in a file.
pub fn count_records(path: &Path) -> Result<usize> {
    let buf = Bytes::from(fs::read(path)?);
    Ok(codec::lines(&buf).count())
}

/// Resident memory of this process in MiB.
pub fn resident_memory_mb() -> Option<i64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    system
        .process(pid)
        .map(|p| i64::try_from(p.memory() / (1024 * 1024)).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn directory_input_gets_record_boundaries() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a\t1").unwrap();
        fs::write(dir.path().join("b.txt"), "b\t2\n").unwrap();
        let buf = read_input(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(buf, Bytes::from_static(b"a\t1\nb\t2\n"));
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("nothing-*.txt");
        assert!(matches!(
            read_input(input.to_str().unwrap()),
            Err(JobError::NoInput(_))
        ));
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bom.txt");
        fs::write(&file, b"\xEF\xBB\xBFk\tv\n").unwrap();
        assert_eq!(
            read_input(file.to_str().unwrap()).unwrap(),
            Bytes::from_static(b"k\tv\n")
        );
    }

    #[test]
    fn commit_replaces_output_atomically() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested").join("out.txt");
        let records = vec![KeyValue::new(Bytes::from("k"), Bytes::from("v"))];
        commit_output(&out, &records).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "k\tv\n");
        assert_eq!(count_records(&out).unwrap(), 1);

        let leftovers: Vec<_> = fs::read_dir(out.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
