use bytes::Bytes;

use crate::error::{Result, SandboxError};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Build an in-memory tar archive holding one directory and its files.
///
/// The directory entry comes first so extraction creates it with sane
/// permissions before any file lands in it. Every file header carries the
/// exact content length.
pub fn build_archive(dir_name: &str, files: &[(&str, &[u8])]) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    let mtime = chrono::Utc::now().timestamp().max(0).unsigned_abs();

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(DIR_MODE);
    header.set_size(0);
    header.set_mtime(mtime);
    builder
        .append_data(&mut header, format!("{dir_name}/"), std::io::empty())
        .map_err(|e| SandboxError::Staging(format!("archive dir {dir_name}: {e}")))?;

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(FILE_MODE);
        header.set_size(content.len() as u64);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, format!("{dir_name}/{name}"), *content)
            .map_err(|e| SandboxError::Staging(format!("archive {name}: {e}")))?;
    }

    let data = builder
        .into_inner()
        .map_err(|e| SandboxError::Staging(format!("finish archive: {e}")))?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn directory_first_then_files_with_sizes() {
        let archive = build_archive(
            "run-1",
            &[("main.py", b"print('hi')\n"), ("stdin.txt", b"")],
        )
        .unwrap();

        let mut reader = tar::Archive::new(archive.as_ref());
        let mut seen = Vec::new();
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let header = entry.header();
            let mode = header.mode().unwrap();
            let kind = header.entry_type();
            let size = header.size().unwrap();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            seen.push((path, kind, mode, size, body));
        }

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "run-1/");
        assert_eq!(seen[0].1, tar::EntryType::Directory);
        assert_eq!(seen[0].2, 0o755);

        assert_eq!(seen[1].0, "run-1/main.py");
        assert_eq!(seen[1].2, 0o644);
        assert_eq!(seen[1].3, 12);
        assert_eq!(seen[1].4, b"print('hi')\n");

        assert_eq!(seen[2].0, "run-1/stdin.txt");
        assert_eq!(seen[2].3, 0);
    }
}
