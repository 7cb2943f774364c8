//! Durable file writes
//!
//! Both helpers fsync before returning so an acknowledged write survives a
//! crash.

use super::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Replace `path` with `contents` via a temp file and rename
pub(crate) fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent(path)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    {
        let mut file = File::create(tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(tmp, path)?;
    sync_parent(path);
    Ok(())
}

/// Append one line (newline added) to `path`.
///
/// A torn last line left by a crash is terminated first so the new line
/// stays readable on its own.
pub(crate) fn append_line(path: &Path, line: &str) -> Result<()> {
    ensure_parent(path)?;

    let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
    let mut buf = String::with_capacity(line.len() + 2);
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            buf.push('\n');
        }
    }
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// Makes the rename itself durable; not supported on every platform.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
