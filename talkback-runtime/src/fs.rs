use anyhow::Context;
use std::fs;
use std::path::Path;

/// Writes `contents` next to `path` and swaps it into place.
///
/// The previous file is parked as `.bak` until the swap succeeds and is restored if it
/// fails, so a crash mid-write never leaves a truncated config behind.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory: {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("write temp: {}", tmp.display()))?;

    let backup = path.with_extension("bak");
    let had_previous = path.exists();
    if had_previous {
        let _ = fs::remove_file(&backup);
        fs::rename(path, &backup).with_context(|| {
            format!("park previous file {} -> {}", path.display(), backup.display())
        })?;
    }

    match fs::rename(&tmp, path) {
        Ok(()) => {
            let _ = fs::remove_file(&backup);
            Ok(())
        }
        Err(e) => {
            if had_previous {
                let _ = fs::rename(&backup, path);
            }
            let _ = fs::remove_file(&tmp);
            Err(anyhow::Error::new(e).context(format!("replace file: {}", path.display())))
        }
    }
}
