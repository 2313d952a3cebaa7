use std::path::{Path, PathBuf};

/// Get opsh's home directory (`$OPSH_HOME`, default `~/.opsh`).
pub fn opsh_home_dir() -> Result<PathBuf, std::io::Error> {
    if let Ok(v) = std::env::var("OPSH_HOME")
        && !v.trim().is_empty()
    {
        return Ok(PathBuf::from(v));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        )
    })?;

    Ok(home.join(".opsh"))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
