use std::path::PathBuf;

/// Returns the config directory for agentrix.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("agentrix")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("agentrix")
    } else {
        PathBuf::from("/tmp/agentrix")
    }
}

/// Returns the default config file path.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Directory name used for a branch's worktree checkout.
///
/// Slashes would nest directories, so the name is escaped: `%` becomes
/// `%25` and `/` becomes `%2F`. Distinct branches always get distinct
/// directory names, and [`branch_from_dir_name`] reverses the mapping.
pub fn branch_dir_name(branch: &str) -> String {
    let mut out = String::with_capacity(branch.len());
    for ch in branch.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`branch_dir_name`]. Returns `None` for names it could not
/// have produced.
pub fn branch_from_dir_name(dir: &str) -> Option<String> {
    let mut out = String::with_capacity(dir.len());
    let mut rest = dir;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let escape = rest.get(idx..idx + 3)?;
        match escape {
            "%25" => out.push('%'),
            "%2F" => out.push('/'),
            _ => return None,
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}
