use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchSource {
    /// Taken from the caller's worktree descriptor.
    Worktree,
    /// Produced by the branch-name generator.
    Generated,
}

impl BranchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchSource::Worktree => "worktree",
            BranchSource::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBranch {
    pub branch: String,
    pub source: BranchSource,
    pub default_branch_override: Option<String>,
}

/// Turn free text into a git-safe branch slug.
///
/// Case-folds, turns whitespace runs into `-`, collapses slashes, drops
/// characters git refuses in ref names. Returns an empty string when nothing
/// usable is left.
pub fn sanitize_branch_name(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut segments = Vec::new();

    for raw in lowered.split('/') {
        let mut seg = String::with_capacity(raw.len());
        let mut pending_dash = false;
        for ch in raw.trim().chars() {
            if ch.is_whitespace() || ch == '-' {
                pending_dash = true;
                continue;
            }
            if !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_') {
                continue;
            }
            if pending_dash && !seg.is_empty() {
                seg.push('-');
            }
            pending_dash = false;
            seg.push(ch);
        }

        while seg.contains("..") {
            seg = seg.replace("..", ".");
        }
        let mut seg = seg.trim_matches(['.', '-']).to_string();
        while let Some(stripped) = seg.strip_suffix(".lock") {
            seg = stripped.trim_end_matches(['.', '-']).to_string();
        }
        if !seg.is_empty() {
            segments.push(seg);
        }
    }

    segments.join("/")
}
