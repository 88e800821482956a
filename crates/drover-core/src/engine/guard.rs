//! Mutation guard: decides whether a proposed file write may be applied.

use std::path::{Component, Path, PathBuf};

use crate::error::ValidationError;

/// Patterns no mutation may contain, matched case-insensitively.
pub const BUILTIN_DENY_LIST: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
    "chmod -r 777 /",
    "drop table",
    "drop database",
    "truncate table",
    "git push --force",
    "shutdown -h",
];

/// How a target file's content is checked for well-formedness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Json,
    Toml,
    /// Source code, checked by delimiter balance.
    Source,
    /// Always well-formed.
    Text,
}

/// Languages with C-style comments. `#`-comment languages (shell, Python,
/// Ruby, PHP) are treated as text.
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "c", "h", "cc", "cpp", "hpp", "go", "java", "kt", "js", "jsx", "ts", "tsx", "swift",
    "cs", "scala",
];

impl ContentFormat {
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Self::Json,
            "toml" => Self::Toml,
            e if SOURCE_EXTENSIONS.contains(&e) => Self::Source,
            _ => Self::Text,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Toml => "toml",
            Self::Source => "source",
            Self::Text => "text",
        }
    }
}

/// Check that `content` is well-formed for `format`.
pub fn check_syntax(format: ContentFormat, content: &str) -> Result<(), ValidationError> {
    let malformed = |detail: String| ValidationError::Malformed {
        format: format.label().to_string(),
        detail,
    };
    match format {
        ContentFormat::Json => serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| malformed(e.to_string())),
        ContentFormat::Toml => toml::from_str::<toml::Table>(content)
            .map(|_| ())
            .map_err(|e| malformed(e.to_string())),
        ContentFormat::Source => check_delimiters(content).map_err(malformed),
        ContentFormat::Text => Ok(()),
    }
}

/// Balance of `()`, `[]` and `{}` outside string literals, char literals
/// and comments.
pub fn check_delimiters(content: &str) -> Result<(), String> {
    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    } else if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
            }
            // 'x' and '\n' are char literals; anything else (lifetimes,
            // apostrophes in prose) is ordinary text.
            '\'' => {
                if chars.get(i + 1) == Some(&'\\') {
                    if let Some(end) = (i + 2..chars.len().min(i + 12)).find(|&j| chars[j] == '\'') {
                        i = end;
                    }
                } else if chars.get(i + 2) == Some(&'\'') {
                    i += 2;
                }
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, at)) => {
                        return Err(format!(
                            "line {line}: {c:?} closes {open:?} opened on line {at}"
                        ));
                    }
                    None => return Err(format!("line {line}: unmatched {c:?}")),
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, at)) => Err(format!("{open:?} opened on line {at} is never closed")),
        None => Ok(()),
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Follow symlinks in the deepest existing ancestor of `path`, keeping
/// the components that do not exist yet.
fn resolve_existing(path: &Path) -> PathBuf {
    let lexical = normalize(path);
    let mut existing = lexical.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let suffix = lexical.strip_prefix(existing).unwrap_or(Path::new(""));
    match std::fs::canonicalize(existing) {
        Ok(real) if suffix.as_os_str().is_empty() => real,
        Ok(real) => real.join(suffix),
        Err(_) => lexical.clone(),
    }
}

/// Validates proposed mutations against one workspace root.
#[derive(Debug, Clone)]
pub struct MutationGuard {
    root: PathBuf,
    deny_list: Vec<String>,
    protected: Vec<PathBuf>,
}

impl MutationGuard {
    /// `extra_deny` patterns are added to [`BUILTIN_DENY_LIST`].
    pub fn new(root: impl Into<PathBuf>, extra_deny: &[String]) -> Self {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or_else(|_| normalize(&root));
        let deny_list = BUILTIN_DENY_LIST
            .iter()
            .map(|p| p.to_string())
            .chain(extra_deny.iter().map(|p| p.to_lowercase()))
            .collect();
        Self {
            root,
            deny_list,
            protected: Vec::new(),
        }
    }

    /// Refuse targets under `dir` (relative paths are taken from the root).
    pub fn with_protected(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let joined = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        };
        self.protected.push(resolve_existing(&joined));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute target inside the root, or why not.
    ///
    /// `..` segments and symlinked ancestors are resolved before the
    /// containment check.
    pub fn resolve_target(&self, path: &Path) -> Result<PathBuf, ValidationError> {
        if path.as_os_str().is_empty() {
            return Err(ValidationError::EmptyPath);
        }
        let outside = || ValidationError::OutsideWorkspace {
            path: path.display().to_string(),
        };

        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let target = resolve_existing(&joined);

        if !target.starts_with(&self.root) || target == self.root {
            return Err(outside());
        }
        if let Some(dir) = self.protected.iter().find(|d| target.starts_with(d)) {
            return Err(ValidationError::Protected {
                path: path.display().to_string(),
                protected: dir.display().to_string(),
            });
        }
        Ok(target)
    }

    /// First deny-listed pattern found in `content`, if any.
    pub fn scan(&self, content: &str) -> Result<(), ValidationError> {
        let lowered = content.to_lowercase();
        match self.deny_list.iter().find(|p| lowered.contains(p.as_str())) {
            Some(pattern) => Err(ValidationError::DenyListed {
                pattern: pattern.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Run every check; returns the resolved target.
    pub fn validate(&self, path: &Path, content: &str) -> Result<PathBuf, ValidationError> {
        let target = self.resolve_target(path)?;
        self.scan(content)?;
        check_syntax(ContentFormat::for_path(&target), content)?;
        Ok(target)
    }
}
