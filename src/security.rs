//! Filename sanitization and attached-file extension/pattern policy.
//!
//! The sanitizer mirrors what the execution coordinator demands of every
//! staged or harvested filename: a basename made only of `[A-Za-z0-9._-]`,
//! never starting with `.`, never exceeding 255 bytes, never empty.

use rand::Rng;
use thiserror::Error;

const MAX_LEN: usize = 255;

/// Sanitize a filename for safe use inside a sandbox working directory.
///
/// Idempotent: `sanitize_filename(&sanitize_filename(x)) == sanitize_filename(x)`.
pub fn sanitize_filename(name: Option<&str>) -> String {
    let name = match name {
        Some(n) if !n.is_empty() => n,
        _ => return "_".to_string(),
    };

    let basename = name
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();

    if basename.is_empty() {
        return "_".to_string();
    }

    let cleaned: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = if cleaned.starts_with('.') {
        format!("_{cleaned}")
    } else {
        cleaned
    };

    if cleaned.is_empty() {
        return "_".to_string();
    }

    if cleaned.len() <= MAX_LEN {
        return cleaned;
    }

    truncate_with_suffix(&cleaned)
}

/// Deprecated alias kept for callers migrating off the old name.
pub fn normalize_filename(name: Option<&str>) -> String {
    sanitize_filename(name)
}

fn truncate_with_suffix(name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };

    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| {
                let v: u8 = rng.gen_range(0..16);
                std::char::from_digit(v as u32, 16).unwrap()
            })
            .collect()
    };

    let budget = MAX_LEN.saturating_sub(1 + suffix.len() + ext.len());
    let trunc_stem: String = stem.chars().take(budget).collect();
    format!("{trunc_stem}-{suffix}{ext}")
}

/// Why [`FilePolicy::check`] rejected a filename.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("matches blocked pattern {0}")]
    BlockedPattern(String),
    #[error("no file extension")]
    NoExtension,
    #[error("extension {0} not in allow-list")]
    ExtensionNotAllowed(String),
}

/// Extension allow-list plus glob-style deny patterns applied to attached files.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    allowed_extensions: Vec<String>,
    blocked_patterns: Vec<String>,
}

impl FilePolicy {
    pub fn new(allowed_extensions: Vec<String>, blocked_patterns: Vec<String>) -> Self {
        Self {
            allowed_extensions,
            blocked_patterns,
        }
    }

    pub fn default_policy() -> Self {
        Self::new(
            DEFAULT_ALLOWED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_BLOCKED_PATTERNS.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Returns `Err(PolicyViolation)` if `filename` is not permitted.
    pub fn check(&self, filename: &str) -> Result<(), PolicyViolation> {
        let lower = filename.to_ascii_lowercase();

        for pattern in &self.blocked_patterns {
            if glob_match(pattern, &lower) {
                return Err(PolicyViolation::BlockedPattern(pattern.clone()));
            }
        }

        let ext = match lower.rfind('.') {
            Some(idx) => &lower[idx..],
            None => return Err(PolicyViolation::NoExtension),
        };

        if self.allowed_extensions.iter().any(|a| a == ext) {
            Ok(())
        } else {
            Err(PolicyViolation::ExtensionNotAllowed(ext.to_string()))
        }
    }
}

/// Minimal `*`-only glob matcher, sufficient for patterns like `*.exe`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        candidate.ends_with(suffix)
    } else {
        pattern == candidate
    }
}

const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".rtf", ".pdf", ".doc", ".docx", ".dotx", ".xls", ".xlsx", ".xltx", ".ppt",
    ".pptx", ".potx", ".ppsx", ".odt", ".ods", ".odp", ".odg", ".json", ".csv", ".xml", ".yaml",
    ".yml", ".sql", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".bmp", ".webp", ".ico", ".html",
    ".htm", ".css", ".py", ".js", ".ts", ".go", ".java", ".c", ".cpp", ".h", ".hpp", ".php",
    ".rs", ".r", ".f90", ".d", ".sh", ".bat", ".ps1", ".dockerfile", ".makefile", ".ini", ".cfg",
    ".conf", ".log", ".zip", ".eml", ".msg", ".mbox", ".ics", ".vcf",
];

const DEFAULT_BLOCKED_PATTERNS: &[&str] = &["*.exe", "*.dll", "*.so", "*.dylib", "*.bin"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_and_parens_become_underscore() {
        assert_eq!(
            sanitize_filename(Some("manufacturing_analysis (v2).xlsx")),
            "manufacturing_analysis__v2_.xlsx"
        );
    }

    #[test]
    fn path_traversal_is_stripped_to_basename() {
        assert_eq!(sanitize_filename(Some("../../../etc/passwd")), "passwd");
        assert_eq!(sanitize_filename(Some("/absolute/path/file.txt")), "file.txt");
    }

    #[test]
    fn hidden_files_get_prefixed() {
        assert_eq!(sanitize_filename(Some(".hidden")), "_.hidden");
    }

    #[test]
    fn empty_and_none_become_underscore() {
        assert_eq!(sanitize_filename(Some("")), "_");
        assert_eq!(sanitize_filename(None), "_");
    }

    #[test]
    fn unicode_is_replaced_char_by_char() {
        assert_eq!(sanitize_filename(Some("résumé.docx")), "r_sum_.docx");
    }

    #[test]
    fn brackets_and_leading_paren() {
        assert_eq!(sanitize_filename(Some("[brackets].txt")), "_brackets_.txt");
        assert_eq!(sanitize_filename(Some("(parentheses).txt")), "_parentheses_.txt");
    }

    #[test]
    fn already_valid_names_are_unchanged() {
        assert_eq!(sanitize_filename(Some("Report-2024.v1.csv")), "Report-2024.v1.csv");
    }

    #[test]
    fn long_filenames_are_truncated_and_bounded() {
        let long = format!("{}.txt", "a".repeat(400));
        let out = sanitize_filename(Some(&long));
        assert!(out.len() <= 255);
        assert!(out.ends_with(".txt"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let cases = [
            "manufacturing_analysis (v2).xlsx",
            "../../../etc/passwd",
            ".hidden",
            "",
            "résumé.docx",
        ];
        for c in cases {
            let once = sanitize_filename(Some(c));
            let twice = sanitize_filename(Some(&once));
            assert_eq!(once, twice, "not idempotent for {c:?}");
        }
    }

    #[test]
    fn policy_blocks_executables_and_unlisted_extensions() {
        let policy = FilePolicy::default_policy();
        assert!(policy.check("payload.exe").is_err());
        assert!(policy.check("notes.txt").is_ok());
        assert!(policy.check("data.py").is_ok());
        assert!(policy.check("noext").is_err());
    }
}
