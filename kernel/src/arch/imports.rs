//! Import specifier scanning and resolution
//!
//! Specifiers are collected with a regex scan over `import … from`,
//! `export … from`, and `require(…)` forms, then resolved against the
//! project tree with the standard candidate extension list.

use regex::Regex;
use std::sync::LazyLock;

/// Candidate extensions tried during resolution, in order.
pub const RESOLUTION_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

static IMPORT_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*import\s+(?:type\s+)?[^'"\n]*?\bfrom\s+['"]([^'"]+)['"]"#).unwrap()
});

static IMPORT_BARE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*import\s+['"]([^'"]+)['"]"#).unwrap());

static EXPORT_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*export\s+[^'"\n]*?\bfrom\s+['"]([^'"]+)['"]"#).unwrap()
});

static REQUIRE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap());

/// All import specifiers in a source file, in occurrence order.
pub fn scan_specifiers(content: &str) -> Vec<String> {
    let mut specs = Vec::new();
    for re in [&*IMPORT_FROM_RE, &*IMPORT_BARE_RE, &*EXPORT_FROM_RE, &*REQUIRE_RE] {
        for capture in re.captures_iter(content) {
            specs.push(capture[1].to_string());
        }
    }
    specs
}

/// Classification of an import specifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    /// `./x` or `../x`
    Relative,
    /// `src/x` or `/src/x` — project-absolute under src
    ProjectAbsolute,
    /// `/x` outside `src/`
    AbsoluteOutsideSrc,
    /// `@/x`, `~/x`, `#x` — tsconfig-alias style
    Alias,
    /// Bare package specifier (`express`, `@scope/pkg`)
    External,
    /// Unparseable (empty, whitespace, embedded newline)
    Malformed,
}

/// Classify a specifier.
pub fn classify(spec: &str) -> SpecKind {
    let trimmed = spec.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return SpecKind::Malformed;
    }
    if trimmed.starts_with("./") || trimmed.starts_with("../") || trimmed == "." || trimmed == ".." {
        return SpecKind::Relative;
    }
    if trimmed.starts_with("src/") || trimmed.starts_with("/src/") {
        return SpecKind::ProjectAbsolute;
    }
    if trimmed.starts_with('/') {
        return SpecKind::AbsoluteOutsideSrc;
    }
    if trimmed.starts_with("@/") || trimmed.starts_with("~/") || trimmed.starts_with('#') {
        return SpecKind::Alias;
    }
    SpecKind::External
}

/// A `.js`-style suffix on a specifier whose basename still contains a dot
/// pattern like `.ts.js` is malformed ESM output mapping.
pub fn has_malformed_js_suffix(spec: &str) -> bool {
    spec.ends_with(".ts.js") || spec.ends_with(".tsx.js") || spec.ends_with(".js.js")
}

/// Lexically join `dir` and a relative specifier into a project-relative
/// POSIX path. Returns `None` when the specifier escapes the project root.
pub fn join_relative(dir: &str, spec: &str) -> Option<String> {
    let mut parts: Vec<&str> = if dir.is_empty() {
        Vec::new()
    } else {
        dir.split('/').collect()
    };
    for part in spec.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Resolve a joined project-relative base against the tree, trying the raw
/// path, candidate extensions, ESM `.js`→`.ts` rewrites, and `index.*`.
///
/// `exists` answers membership for a project-relative POSIX path.
pub fn resolve(base: &str, exists: &dyn Fn(&str) -> bool) -> Option<String> {
    if exists(base) {
        return Some(base.to_string());
    }

    // TS ESM style: `./foo.js` refers to `foo.ts` on disk.
    for (suffix, replacements) in [
        (".js", &["ts", "tsx"][..]),
        (".mjs", &["mts", "ts"][..]),
        (".cjs", &["cts", "ts"][..]),
    ] {
        if let Some(stem) = base.strip_suffix(suffix) {
            for ext in replacements {
                let candidate = format!("{stem}.{ext}");
                if exists(&candidate) {
                    return Some(candidate);
                }
            }
        }
    }

    for ext in RESOLUTION_EXTENSIONS {
        let candidate = format!("{base}.{ext}");
        if exists(&candidate) {
            return Some(candidate);
        }
    }

    for ext in RESOLUTION_EXTENSIONS {
        let candidate = format!("{base}/index.{ext}");
        if exists(&candidate) {
            return Some(candidate);
        }
    }

    None
}

/// Project-relative base path for a specifier from `file`, or `None` when
/// the specifier is not a local path (external, alias, malformed).
pub fn local_base(file: &str, spec: &str) -> Option<String> {
    match classify(spec) {
        SpecKind::Relative => {
            let dir = match file.rfind('/') {
                Some(idx) => &file[..idx],
                None => "",
            };
            join_relative(dir, spec)
        }
        SpecKind::ProjectAbsolute => Some(spec.trim_start_matches('/').to_string()),
        _ => None,
    }
}
