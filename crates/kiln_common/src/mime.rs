//! The fixed MIME type / file extension table.
//!
//! Transforms are registered by input MIME type, so every path that enters the
//! host is sniffed through this table. The first extension listed for a MIME
//! type is its canonical extension, used to suffix pseudo-paths when the host
//! recurses into an intermediate compilation result.

use std::path::Path;

/// Bidirectional MIME type to extension mapping. The first extension in each
/// row is the canonical one.
const MIME_TABLE: &[(&str, &[&str])] = &[
    ("application/javascript", &["js", "es6"]),
    ("text/less", &["less"]),
    ("text/stylus", &["stylus"]),
    ("text/jsx", &["jsx"]),
    ("text/cjsx", &["cjsx"]),
    ("text/coffeescript", &["coffee", "litcoffee"]),
    ("text/typescript", &["ts"]),
    ("text/tsx", &["tsx"]),
    ("text/cson", &["cson"]),
    ("text/html", &["html", "htm"]),
    ("text/jade", &["jade"]),
    ("text/plain", &["txt"]),
    ("image/svg+xml", &["svg"]),
];

/// MIME types the host treats as final: output in one of these forms is
/// usable as-is and terminates the recursive compile cascade.
const FINAL_FORMS: &[&str] = &[
    "text/javascript",
    "application/javascript",
    "text/html",
    "text/css",
    "image/svg+xml",
    "application/json",
];

/// The MIME type whose transform doubles as the passthrough store.
pub const PASSTHROUGH_MIME_TYPE: &str = "text/plain";

/// Looks up the MIME type for a path by its extension.
pub fn lookup_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    MIME_TABLE
        .iter()
        .find(|(_, exts)| exts.contains(&ext))
        .map(|(mime, _)| *mime)
}

/// Returns the canonical extension for a MIME type, if it has one.
pub fn canonical_extension(mime_type: &str) -> Option<&'static str> {
    extensions_for(mime_type).first().copied()
}

/// Returns all extensions registered for a MIME type.
pub fn extensions_for(mime_type: &str) -> &'static [&'static str] {
    MIME_TABLE
        .iter()
        .find(|(mime, _)| *mime == mime_type)
        .map(|(_, exts)| *exts)
        .unwrap_or(&[])
}

/// Returns `true` if the MIME type is a final form the host will not try to
/// lower further.
pub fn is_final_form(mime_type: &str) -> bool {
    FINAL_FORMS.contains(&mime_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_extension() {
        assert_eq!(lookup_path(Path::new("a/b/mod.ts")), Some("text/typescript"));
        assert_eq!(lookup_path(Path::new("style.less")), Some("text/less"));
        assert_eq!(lookup_path(Path::new("index.htm")), Some("text/html"));
    }

    #[test]
    fn lookup_unknown_extension() {
        assert_eq!(lookup_path(Path::new("binary.wasm")), None);
        assert_eq!(lookup_path(Path::new("no_extension")), None);
    }

    #[test]
    fn secondary_extensions_resolve() {
        assert_eq!(lookup_path(Path::new("a.es6")), Some("application/javascript"));
        assert_eq!(
            lookup_path(Path::new("a.litcoffee")),
            Some("text/coffeescript")
        );
    }

    #[test]
    fn canonical_extension_is_first() {
        assert_eq!(canonical_extension("application/javascript"), Some("js"));
        assert_eq!(canonical_extension("text/coffeescript"), Some("coffee"));
        assert_eq!(canonical_extension("application/x-unknown"), None);
    }

    #[test]
    fn final_forms() {
        assert!(is_final_form("application/javascript"));
        assert!(is_final_form("text/css"));
        assert!(!is_final_form("text/typescript"));
        assert!(!is_final_form("text/plain"));
    }
}
