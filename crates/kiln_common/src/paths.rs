//! Cache-key path sanitization.
//!
//! Change-cache keys must be root-relative and slash-normalized so that the
//! same logical file matches across platforms, and across an original layout
//! vs. an archived/repackaged one (both the live app root and the root the
//! snapshot was written against are strippable).

use std::path::Path;

/// Normalizes a path string to forward slashes.
pub fn sanitize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Derives the change-cache key for a path: sanitized, with the app root and
/// (for a restored snapshot) the original app root stripped off the front.
pub fn cache_key(path: &Path, app_root: Option<&str>, original_app_root: Option<&str>) -> String {
    let mut key = sanitize_path(&path.to_string_lossy());

    for root in [app_root, original_app_root].into_iter().flatten() {
        let root = sanitize_path(root);
        if !root.is_empty() {
            if let Some(stripped) = key.strip_prefix(&root) {
                key = stripped.to_string();
            }
        }
    }

    key
}

/// Returns `true` if a path lies under a vendored-dependency directory or a
/// platform runtime archive. Such files are shipped verbatim and never
/// recompiled.
pub fn in_library_dir(path: &Path) -> bool {
    let lower = sanitize_path(&path.to_string_lossy()).to_ascii_lowercase();

    let mut components = lower.split('/').peekable();
    while let Some(component) = components.next() {
        // Only a directory component counts, not a file named like one.
        if components.peek().is_some()
            && (component == "node_modules" || component == "bower_components")
        {
            return true;
        }
    }

    lower.contains("atom.asar") || lower.contains("electron.asar")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sanitize_backslashes() {
        assert_eq!(sanitize_path("C:\\Users\\dev\\app.js"), "C:/Users/dev/app.js");
        assert_eq!(sanitize_path("/already/fine.js"), "/already/fine.js");
    }

    #[test]
    fn cache_key_strips_app_root() {
        let key = cache_key(
            &PathBuf::from("/home/dev/app/src/main.ts"),
            Some("/home/dev/app"),
            None,
        );
        assert_eq!(key, "/src/main.ts");
    }

    #[test]
    fn cache_key_strips_original_root_for_relocated_layout() {
        let key = cache_key(
            &PathBuf::from("/opt/shipped/src/main.ts"),
            Some("/home/dev/app"),
            Some("/opt/shipped"),
        );
        assert_eq!(key, "/src/main.ts");
    }

    #[test]
    fn cache_key_normalizes_separators() {
        let key = cache_key(
            &PathBuf::from("C:\\app\\src\\main.ts"),
            Some("C:/app"),
            None,
        );
        assert_eq!(key, "/src/main.ts");
    }

    #[test]
    fn cache_key_without_matching_root() {
        let key = cache_key(&PathBuf::from("/elsewhere/x.js"), Some("/app"), None);
        assert_eq!(key, "/elsewhere/x.js");
    }

    #[test]
    fn library_dir_detection() {
        assert!(in_library_dir(Path::new("/app/node_modules/left-pad/index.js")));
        assert!(in_library_dir(Path::new("C:\\app\\Node_Modules\\x\\y.js")));
        assert!(in_library_dir(Path::new("/app/bower_components/jquery/jquery.js")));
        assert!(in_library_dir(Path::new("/opt/app/electron.asar/renderer/init.js")));
        assert!(!in_library_dir(Path::new("/app/src/node_modules.ts")));
        assert!(!in_library_dir(Path::new("/app/src/main.ts")));
    }
}
