//! Content classification and fingerprinting.
//!
//! [`classify`] is a pure function of a file's bytes and path: it detects the
//! text encoding (UTF-8, then UTF-16LE), computes a content digest that is
//! stable across encodings for text files, and applies the minification,
//! embedded-source-map, and vendored-path heuristics that drive passthrough
//! handling in the host.

use std::path::Path;

use kiln_common::{paths, ContentHash};
use serde::{Deserialize, Serialize};

/// Number of leading bytes sampled for encoding detection.
const ENCODING_SAMPLE_LEN: usize = 4096;

/// Number of leading characters sampled for the minification heuristic.
const MINIFY_SAMPLE_LEN: usize = 1024;

/// Average line length above which content is considered minified.
const MINIFIED_LINE_LEN: f64 = 80.0;

/// Trailing-line marker indicating an embedded source map reference.
const SOURCE_MAP_MARKER: &str = "sourceMappingURL";

/// The hash and classification computed for a file's content.
///
/// A fingerprint is immutable once computed: when a file's mtime or size
/// changes, the change cache replaces the whole record rather than mutating
/// it. Serialized as the `info` member of a change-cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFingerprint {
    /// Content hash: over raw bytes for binary files, over the UTF-8
    /// re-encoding of the decoded text otherwise.
    #[serde(rename = "hash")]
    pub digest: ContentHash,

    /// No viable text encoding was detected.
    pub is_binary: bool,

    /// Average line length suggests the content is already minified.
    pub is_minified: bool,

    /// The path lies under a vendored/library directory; shipped verbatim.
    pub is_library_code: bool,

    /// The trailing line carries a source-map reference.
    pub has_source_map: bool,
}

impl FileFingerprint {
    /// Returns `true` if the file should be stored verbatim instead of being
    /// handed to a transform.
    pub fn should_passthrough(&self) -> bool {
        self.is_minified || self.is_library_code || self.has_source_map || self.is_binary
    }
}

/// A file's decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContents {
    /// Decoded source text.
    Text(String),
    /// Raw bytes of a binary file.
    Binary(Vec<u8>),
}

impl FileContents {
    /// The decoded text, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContents::Text(text) => Some(text),
            FileContents::Binary(_) => None,
        }
    }

    /// The payload as bytes (UTF-8 for text).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContents::Text(text) => text.as_bytes(),
            FileContents::Binary(bytes) => bytes,
        }
    }

    /// Consumes the payload into bytes (UTF-8 for text).
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FileContents::Text(text) => text.into_bytes(),
            FileContents::Binary(bytes) => bytes,
        }
    }

    /// Wraps raw bytes, decoding to text when they are valid UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => FileContents::Text(text),
            Err(err) => FileContents::Binary(err.into_bytes()),
        }
    }
}

/// Classifies a file's bytes: fingerprint plus the decoded payload.
///
/// Pure function of bytes and path; the path is consulted only for the
/// vendored-directory heuristic.
pub fn classify(path: &Path, bytes: Vec<u8>) -> (FileFingerprint, FileContents) {
    let is_library_code = paths::in_library_dir(path);

    match decode_text(&bytes) {
        Some(text) => {
            let fingerprint = FileFingerprint {
                digest: ContentHash::from_text(&text),
                is_binary: false,
                is_minified: contents_are_minified(&text),
                is_library_code,
                has_source_map: has_embedded_source_map(&text),
            };
            (fingerprint, FileContents::Text(text))
        }
        None => {
            let fingerprint = FileFingerprint {
                digest: ContentHash::from_bytes(&bytes),
                is_binary: true,
                is_minified: false,
                is_library_code,
                has_source_map: false,
            };
            (fingerprint, FileContents::Binary(bytes))
        }
    }
}

/// Attempts to decode bytes as text, trying UTF-8 then UTF-16LE.
///
/// A candidate encoding is scored on a sample of the leading bytes and
/// rejected when the decoded sample reads like a misdecode (too many control
/// characters, or too few spaces). Returns `None` when no candidate passes,
/// which classifies the file as binary.
fn decode_text(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let sample = &bytes[..bytes.len().min(ENCODING_SAMPLE_LEN)];

    if !looks_misdecoded(&String::from_utf8_lossy(sample)) {
        return Some(String::from_utf8_lossy(bytes).into_owned());
    }
    if !looks_misdecoded(&decode_utf16_le(sample)) {
        return Some(decode_utf16_le(bytes));
    }

    None
}

/// Lossily decodes little-endian UTF-16; a trailing odd byte is dropped.
fn decode_utf16_le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Scores a decoded sample for control-character density.
///
/// The threshold scales with sample length: 2 under 64 chars, 4 under 512,
/// 8 above. Replacement characters from lossy decoding count as control
/// characters. A sample with fewer spaces than the threshold is also
/// rejected; random bytes misread as UTF-16 rarely land on U+0020.
fn looks_misdecoded(sample: &str) -> bool {
    let mut control_count = 0usize;
    let mut space_count = 0usize;

    let length = sample.chars().count();
    let threshold = if length > 512 {
        8
    } else if length > 64 {
        4
    } else {
        2
    };

    for c in sample.chars() {
        let code = c as u32;
        if code < 0x08 || (0x0E..0x20).contains(&code) || c == char::REPLACEMENT_CHARACTER {
            control_count += 1;
        }
        if c == ' ' {
            space_count += 1;
        }
        if control_count > threshold {
            return true;
        }
    }

    space_count < threshold
}

/// Heuristic: average line length over the leading sample of the content.
fn contents_are_minified(text: &str) -> bool {
    let mut length = 0usize;
    let mut newline_count = 0usize;

    for c in text.chars().take(MINIFY_SAMPLE_LEN) {
        length += 1;
        if c == '\n' {
            newline_count += 1;
        }
    }

    if newline_count == 0 {
        return length > MINIFIED_LINE_LEN as usize;
    }

    length as f64 / newline_count as f64 > MINIFIED_LINE_LEN
}

/// Returns `true` if the last `sourceMappingURL` marker sits on the trailing
/// line of the content.
fn has_embedded_source_map(text: &str) -> bool {
    let trimmed = text.trim_end();
    match (trimmed.rfind(SOURCE_MAP_MARKER), trimmed.rfind('\n')) {
        (Some(marker), Some(newline)) => marker > newline,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn classify_at(path: &str, bytes: &[u8]) -> (FileFingerprint, FileContents) {
        classify(&PathBuf::from(path), bytes.to_vec())
    }

    #[test]
    fn plain_utf8_source_is_text() {
        let source = "fn main() {\n    println!(\"hello\");\n}\n";
        let (fp, contents) = classify_at("/app/src/main.js", source.as_bytes());
        assert!(!fp.is_binary);
        assert!(!fp.is_minified);
        assert!(!fp.has_source_map);
        assert_eq!(contents.as_text(), Some(source));
    }

    #[test]
    fn utf16_source_decodes_and_hashes_like_utf8() {
        let source = "let x = 1;\nlet y = 2;\nconsole.log(x + y);\n";
        let utf16: Vec<u8> = source
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();

        let (fp16, contents) = classify_at("/app/a.js", &utf16);
        let (fp8, _) = classify_at("/app/a.js", source.as_bytes());

        assert!(!fp16.is_binary);
        assert_eq!(contents.as_text(), Some(source));
        assert_eq!(
            fp16.digest, fp8.digest,
            "digest is over the decoded text, independent of encoding"
        );
    }

    #[test]
    fn random_bytes_are_binary() {
        let bytes: Vec<u8> = (0..512u32).map(|i| (i * 7 % 251) as u8).collect();
        let (fp, contents) = classify_at("/app/logo.png", &bytes);
        assert!(fp.is_binary);
        assert!(matches!(contents, FileContents::Binary(_)));
        assert_eq!(fp.digest, ContentHash::from_bytes(&bytes));
    }

    #[test]
    fn empty_file_is_binary() {
        let (fp, _) = classify_at("/app/empty", b"");
        assert!(fp.is_binary);
    }

    #[test]
    fn single_long_line_is_minified() {
        let source = format!("var a=1;{}", "a=a+1;".repeat(40));
        let (fp, _) = classify_at("/app/bundle.js", source.as_bytes());
        assert!(fp.is_minified);
    }

    #[test]
    fn long_average_lines_are_minified() {
        let line = "x".repeat(200);
        let source = format!("{line}\n{line}\n{line}\n");
        let (fp, _) = classify_at("/app/bundle.js", source.as_bytes());
        assert!(fp.is_minified);
    }

    #[test]
    fn short_file_is_not_minified() {
        let (fp, _) = classify_at("/app/tiny.js", b"let x = 1;");
        assert!(!fp.is_minified);
    }

    #[test]
    fn trailing_source_map_detected() {
        let source = "let x = 1;\nconsole.log(x);\n//# sourceMappingURL=a.js.map\n";
        let (fp, _) = classify_at("/app/a.js", source.as_bytes());
        assert!(fp.has_source_map);
    }

    #[test]
    fn source_map_mentioned_mid_file_is_ignored() {
        let source = "// docs mention sourceMappingURL= here\nlet x = 1;\nconsole.log(x);\n";
        let (fp, _) = classify_at("/app/a.js", source.as_bytes());
        assert!(!fp.has_source_map);
    }

    #[test]
    fn vendored_path_flags_library_code() {
        let (fp, _) = classify_at("/app/node_modules/dep/index.js", b"module.exports = 1;\n");
        assert!(fp.is_library_code);
        assert!(fp.should_passthrough());
    }

    #[test]
    fn passthrough_predicate_covers_all_flags() {
        let base = FileFingerprint {
            digest: ContentHash::from_bytes(b"x"),
            is_binary: false,
            is_minified: false,
            is_library_code: false,
            has_source_map: false,
        };
        assert!(!base.should_passthrough());
        for field in 0..4 {
            let mut fp = base.clone();
            match field {
                0 => fp.is_binary = true,
                1 => fp.is_minified = true,
                2 => fp.is_library_code = true,
                _ => fp.has_source_map = true,
            }
            assert!(fp.should_passthrough());
        }
    }

    #[test]
    fn from_bytes_prefers_text() {
        assert!(matches!(
            FileContents::from_bytes(b"plain".to_vec()),
            FileContents::Text(_)
        ));
        assert!(matches!(
            FileContents::from_bytes(vec![0xff, 0xfe, 0x00]),
            FileContents::Binary(_)
        ));
    }
}
