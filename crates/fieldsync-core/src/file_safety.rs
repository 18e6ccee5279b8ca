//! File safety checks for captured binaries.
//!
//! Two layers run before a binary is copied into attachment storage:
//! 1. Extension blocklist
//! 2. Magic byte detection for executables
//!
//! Both look only at the file name and the first few KiB of content, so the
//! capture pipeline never has to hold a whole photo in memory to vet it.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::defaults::FALLBACK_CONTENT_TYPE;

/// Magic byte signatures for executable files
pub const MAGIC_SIGNATURES: &[(&str, &[u8])] = &[
    ("Windows PE/MZ", &[0x4D, 0x5A]),
    ("ELF", &[0x7F, 0x45, 0x4C, 0x46]),
    ("Mach-O 32", &[0xFE, 0xED, 0xFA, 0xCE]),
    ("Mach-O 64", &[0xFE, 0xED, 0xFA, 0xCF]),
    ("Mach-O Fat", &[0xCA, 0xFE, 0xBA, 0xBE]),
    ("WebAssembly", &[0x00, 0x61, 0x73, 0x6D]),
];

/// Blocked file extensions (case-insensitive)
static BLOCKED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "scr", "pif", "com", "msi", "so", "dylib", "jar", "class", "apk", "app",
        "dmg", "pkg", "deb", "rpm", "lnk", "hta",
    ]
    .into_iter()
    .collect()
});

/// Result of file safety validation
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub allowed: bool,
    pub block_reason: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            block_reason: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            block_reason: Some(reason.into()),
        }
    }
}

/// Check a capture source by name and leading bytes.
pub fn validate_header(filename: &str, header: &[u8]) -> ValidationResult {
    if let Some((_, ext)) = filename.rsplit_once('.') {
        if BLOCKED_EXTENSIONS.contains(ext.to_lowercase().as_str()) {
            return ValidationResult::blocked(format!("File extension .{} is not allowed", ext));
        }
    }

    for (name, magic) in MAGIC_SIGNATURES {
        if header.len() >= magic.len() && &header[..magic.len()] == *magic {
            return ValidationResult::blocked(format!("Executable file detected: {}", name));
        }
    }

    ValidationResult::allowed()
}

/// Detect the content type of a capture from its magic bytes.
///
/// Falls back to the file extension, then to `image/jpeg` (camera buffers
/// without an extension are almost always JPEG).
pub fn detect_content_type(filename: &str, header: &[u8]) -> String {
    if let Some(kind) = infer::get(header) {
        return kind.mime_type().to_string();
    }

    if let Some((_, ext)) = filename.rsplit_once('.') {
        if let Some(mime) = mime_from_extension(ext) {
            return mime.to_string();
        }
    }

    FALLBACK_CONTENT_TYPE.to_string()
}

/// File extension used for the attachment-owned copy of a binary.
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/heic" => "heic",
        "image/heif" => "heif",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

fn mime_from_extension(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_HEADER: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46];
    const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_jpeg_allowed() {
        assert!(validate_header("IMG_0001.jpg", JPEG_HEADER).allowed);
    }

    #[test]
    fn test_blocked_extension() {
        let result = validate_header("photo.exe", JPEG_HEADER);
        assert!(!result.allowed);
        assert!(result.block_reason.unwrap().contains(".exe"));
    }

    #[test]
    fn test_blocked_extension_case_insensitive() {
        assert!(!validate_header("PHOTO.DLL", b"hello").allowed);
    }

    #[test]
    fn test_elf_magic_blocked() {
        let result = validate_header("camera.jpg", &[0x7F, 0x45, 0x4C, 0x46, 0x02]);
        assert!(!result.allowed);
        assert!(result.block_reason.unwrap().contains("ELF"));
    }

    #[test]
    fn test_short_header_allowed() {
        assert!(validate_header("a.jpg", &[0x4D]).allowed);
    }

    #[test]
    fn test_detect_content_type_from_magic() {
        assert_eq!(detect_content_type("noext", JPEG_HEADER), "image/jpeg");
        assert_eq!(detect_content_type("x.jpg", PNG_HEADER), "image/png");
    }

    #[test]
    fn test_detect_content_type_from_extension() {
        assert_eq!(detect_content_type("scan.heic", b"????"), "image/heic");
    }

    #[test]
    fn test_detect_content_type_fallback() {
        assert_eq!(detect_content_type("capture", b"????"), "image/jpeg");
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("application/x-unknown"), "bin");
    }
}
