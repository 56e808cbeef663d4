// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Upload filename sanitization and content-type detection.
//!
//! The client-supplied content type is ignored. The type is sniffed from
//! the leading bytes and must be one of those [`ALLOWED_TYPES`] lists for
//! the filename's extension.

use unicode_normalization::UnicodeNormalization;

/// Maximum sanitized filename length, in characters.
pub const MAX_FILENAME_CHARS: usize = 200;

/// Name used when nothing usable is left after sanitizing.
pub const FALLBACK_FILENAME: &str = "attachment";

/// Bytes inspected when deciding whether a file is text.
const TEXT_SNIFF_LEN: usize = 512;

const TEXT: &[&str] = &["text/plain"];

/// Office documents are zip containers and may sniff as either.
const DOCX: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/zip",
];
const XLSX: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/zip",
];
const PPTX: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/zip",
];
const ODT: &[&str] = &["application/vnd.oasis.opendocument.text", "application/zip"];
const ODS: &[&str] = &["application/vnd.oasis.opendocument.spreadsheet", "application/zip"];

/// Allowed extensions and the sniffed types each may carry.
pub const ALLOWED_TYPES: &[(&str, &[&str])] = &[
    ("pdf", &["application/pdf"]),
    ("txt", TEXT),
    ("md", TEXT),
    ("csv", TEXT),
    ("json", TEXT),
    ("png", &["image/png"]),
    ("jpg", &["image/jpeg"]),
    ("jpeg", &["image/jpeg"]),
    ("gif", &["image/gif"]),
    ("webp", &["image/webp"]),
    ("zip", &["application/zip"]),
    ("docx", DOCX),
    ("xlsx", XLSX),
    ("pptx", PPTX),
    ("odt", ODT),
    ("ods", ODS),
];

/// Reduce an uploaded filename to something safe to store and to put in a
/// MIME header.
pub fn sanitize_filename(raw: &str) -> String {
    let normalized: String = raw.nfc().collect();

    // Keep only the last path component, whichever separator was used
    let base = normalized
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();

    if cleaned.is_empty() {
        return FALLBACK_FILENAME.to_string();
    }
    truncate_keeping_extension(cleaned, MAX_FILENAME_CHARS)
}

fn truncate_keeping_extension(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.chars().count() < max / 2 => {
            let keep = max - ext.chars().count() - 1;
            let stem: String = stem.chars().take(keep).collect();
            format!("{stem}.{ext}")
        }
        _ => name.chars().take(max).collect(),
    }
}

/// Lowercased extension, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn mime_types_for(ext: &str) -> Option<&'static [&'static str]> {
    ALLOWED_TYPES
        .iter()
        .find(|(allowed, _)| *allowed == ext)
        .map(|(_, mimes)| *mimes)
}

pub fn is_allowed_extension(ext: &str) -> bool {
    mime_types_for(ext).is_some()
}

/// Whether sniffed `mime` is acceptable for a file named with `ext`.
pub fn mime_matches_extension(ext: &str, mime: &str) -> bool {
    mime_types_for(ext).is_some_and(|mimes| mimes.contains(&mime))
}

/// Detect a content type from the file's leading bytes.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type();
    }
    if looks_like_text(data) {
        return "text/plain";
    }
    "application/octet-stream"
}

fn looks_like_text(data: &[u8]) -> bool {
    let head = &data[..data.len().min(TEXT_SNIFF_LEN)];
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // A multi-byte character cut at the sniff boundary is still text
        Err(e) => e.error_len().is_none(),
    }
}
