// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! `sanitizeFilename`: strips characters that are illegal (or awkward) in
//! filenames on at least one common filesystem, and caps length.

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_LEN: usize = 200;

/// Returns `name` with every character in [`FORBIDDEN`] removed and the
/// result truncated to [`MAX_LEN`] characters.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !FORBIDDEN.contains(c)).collect();
    if cleaned.chars().count() <= MAX_LEN {
        cleaned
    } else {
        cleaned.chars().take(MAX_LEN).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_forbidden_characters() {
        let out = sanitize_filename(r#"a<b>c:d"e/f\g|h?i*j"#);
        assert_eq!(out, "abcdefghij");
        for c in FORBIDDEN {
            assert!(!out.contains(*c));
        }
    }

    #[test]
    fn caps_length() {
        let long = "x".repeat(500);
        let out = sanitize_filename(&long);
        assert_eq!(out.chars().count(), MAX_LEN);
    }

    #[test]
    fn leaves_ordinary_names_alone() {
        assert_eq!(sanitize_filename("Some Video Title (2024)"), "Some Video Title (2024)");
    }
}
