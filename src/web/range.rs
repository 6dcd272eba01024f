// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Byte-range parsing and resolution, applied by every cache-serving route
//! per `## 4.10`'s range semantics.

#[derive(Debug, Eq, PartialEq)]
pub(super) enum ParsedRange {
    /// No `Range` header; serve the whole body.
    None,
    /// `[start, end]`, inclusive, already clamped to `[0, size-1]`.
    Satisfiable(u64, u64),
    /// `start >= size` or `start > end`: the request is unsatisfiable.
    Unsatisfiable,
}

/// Parses a `Range: bytes=...` header value and resolves it against
/// `size`. Accepts `bytes=start-end`, `bytes=start-`, and `bytes=-suffix`.
pub(super) fn parse_range(header: Option<&str>, size: u64) -> ParsedRange {
    let Some(header) = header else {
        return ParsedRange::None;
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return ParsedRange::None;
    };
    // Only the first range of a (possibly multi-range) request is honored;
    // multi-range responses aren't needed by any caller in `## 4.10`.
    let spec = spec.split(',').next().unwrap_or(spec).trim();

    let (start, end) = match spec.split_once('-') {
        Some(("", suffix)) => {
            let Ok(suffix_len) = suffix.parse::<u64>() else {
                return ParsedRange::None;
            };
            if suffix_len == 0 || size == 0 {
                return ParsedRange::Unsatisfiable;
            }
            let start = size.saturating_sub(suffix_len);
            (start, size - 1)
        }
        Some((start, "")) => {
            let Ok(start) = start.parse::<u64>() else {
                return ParsedRange::None;
            };
            (start, size.saturating_sub(1))
        }
        Some((start, end)) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return ParsedRange::None;
            };
            (start, end)
        }
        None => return ParsedRange::None,
    };

    if size == 0 || start >= size || start > end {
        return ParsedRange::Unsatisfiable;
    }
    ParsedRange::Satisfiable(start, end.min(size - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_header_serves_whole_body() {
        assert_eq!(parse_range(None, 10_000), ParsedRange::None);
    }

    #[test]
    fn start_end_range() {
        assert_eq!(parse_range(Some("bytes=0-499"), 10_000), ParsedRange::Satisfiable(0, 499));
    }

    #[test]
    fn open_ended_range() {
        assert_eq!(parse_range(Some("bytes=9500-"), 10_000), ParsedRange::Satisfiable(9500, 9999));
    }

    #[test]
    fn suffix_range() {
        assert_eq!(parse_range(Some("bytes=-500"), 10_000), ParsedRange::Satisfiable(9500, 9999));
    }

    #[test]
    fn end_clamped_to_size_minus_one() {
        assert_eq!(parse_range(Some("bytes=0-999999"), 10_000), ParsedRange::Satisfiable(0, 9999));
    }

    #[test]
    fn start_past_end_of_file_is_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=10000-10500"), 10_000), ParsedRange::Unsatisfiable);
    }

    #[test]
    fn start_greater_than_end_is_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=500-100"), 10_000), ParsedRange::Unsatisfiable);
    }
}
