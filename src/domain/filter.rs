//! Size-range filtering. Pure decisions, no I/O.
//!
//! Ranges come from `filter.<kind>.<channelId>` with `filter.default.<kind>`
//! as fallback. An unparseable or missing range accepts; an unknown size
//! accepts (err on downloading).

use crate::domain::MediaKind;
use std::collections::HashMap;

/// Inclusive byte range parsed from a "min-max" string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    lo: u64,
    hi: u64,
}

impl SizeRange {
    /// Parse "min-max". Bounds are plain byte counts with an optional
    /// base-1024 suffix (k/m/g/t). Bounds are normalized so either order
    /// works. Returns None when either bound fails to parse.
    pub fn parse(s: &str) -> Option<SizeRange> {
        let (a, b) = s.split_once('-')?;
        let a = parse_bytes(a.trim())?;
        let b = parse_bytes(b.trim())?;
        Some(SizeRange {
            lo: a.min(b),
            hi: a.max(b),
        })
    }

    pub fn contains(&self, size: u64) -> bool {
        self.lo <= size && size <= self.hi
    }
}

fn parse_bytes(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let (digits, mult) = match s.as_bytes()[s.len() - 1].to_ascii_lowercase() {
        b'k' => (&s[..s.len() - 1], 1u64 << 10),
        b'm' => (&s[..s.len() - 1], 1u64 << 20),
        b'g' => (&s[..s.len() - 1], 1u64 << 30),
        b't' => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(mult)
}

/// Resolved size-filter table. Raw range strings are kept as configured;
/// parse failures fall through to accept at decision time.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    default: HashMap<MediaKind, String>,
    per_channel: HashMap<(MediaKind, String), String>,
}

impl FilterPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&mut self, kind: MediaKind, range: impl Into<String>) {
        self.default.insert(kind, range.into());
    }

    pub fn set_override(
        &mut self,
        kind: MediaKind,
        channel_id: impl Into<String>,
        range: impl Into<String>,
    ) {
        self.per_channel.insert((kind, channel_id.into()), range.into());
    }

    /// Size decision for one media kind of one message.
    pub fn accept(&self, channel_id: &str, kind: MediaKind, size: Option<u64>) -> bool {
        let Some(size) = size else {
            return true;
        };
        let range = self
            .per_channel
            .get(&(kind, channel_id.to_string()))
            .or_else(|| self.default.get(&kind));
        match range.and_then(|s| SizeRange::parse(s)) {
            Some(r) => r.contains(size),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_bytes() {
        let r = SizeRange::parse("0-1048576").unwrap();
        assert!(r.contains(0));
        assert!(r.contains(1_048_576));
        assert!(!r.contains(1_048_577));
    }

    #[test]
    fn parse_normalizes_swapped_bounds() {
        let r = SizeRange::parse("100-10").unwrap();
        assert!(r.contains(10));
        assert!(r.contains(55));
        assert!(r.contains(100));
        assert!(!r.contains(9));
    }

    #[test]
    fn parse_suffixes_are_base_1024() {
        let r = SizeRange::parse("1k-2m").unwrap();
        assert!(!r.contains(1023));
        assert!(r.contains(1024));
        assert!(r.contains(2 * 1024 * 1024));
        assert!(!r.contains(2 * 1024 * 1024 + 1));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(SizeRange::parse("abc-100"), None);
        assert_eq!(SizeRange::parse("100"), None);
        assert_eq!(SizeRange::parse(""), None);
        assert_eq!(SizeRange::parse("-"), None);
    }

    #[test]
    fn accept_without_range_or_size() {
        let policy = FilterPolicy::new();
        assert!(policy.accept("c1", MediaKind::Video, Some(5_000_000)));
        assert!(policy.accept("c1", MediaKind::Video, None));
    }

    #[test]
    fn accept_unknown_size_even_with_range() {
        let mut policy = FilterPolicy::new();
        policy.set_default(MediaKind::Photo, "0-10");
        assert!(policy.accept("c1", MediaKind::Photo, None));
    }

    #[test]
    fn default_range_excludes_oversize_video() {
        let mut policy = FilterPolicy::new();
        policy.set_default(MediaKind::Video, "0-1048576");
        assert!(!policy.accept("c1", MediaKind::Video, Some(2 * 1024 * 1024)));
        assert!(policy.accept("c1", MediaKind::Video, Some(1024)));
        // Other kinds stay unfiltered.
        assert!(policy.accept("c1", MediaKind::Photo, Some(2 * 1024 * 1024)));
    }

    #[test]
    fn channel_override_wins_over_default() {
        let mut policy = FilterPolicy::new();
        policy.set_default(MediaKind::File, "0-100");
        policy.set_override(MediaKind::File, "c2", "0-1000");
        assert!(!policy.accept("c1", MediaKind::File, Some(500)));
        assert!(policy.accept("c2", MediaKind::File, Some(500)));
    }

    #[test]
    fn unparseable_range_accepts() {
        let mut policy = FilterPolicy::new();
        policy.set_default(MediaKind::Audio, "min-max");
        assert!(policy.accept("c1", MediaKind::Audio, Some(u64::MAX)));
    }

    #[test]
    fn decision_is_idempotent() {
        let mut policy = FilterPolicy::new();
        policy.set_default(MediaKind::Video, "0-1048576");
        for size in [None, Some(0), Some(1_048_576), Some(u64::MAX)] {
            let first = policy.accept("c1", MediaKind::Video, size);
            let second = policy.accept("c1", MediaKind::Video, size);
            assert_eq!(first, second);
        }
    }
}
