//! `/proc/self/maps` parsing.

use crate::types::{MemoryMapping, Protection};

/// Parse one maps line:
/// `7f0c1c000000-7f0c1c021000 r-xp 00000000 fd:01 1234   /system/lib64/libc.so`
pub fn parse_line(line: &str) -> Option<MemoryMapping> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?.as_bytes();
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    if end < start || perms.len() < 4 {
        return None;
    }

    let protection = Protection {
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        exec: perms[2] == b'x',
        private: perms[3] == b'p',
    };
    let offset = u64::from_str_radix(offset, 16).ok()?;

    // The path may contain spaces (e.g. "[anon:dalvik-main space]"), so take
    // everything after the inode column verbatim.
    let path = fields.collect::<Vec<_>>().join(" ");

    Some(MemoryMapping {
        start,
        end,
        protection,
        offset,
        path,
    })
}

pub fn parse(text: &str) -> Vec<MemoryMapping> {
    text.lines().filter_map(parse_line).collect()
}

/// Snapshot of the current process mappings.
pub fn read_self_maps() -> std::io::Result<Vec<MemoryMapping>> {
    std::fs::read_to_string("/proc/self/maps").map(|text| parse(&text))
}

/// Fold every mapping whose path ends with `suffix` into one span.
///
/// Returns `(base, size, path)` where base is the first mapping's start and
/// size reaches the end of the last one, so gaps between segments count.
pub fn span_for_suffix(mappings: &[MemoryMapping], suffix: &str) -> Option<(usize, usize, String)> {
    let mut matching = mappings
        .iter()
        .filter(|m| !m.path.is_empty() && m.path.ends_with(suffix));
    let first = matching.next()?;
    let path = first.path.clone();
    let start = first.start;
    let end = matching.fold(first.end, |end, m| end.max(m.end));
    Some((start, end - start, path))
}

/// Readable sub-ranges of `[start, end)`, clipped to the mappings.
pub fn readable_ranges(mappings: &[MemoryMapping], start: usize, end: usize) -> Vec<(usize, usize)> {
    mappings
        .iter()
        .filter(|m| m.protection.read && m.end > start && m.start < end)
        .map(|m| (m.start.max(start), m.end.min(end)))
        .collect()
}

/// True if `mapping` is backed by the module file at `path`.
///
/// Paths are compared by file name so a loader path through a symlinked
/// directory still matches; an APK-embedded library (`base.apk!/lib/...`)
/// matches the APK mapping itself.
pub fn is_backed_by(mapping: &MemoryMapping, path: &str) -> bool {
    if mapping.path.is_empty() || path.is_empty() {
        return false;
    }
    fn file_name(p: &str) -> &str {
        p.rsplit('/').next().unwrap_or(p)
    }
    mapping.path == path
        || file_name(&mapping.path) == file_name(path)
        || path.strip_prefix(mapping.path.as_str()).is_some_and(|rest| rest.starts_with('!'))
}

/// Readable sub-ranges of `[start, end)` that belong to the file at `path`.
pub fn owned_ranges(mappings: &[MemoryMapping], start: usize, end: usize, path: &str) -> Vec<(usize, usize)> {
    mappings
        .iter()
        .filter(|m| m.protection.read && m.end > start && m.start < end && is_backed_by(m, path))
        .map(|m| (m.start.max(start), m.end.min(end)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
12c00000-12e00000 rw-p 00000000 00:00 0      [anon:dalvik-main space]
7a1c000000-7a1c400000 r--p 00000000 fd:05 4242   /data/app/~~x/split_config.arm64_v8a.apk
7a1c400000-7a1c900000 r-xp 00400000 fd:05 4242   /data/app/~~x/split_config.arm64_v8a.apk
7a1c900000-7a1c904000 ---p 00000000 00:00 0
7a1c904000-7a1c908000 r-xp 00000000 fd:05 77     /data/app/~~x/lib/arm64/libother.so
7a1c908000-7a1c910000 ---p 00000000 00:00 0
7a1c910000-7a1c920000 rw-p 00910000 fd:05 4242   /data/app/~~x/split_config.arm64_v8a.apk
7b00000000-7b00001000 r-xp 00000000 fd:05 99     /system/lib64/libc.so
";

    #[test]
    fn parses_protection_offset_and_path() {
        let maps = parse(SAMPLE);
        assert_eq!(maps.len(), 8);

        let text = &maps[2];
        assert_eq!(text.start, 0x7a1c400000);
        assert_eq!(text.end, 0x7a1c900000);
        assert!(text.protection.read && text.protection.exec && !text.protection.write);
        assert!(text.protection.private);
        assert_eq!(text.offset, 0x400000);
        assert!(text.path.ends_with("split_config.arm64_v8a.apk"));

        assert_eq!(maps[0].path, "[anon:dalvik-main space]");
        assert_eq!(maps[3].path, "");
        assert!(maps[4].path.ends_with("libother.so"));
    }

    #[test]
    fn span_covers_first_to_last_segment() {
        let maps = parse(SAMPLE);
        let (base, size, path) = span_for_suffix(&maps, "split_config.arm64_v8a.apk").unwrap();
        assert_eq!(base, 0x7a1c000000);
        assert_eq!(size, 0x7a1c920000 - 0x7a1c000000);
        assert!(path.starts_with("/data/app/"));
    }

    #[test]
    fn span_for_missing_suffix_is_none() {
        let maps = parse(SAMPLE);
        assert!(span_for_suffix(&maps, "libclient.so").is_none());
    }

    #[test]
    fn readable_ranges_skip_guard_pages() {
        let maps = parse(SAMPLE);
        let ranges = readable_ranges(&maps, 0x7a1c000000, 0x7a1c920000);
        assert_eq!(
            ranges,
            vec![
                (0x7a1c000000, 0x7a1c400000),
                (0x7a1c400000, 0x7a1c900000),
                (0x7a1c904000, 0x7a1c908000),
                (0x7a1c910000, 0x7a1c920000),
            ]
        );
    }

    #[test]
    fn owned_ranges_skip_libraries_between_segments() {
        let maps = parse(SAMPLE);
        let (base, size, path) = span_for_suffix(&maps, "split_config.arm64_v8a.apk").unwrap();
        assert_eq!(
            owned_ranges(&maps, base, base + size, &path),
            vec![
                (0x7a1c000000, 0x7a1c400000),
                (0x7a1c400000, 0x7a1c900000),
                (0x7a1c910000, 0x7a1c920000),
            ]
        );
    }

    #[test]
    fn backing_file_matches_by_name_and_apk_entry() {
        let maps = parse(SAMPLE);
        let libc = &maps[7];
        assert!(is_backed_by(libc, "/system/lib64/libc.so"));
        assert!(is_backed_by(libc, "/apex/com.android.runtime/lib64/bionic/libc.so"));
        assert!(!is_backed_by(libc, "/system/lib64/libm.so"));

        let apk = &maps[1];
        assert!(is_backed_by(apk, "/data/app/~~x/split_config.arm64_v8a.apk!/lib/arm64-v8a/libclient.so"));
        assert!(!is_backed_by(apk, ""));
        assert!(!is_backed_by(&maps[3], "/data/app/~~x/split_config.arm64_v8a.apk"));
    }

    #[test]
    fn malformed_lines_are_ignored() {
        assert!(parse_line("garbage").is_none());
        assert!(parse_line("zzzz-1000 r-xp 0 0:0 0").is_none());
        assert!(parse_line("2000-1000 r-xp 0 0:0 0").is_none());
    }
}
