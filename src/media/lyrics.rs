//! LRC lyric parsing and playback-synchronised line tracking

/// One timed lyric line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricLine {
    pub time_ms: u64,
    pub text: String,
}

/// Parse LRC text into lines sorted by timestamp
///
/// A line may carry several `[mm:ss.xx]` tags before its text; each tag
/// yields its own entry. Metadata tags such as `[ti:...]` and lines without
/// text are skipped.
pub fn parse_lrc(text: &str) -> Vec<LyricLine> {
    let mut lines = Vec::new();

    for raw in text.lines() {
        let mut rest = raw.trim_end_matches('\r');
        let mut timestamps = Vec::new();

        while let Some(tagged) = rest.strip_prefix('[') {
            let Some(close) = tagged.find(']') else {
                break;
            };
            if let Some(ms) = parse_timestamp(&tagged[..close]) {
                timestamps.push(ms);
            }
            rest = &tagged[close + 1..];
        }

        let content = rest.trim();
        if content.is_empty() {
            continue;
        }
        lines.extend(timestamps.into_iter().map(|time_ms| LyricLine {
            time_ms,
            text: content.to_string(),
        }));
    }

    lines.sort_by_key(|line| line.time_ms);
    lines
}

/// Parse `mm:ss`, `mm:ss.f`, `mm:ss.ff` or `mm:ss.fff` into milliseconds
///
/// The fraction is scaled by its digit count: `.5` is 500 ms, `.27` is
/// 270 ms, `.270` is 270 ms. Digits beyond the third are ignored.
pub fn parse_timestamp(tag: &str) -> Option<u64> {
    let (minutes, seconds) = tag.split_once(':')?;
    let minutes: u64 = minutes.trim().parse().ok()?;

    let (whole, fraction) = match seconds.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (seconds, None),
    };
    let whole: u64 = whole.trim().parse().ok()?;

    let fraction_ms = match fraction {
        None => 0,
        Some(digits) => {
            let digits = digits.trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let head = &digits[..digits.len().min(3)];
            let value: u64 = head.parse().ok()?;
            match head.len() {
                1 => value * 100,
                2 => value * 10,
                _ => value,
            }
        }
    };

    Some(minutes * 60_000 + whole * 1_000 + fraction_ms)
}

/// Previous, current and next lines around the playback position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricView<'a> {
    pub previous: &'a str,
    pub current: &'a str,
    pub next: &'a str,
}

impl LyricView<'_> {
    /// Three display rows separated by newlines
    pub fn to_display_text(&self) -> String {
        format!("{}\n{}\n{}", self.previous, self.current, self.next)
    }
}

/// Forward-only cursor over sorted lyric lines
#[derive(Debug, Default)]
pub struct LyricCursor {
    lines: Vec<LyricLine>,
    index: usize,
    shown: Option<usize>,
}

impl LyricCursor {
    pub fn new(lines: Vec<LyricLine>) -> Self {
        Self {
            lines,
            index: 0,
            shown: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Timestamp of the last line (at least 1 ms), or 0 without lyrics
    pub fn total_ms(&self) -> u64 {
        self.lines.last().map_or(0, |line| line.time_ms.max(1))
    }

    /// Move to the latest line whose timestamp is at or before `position_ms`
    ///
    /// Never moves backwards. Returns a view only when the current line
    /// differs from the one returned last time.
    pub fn advance(&mut self, position_ms: u64) -> Option<LyricView<'_>> {
        if self.lines.is_empty() {
            return None;
        }
        while self.index + 1 < self.lines.len() && self.lines[self.index + 1].time_ms <= position_ms {
            self.index += 1;
        }
        if self.shown == Some(self.index) {
            return None;
        }
        self.shown = Some(self.index);

        let i = self.index;
        Some(LyricView {
            previous: if i > 0 { &self.lines[i - 1].text } else { "" },
            current: &self.lines[i].text,
            next: self.lines.get(i + 1).map_or("", |line| line.text.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_digits_normalize_to_millis() {
        assert_eq!(parse_timestamp("00:05.5"), Some(5_500));
        assert_eq!(parse_timestamp("00:05.27"), Some(5_270));
        assert_eq!(parse_timestamp("00:05.270"), Some(5_270));
        assert_eq!(parse_timestamp("00:05.05"), Some(5_050));
        assert_eq!(parse_timestamp("01:02"), Some(62_000));
        assert_eq!(parse_timestamp("00:01.2345"), Some(1_234));
    }

    #[test]
    fn test_metadata_tags_are_not_timestamps() {
        assert_eq!(parse_timestamp("ti:Song"), None);
        assert_eq!(parse_timestamp("ar:Someone"), None);
        assert_eq!(parse_timestamp("00:05."), None);
    }

    #[test]
    fn test_parse_multi_tag_lines_and_sort() {
        let lrc = "[ti:Demo]\r\n\
                   [ar:Band]\n\
                   [00:10.00][00:30.5]Chorus\n\
                   [00:01.27]Intro\n\
                   [00:20.000]\n\
                   [00:15.1] Verse \n";
        let lines = parse_lrc(lrc);
        let pairs: Vec<_> = lines.iter().map(|l| (l.time_ms, l.text.as_str())).collect();
        assert_eq!(
            pairs,
            vec![
                (1_270, "Intro"),
                (10_000, "Chorus"),
                (15_100, "Verse"),
                (30_500, "Chorus"),
            ]
        );
    }

    #[test]
    fn test_unclosed_tag_stops_tag_scan() {
        let lines = parse_lrc("[00:01.00][oops text");
        assert!(lines.is_empty());
    }

    #[test]
    fn test_cursor_is_edge_triggered_and_forward_only() {
        let mut cursor = LyricCursor::new(parse_lrc(
            "[00:01.00]one\n[00:02.00]two\n[00:03.00]three\n",
        ));
        assert_eq!(cursor.total_ms(), 3_000);

        let first = cursor.advance(0).unwrap();
        assert_eq!(first.current, "one");
        assert_eq!(first.next, "two");

        // Same line again: no update
        assert!(cursor.advance(500).is_none());

        let second = cursor.advance(2_100).unwrap();
        assert_eq!(second.to_display_text(), "one\ntwo\nthree");

        // Going back in time never rewinds the cursor
        assert!(cursor.advance(1_000).is_none());

        let last = cursor.advance(10_000).unwrap();
        assert_eq!(last.previous, "two");
        assert_eq!(last.current, "three");
        assert_eq!(last.next, "");
    }

    #[test]
    fn test_cursor_skips_multiple_lines_in_one_step() {
        let mut cursor = LyricCursor::new(parse_lrc("[00:01]a\n[00:02]b\n[00:03]c\n[00:04]d\n"));
        cursor.advance(0);
        assert_eq!(cursor.advance(3_500).unwrap().current, "c");
    }

    #[test]
    fn test_empty_cursor() {
        let mut cursor = LyricCursor::new(Vec::new());
        assert!(cursor.is_empty());
        assert_eq!(cursor.total_ms(), 0);
        assert!(cursor.advance(1_000).is_none());
    }
}
