use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::error::ListLoadError;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Filter,
    Block,
}

impl ListKind {
    pub fn name(self) -> &'static str {
        match self {
            ListKind::Filter => "filter list",
            ListKind::Block => "block list",
        }
    }
}

/// An ordered set of domain fragments, built once at startup and only read
/// afterwards.
///
/// Matching is plain byte containment: `"notexample.com"` matches the entry
/// `"example.com"`. Entries are neither label-aware nor case-folded.
#[derive(Debug, Default, Clone)]
pub struct DomainList {
    entries: Vec<String>,
}

impl DomainList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self, host: &str) -> bool {
        self.entries.iter().any(|entry| host.contains(entry.as_str()))
    }

    /// Reads one entry per line. A missing file yields an empty list; any
    /// other failure aborts.
    pub fn load(path: impl AsRef<Path>, kind: ListKind) -> Result<Self, ListLoadError> {
        let path = path.as_ref();
        let io_err = |source: io::Error| ListLoadError::Io {
            kind: kind.name(),
            path: path.to_path_buf(),
            source,
        };

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("No {} at {:?}, continuing without it", kind.name(), path);
                return Ok(Self::default());
            }
            Err(e) => return Err(io_err(e)),
        };

        let list = Self::from_reader(BufReader::with_capacity(BUFFER_SIZE, file)).map_err(io_err)?;

        if list.is_empty() {
            tracing::info!("{} {:?} has no entries", kind.name(), path);
        } else {
            tracing::info!("Loaded {}: {} entries from {:?}", kind.name(), list.len(), path);
        }

        Ok(list)
    }

    fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut entries = Vec::new();

        for line in reader.split(b'\n') {
            let line = line?;
            if let Some(entry) = Self::parse_line(&line) {
                entries.push(String::from_utf8_lossy(entry).into_owned());
            }
        }

        Ok(Self::new(entries))
    }

    // Works on raw bytes so an odd encoding in a comment cannot fail the load.
    // An empty entry would be contained in every host.
    fn parse_line(line: &[u8]) -> Option<&[u8]> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() || line.starts_with(b"#") {
            return None;
        }
        Some(line)
    }
}

/// The two startup lists, consulted independently for each tunnel.
#[derive(Debug, Default)]
pub struct DomainFilter {
    filter: DomainList,
    block: DomainList,
}

impl DomainFilter {
    pub fn new(filter: DomainList, block: DomainList) -> Self {
        Self { filter, block }
    }

    pub fn load(filter_path: &Path, block_path: &Path) -> Result<Self, ListLoadError> {
        Ok(Self::new(
            DomainList::load(filter_path, ListKind::Filter)?,
            DomainList::load(block_path, ListKind::Block)?,
        ))
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.block.matches(host)
    }

    pub fn should_fragment(&self, host: &str) -> bool {
        self.filter.matches(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_substring_match() {
        let list = DomainList::new(["example.com"]);
        assert!(list.matches("www.example.com"));
        assert!(list.matches("example.com"));
        assert!(!list.matches("other.org"));
    }

    #[test]
    fn test_match_is_not_label_aware() {
        let list = DomainList::new(["example.com"]);
        assert!(list.matches("notexample.com"));
        assert!(list.matches("example.com.evil.net"));
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let list = DomainList::new(["example.com"]);
        assert!(!list.matches("WWW.EXAMPLE.COM"));
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let list = DomainList::default();
        assert!(!list.matches("example.com"));
        assert!(!list.matches(""));
    }

    #[test]
    fn test_order_does_not_change_result() {
        let a = DomainList::new(["youtube", "googlevideo", "ytimg"]);
        let b = DomainList::new(["ytimg", "googlevideo", "youtube"]);
        for host in ["rr1.googlevideo.com", "i.ytimg.com", "example.org"] {
            assert_eq!(a.matches(host), b.matches(host));
        }
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let input = "# video\nyoutube.com\n\n#ytimg.com\ngooglevideo.com\r\n";
        let list = DomainList::from_reader(Cursor::new(input)).unwrap();
        assert_eq!(list.entries, vec!["youtube.com", "googlevideo.com"]);
    }

    #[test]
    fn test_non_utf8_comment_is_skipped() {
        let input: &[u8] = b"# caf\xe9 comment\nyoutube\n";
        let list = DomainList::from_reader(Cursor::new(input)).unwrap();
        assert_eq!(list.entries, vec!["youtube"]);
    }

    #[test]
    fn test_non_utf8_entry_is_decoded_lossily() {
        let input: &[u8] = b"caf\xe9.example\r\nytimg\n";
        let list = DomainList::from_reader(Cursor::new(input)).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.matches("ytimg.com"));
        assert!(!list.matches("cafe.example"));
    }

    #[test]
    fn test_load_file_with_latin1_comment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"# caf\xe9 comment\nyoutube\n").unwrap();

        let list = DomainList::load(file.path(), ListKind::Filter).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.matches("www.youtube.com"));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let list = DomainList::load(dir.path().join("absent.txt"), ListKind::Block).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_load_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = DomainList::load(dir.path(), ListKind::Filter);
        assert!(err.is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# blocked").unwrap();
        writeln!(file, "ads.example").unwrap();
        writeln!(file, "tracker").unwrap();

        let list = DomainList::load(file.path(), ListKind::Block).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.matches("cdn.tracker.net"));
    }

    #[test]
    fn test_filter_lists_are_independent() {
        let filter = DomainFilter::new(DomainList::new(["youtube"]), DomainList::new(["ads"]));
        assert!(filter.should_fragment("www.youtube.com"));
        assert!(!filter.is_blocked("www.youtube.com"));
        assert!(filter.is_blocked("ads.example"));
        assert!(!filter.should_fragment("ads.example"));
    }
}
