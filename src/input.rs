use crate::error::InputError;
use crate::record::Record;
use anyhow::Context;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One `address:secret` list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    /// File stem, used to name the per-source outputs
    pub name: String,
    pub path: PathBuf,
}

/// All `*.txt` files in `input_dir` except the proxy list, sorted by name.
pub fn discover_sources(input_dir: &Path, proxy_file: &str) -> anyhow::Result<Vec<InputSource>> {
    let entries = std::fs::read_dir(input_dir)
        .with_context(|| format!("Failed to read input directory: {}", input_dir.display()))?;

    let mut sources = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(proxy_file) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            log::warn!("Skipping input file with non-UTF-8 name: {}", path.display());
            continue;
        };
        sources.push(InputSource {
            name: name.to_string(),
            path,
        });
    }
    sources.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sources)
}

/// Number of non-blank, non-comment lines across the sources, for progress ETA.
pub fn count_candidates(sources: &[InputSource]) -> anyhow::Result<usize> {
    let mut total = 0;
    for source in sources {
        let file = File::open(&source.path)
            .with_context(|| format!("Failed to open input file: {}", source.path.display()))?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        while let Some(line) = read_line_lossy(&mut reader, &mut buf)
            .with_context(|| format!("Failed to read input file: {}", source.path.display()))?
        {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                total += 1;
            }
        }
    }
    Ok(total)
}

/// Next line with its terminator stripped. Invalid UTF-8 is replaced
/// rather than failing the read, so one bad byte costs at most its line.
pub(crate) fn read_line_lossy<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(source: &str, line_no: usize, line: &str) -> Option<Result<Record, InputError>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let Some((address, secret)) = line.split_once(':') else {
        return Some(Err(InputError::MissingSeparator {
            file: source.to_string(),
            line: line_no,
        }));
    };
    if address.trim().is_empty() {
        return Some(Err(InputError::EmptyAddress {
            file: source.to_string(),
            line: line_no,
        }));
    }
    Some(Ok(Record::new(address, secret.trim(), source)))
}

struct OpenSource {
    name: String,
    reader: BufReader<File>,
    buf: Vec<u8>,
    line_no: usize,
}

/// Lazy record stream over a list of sources, one file open at a time.
///
/// Restart by building a new reader over the same sources.
pub struct InputReader {
    pending: std::vec::IntoIter<InputSource>,
    current: Option<OpenSource>,
}

impl InputReader {
    pub fn new(sources: Vec<InputSource>) -> Self {
        Self {
            pending: sources.into_iter(),
            current: None,
        }
    }

    fn open_next(&mut self) -> Option<Result<(), InputError>> {
        let source = self.pending.next()?;
        log::info!("Reading {}", source.path.display());
        match File::open(&source.path) {
            Ok(file) => {
                self.current = Some(OpenSource {
                    name: source.name,
                    reader: BufReader::new(file),
                    buf: Vec::new(),
                    line_no: 0,
                });
                Some(Ok(()))
            }
            Err(e) => Some(Err(InputError::Unreadable {
                file: source.name,
                reason: e.to_string(),
            })),
        }
    }
}

impl Iterator for InputReader {
    type Item = Result<Record, InputError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(current) = self.current.as_mut() else {
                match self.open_next()? {
                    Ok(()) => continue,
                    Err(e) => return Some(Err(e)),
                }
            };

            match read_line_lossy(&mut current.reader, &mut current.buf) {
                Ok(Some(line)) => {
                    current.line_no += 1;
                    if let Some(parsed) = parse_line(&current.name, current.line_no, &line) {
                        return Some(parsed);
                    }
                }
                Err(e) => {
                    let err = InputError::Unreadable {
                        file: current.name.clone(),
                        reason: e.to_string(),
                    };
                    self.current = None;
                    return Some(Err(err));
                }
                Ok(None) => self.current = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let record = parse_line("list", 1, "a@x.com:p1").unwrap().unwrap();
        assert_eq!(record.address, "a@x.com");
        assert_eq!(record.secret, "p1");
        assert_eq!(record.source, "list");

        // Only the first colon separates
        let record = parse_line("list", 2, "b@x.com:pa:ss").unwrap().unwrap();
        assert_eq!(record.secret, "pa:ss");

        let record = parse_line("list", 3, "bad@@nodomain:p3").unwrap().unwrap();
        assert_eq!(record.address, "bad@@nodomain");

        assert!(parse_line("list", 4, "   ").is_none());
        assert!(parse_line("list", 5, "# header").is_none());
        assert_eq!(
            parse_line("list", 6, "no-separator").unwrap().unwrap_err(),
            InputError::MissingSeparator {
                file: "list".to_string(),
                line: 6
            }
        );
        assert!(matches!(
            parse_line("list", 7, ":secret").unwrap(),
            Err(InputError::EmptyAddress { .. })
        ));
    }

    #[test]
    fn test_discover_skips_proxy_file_and_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::write(dir.path().join("proxies.txt"), "").unwrap();
        std::fs::write(dir.path().join("notes.md"), "").unwrap();

        let names: Vec<String> = discover_sources(dir.path(), "proxies.txt")
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_reader_streams_across_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a@x.com:p1\n\n# c\nbroken\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b@y.com:p2\n").unwrap();

        let sources = discover_sources(dir.path(), "proxies.txt").unwrap();
        let items: Vec<_> = InputReader::new(sources).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().source, "a");
        assert_eq!(
            items[1].as_ref().unwrap_err(),
            &InputError::MissingSeparator {
                file: "a".to_string(),
                line: 4
            }
        );
        assert_eq!(items[2].as_ref().unwrap().address, "b@y.com");
    }

    #[test]
    fn test_invalid_utf8_costs_only_its_own_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("list.txt"),
            b"a@x.com:p1\nb@x.com:p\xff\xfe\r\nc@x.com:p3\nd@x.com:p4",
        )
        .unwrap();

        let sources = discover_sources(dir.path(), "proxies.txt").unwrap();
        assert_eq!(count_candidates(&sources).unwrap(), 4);

        let records: Vec<Record> = InputReader::new(sources)
            .collect::<Result<_, _>>()
            .unwrap();
        let addresses: Vec<&str> = records.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["a@x.com", "b@x.com", "c@x.com", "d@x.com"]);
        assert_eq!(records[1].secret, "p\u{fffd}\u{fffd}");
        assert_eq!(records[3].secret, "p4");
    }
}
