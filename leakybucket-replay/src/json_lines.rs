//! Relaxed JSON Lines reader: a value may span several lines, as long as the
//! line breaks fall inside an object or array.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Bracket and string state carried from one line to the next.
#[derive(Debug, Default)]
struct Scanner {
    depth: usize,
    quoted: bool,
    escaped: bool,
}

impl Scanner {
    /// Scan a chunk of input, updating nesting depth.
    ///
    /// Fails on a closing brace or bracket with nothing open.
    fn scan(&mut self, bytes: &[u8]) -> Result<(), u8> {
        for &b in bytes {
            if self.escaped {
                self.escaped = false;
            } else if self.quoted {
                match b {
                    b'\\' => self.escaped = true,
                    b'"' => self.quoted = false,
                    _ => {}
                }
            } else {
                match b {
                    b'"' => self.quoted = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth = self.depth.checked_sub(1).ok_or(b)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn is_balanced(&self) -> bool {
        self.depth == 0 && !self.quoted
    }
}

/// Reads JSON values from a relaxed JSON Lines stream.
pub struct JsonLinesReader<R> {
    reader: R,
    line_no: usize,
}

impl<R: AsyncBufRead + Unpin> JsonLinesReader<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }

    /// Number of lines consumed so far.
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Read the next value.
    ///
    /// Returns `Ok(None)` at EOF. Blank lines between values are skipped. A value cut
    /// off by EOF is returned as is, and will fail to parse downstream.
    pub async fn next_value(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::with_capacity(256);
        let mut scanner = Scanner::default();

        loop {
            let start = buf.len();
            let n = self.reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                return Ok(if is_blank(&buf) { None } else { Some(buf) });
            }
            self.line_no += 1;

            scanner.scan(&buf[start..]).map_err(|b| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("line {}: unbalanced '{}'", self.line_no, b as char),
                )
            })?;

            if scanner.is_balanced() {
                if is_blank(&buf) {
                    buf.clear();
                    continue;
                }
                while buf.last().is_some_and(|b| b.is_ascii_whitespace()) {
                    buf.pop();
                }
                return Ok(Some(buf));
            }
        }
    }
}

fn is_blank(buf: &[u8]) -> bool {
    buf.iter().all(|b| b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn read_all(data: &[u8]) -> std::io::Result<Vec<String>> {
        let mut reader = JsonLinesReader::new(BufReader::new(data));
        let mut values = Vec::new();
        while let Some(value) = reader.next_value().await? {
            values.push(String::from_utf8(value).unwrap());
        }
        Ok(values)
    }

    #[tokio::test]
    async fn test_one_value_per_line() {
        let values = read_all(b"{\"a\": 1}\n{\"b\": 2}\n").await.unwrap();
        assert_eq!(values, vec!["{\"a\": 1}", "{\"b\": 2}"]);
    }

    #[tokio::test]
    async fn test_value_spanning_lines() {
        let values = read_all(b"{\n  \"line\": {\"raw\": \"x\"},\n  \"time\": \"t\"\n}\n{}\n")
            .await
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(
            values[0],
            "{\n  \"line\": {\"raw\": \"x\"},\n  \"time\": \"t\"\n}"
        );
    }

    #[tokio::test]
    async fn test_braces_in_strings_are_ignored() {
        let values = read_all(b"{\"raw\": \"}{ \\\" [\"}\n{\"raw\": \"ok\"}")
            .await
            .unwrap();
        assert_eq!(values, vec!["{\"raw\": \"}{ \\\" [\"}", "{\"raw\": \"ok\"}"]);
    }

    #[tokio::test]
    async fn test_blank_lines_and_eof() {
        assert!(read_all(b"").await.unwrap().is_empty());
        assert!(read_all(b"\n\n  \n").await.unwrap().is_empty());
        let values = read_all(b"\n\n{\"a\": 1}\n\n").await.unwrap();
        assert_eq!(values, vec!["{\"a\": 1}"]);
    }

    #[tokio::test]
    async fn test_unbalanced_is_error() {
        let err = read_all(b"{\"a\": 1}\n}\n").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("line 2"));
    }
}
