//! HLS attribute lists (`NAME=VALUE,NAME="quoted, value"`).
//!
//! Values keep their byte span in the source so a single attribute can be
//! replaced without re-serializing the rest of the tag.

use std::ops::Range;

/// One attribute of a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute<'a> {
    /// Attribute name.
    pub name: &'a str,
    /// Value, without surrounding quotes.
    pub value: &'a str,
    /// Whether the value was a quoted string.
    pub quoted: bool,
    span: Range<usize>,
}

/// Parsed attribute list of a single tag.
#[derive(Debug, Clone)]
pub struct AttributeList<'a> {
    source: &'a str,
    attributes: Vec<Attribute<'a>>,
}

impl<'a> AttributeList<'a> {
    /// Parse the text after the tag's colon.
    ///
    /// Parsing is lenient: a fragment without `=` is skipped and an
    /// unterminated quoted string runs to the end of the line.
    pub fn parse(source: &'a str) -> Self {
        let bytes = source.as_bytes();
        let mut attributes = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            while pos < bytes.len() && (bytes[pos] == b',' || bytes[pos] == b' ') {
                pos += 1;
            }
            let name_start = pos;
            while pos < bytes.len() && bytes[pos] != b'=' && bytes[pos] != b',' {
                pos += 1;
            }
            if pos >= bytes.len() || bytes[pos] == b',' {
                continue;
            }
            let name = source[name_start..pos].trim();
            pos += 1;

            let (span, quoted) = if bytes.get(pos) == Some(&b'"') {
                let start = pos + 1;
                let end = source[start..]
                    .find('"')
                    .map(|i| start + i)
                    .unwrap_or(bytes.len());
                pos = (end + 1).min(bytes.len());
                (start..end, true)
            } else {
                let start = pos;
                while pos < bytes.len() && bytes[pos] != b',' {
                    pos += 1;
                }
                (start..pos, false)
            };

            attributes.push(Attribute {
                name,
                value: &source[span.clone()],
                quoted,
                span,
            });
        }

        Self { source, attributes }
    }

    /// Look up an attribute value by name.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value)
    }

    /// Iterate attributes in source order.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute<'a>> {
        self.attributes.iter()
    }

    /// Source text with the value of `name` replaced by `replacement`.
    ///
    /// Returns `None` when the attribute is absent.
    pub fn replace_value(&self, name: &str, replacement: &str) -> Option<String> {
        let attr = self.attributes.iter().find(|a| a.name == name)?;
        let mut out = String::with_capacity(self.source.len() + replacement.len());
        out.push_str(&self.source[..attr.span.start]);
        out.push_str(replacement);
        out.push_str(&self.source[attr.span.end..]);
        Some(out)
    }
}
