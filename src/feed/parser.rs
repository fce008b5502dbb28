use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;
use thiserror::Error;

use crate::util::non_blank;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Errors that make a whole feed document unusable.
///
/// Problems with a single `<item>` never surface here; those items are
/// skipped and counted in [`ParsedFeed::skipped`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// Body cannot be decoded with its declared (or the default UTF-8) encoding
    #[error("Feed text cannot be decoded: {0}")]
    Encoding(String),
    /// Body is not well-formed XML, or lacks the channel structure
    #[error("Malformed feed XML: {0}")]
    Xml(String),
    /// Well-formed XML whose root element is not `<rss>`
    #[error("Not an RSS document (root element <{0}>)")]
    NotRss(String),
    /// Empty body
    #[error("Feed body is empty")]
    Empty,
}

/// One usable `<item>` from the feed.
///
/// `title` and `link` are guaranteed non-blank. `published` keeps the raw
/// `pubDate` text; the mapper owns date interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub published: Option<String>,
    pub summary: Option<String>,
}

/// Result of parsing one feed document.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    entries: Vec<FeedEntry>,
    seen: usize,
}

impl ParsedFeed {
    /// Iterates the usable entries in document order.
    ///
    /// The iterator borrows the parsed feed, so it can be restarted by calling
    /// `entries()` again.
    pub fn entries(&self) -> std::slice::Iter<'_, FeedEntry> {
        self.entries.iter()
    }

    /// Number of `<item>` elements in the document.
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Number of items dropped as unusable.
    pub fn skipped(&self) -> usize {
        self.seen - self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses an RSS 2.0 document into entries.
///
/// The body is decoded with the encoding named in its XML declaration, UTF-8
/// when there is none. Items may be interleaved with other channel elements.
/// An unusable item (missing title or link, a repeated field, an unknown
/// entity) is skipped without affecting the others.
///
/// # Errors
///
/// Returns [`ParseError`] if the body is empty, cannot be decoded, is not
/// well-formed XML, is not rooted at `<rss>`, or has no `<channel>`. A channel
/// without items is a valid, empty feed.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let text = decode_document(bytes)?;
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut reader = Reader::from_str(&text);
    let mut walker = FeedWalker::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => walker.start(&e)?,
            Ok(Event::Empty(e)) => {
                walker.start(&e)?;
                walker.end();
            }
            Ok(Event::End(_)) => walker.end(),
            Ok(Event::Text(t)) => walker.text(t.unescape().map_err(|e| e.to_string()))?,
            Ok(Event::CData(c)) => walker.text(c.decode().map_err(|e| e.to_string()))?,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::Xml(e.to_string())),
        }
    }

    walker.finish()
}

/// Decodes the body using the encoding its XML declaration names.
fn decode_document(bytes: &[u8]) -> Result<Cow<'_, str>, ParseError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    // The declaration, when present, is the first event. A declaration that
    // claims UTF-16 on markup we could read as ASCII means UTF-8.
    let declared = match Reader::from_reader(bytes).read_event() {
        Ok(Event::Decl(decl)) => decl.encoder().map(|e| e.output_encoding()),
        _ => None,
    };

    match declared {
        Some(encoding) => quick_xml::encoding::decode(bytes, encoding)
            .map_err(|e| ParseError::Encoding(e.to_string())),
        None => std::str::from_utf8(bytes)
            .map(Cow::Borrowed)
            .map_err(|e| ParseError::Encoding(e.to_string())),
    }
}

// ============================================================================
// Document walk
// ============================================================================

/// The `<item>` children we keep. Matched on the qualified name, so
/// `<media:title>` never stands in for `<title>`.
#[derive(Debug, Clone, Copy)]
enum ItemField {
    Title,
    Link,
    PubDate,
    Description,
}

impl ItemField {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"title" => Some(ItemField::Title),
            b"link" => Some(ItemField::Link),
            b"pubDate" => Some(ItemField::PubDate),
            b"description" => Some(ItemField::Description),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            ItemField::Title => "title",
            ItemField::Link => "link",
            ItemField::PubDate => "pubDate",
            ItemField::Description => "description",
        }
    }
}

/// Text collected for the `<item>` currently open.
#[derive(Debug, Default)]
struct ItemBuilder {
    title: Option<String>,
    link: Option<String>,
    pub_date: Option<String>,
    description: Option<String>,
    /// First reason this item cannot be used.
    problem: Option<String>,
}

impl ItemBuilder {
    fn slot(&mut self, field: ItemField) -> &mut Option<String> {
        match field {
            ItemField::Title => &mut self.title,
            ItemField::Link => &mut self.link,
            ItemField::PubDate => &mut self.pub_date,
            ItemField::Description => &mut self.description,
        }
    }

    fn open(&mut self, field: ItemField) {
        let slot = self.slot(field);
        if slot.is_some() {
            self.reject(format!("repeated <{}> element", field.tag()));
        } else {
            *slot = Some(String::new());
        }
    }

    fn push_text(&mut self, field: ItemField, text: &str) {
        if let Some(value) = self.slot(field) {
            value.push_str(text);
        }
    }

    fn reject(&mut self, reason: String) {
        self.problem.get_or_insert(reason);
    }

    fn finish(self, index: usize) -> Option<FeedEntry> {
        if let Some(problem) = self.problem {
            tracing::warn!(item = index, problem = %problem, "Skipping malformed feed item");
            return None;
        }

        let title = non_blank(self.title.as_deref());
        let link = non_blank(self.link.as_deref());
        let (title, link) = match (title, link) {
            (Some(title), Some(link)) => (title, link),
            (title, link) => {
                tracing::warn!(
                    item = index,
                    missing_title = title.is_none(),
                    missing_link = link.is_none(),
                    "Skipping feed item without required fields"
                );
                return None;
            }
        };

        Some(FeedEntry {
            title,
            link,
            published: non_blank(self.pub_date.as_deref()),
            summary: non_blank(self.description.as_deref()),
        })
    }
}

/// Tracks `rss > channel > item > field` while events stream past.
#[derive(Debug, Default)]
struct FeedWalker {
    /// Qualified names of the open elements, outermost first.
    open: Vec<Vec<u8>>,
    saw_root: bool,
    saw_channel: bool,
    item: Option<ItemBuilder>,
    field: Option<ItemField>,
    seen: usize,
    entries: Vec<FeedEntry>,
}

impl FeedWalker {
    fn start(&mut self, e: &BytesStart<'_>) -> Result<(), ParseError> {
        let name = e.name().as_ref().to_vec();

        match self.open.len() {
            0 => {
                if self.saw_root {
                    return Err(ParseError::Xml("multiple root elements".to_string()));
                }
                self.saw_root = true;
                let root = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if !root.eq_ignore_ascii_case("rss") {
                    return Err(ParseError::NotRss(root));
                }
            }
            1 if name == b"channel" => self.saw_channel = true,
            2 if self.open[1] == b"channel" && name == b"item" => {
                self.seen += 1;
                self.item = Some(ItemBuilder::default());
            }
            3 => {
                if let Some(item) = self.item.as_mut() {
                    self.field = ItemField::from_name(&name);
                    if let Some(field) = self.field {
                        item.open(field);
                    }
                }
            }
            _ => {}
        }

        self.open.push(name);
        Ok(())
    }

    fn end(&mut self) {
        self.open.pop();
        match self.open.len() {
            3 => self.field = None,
            2 => {
                if let Some(item) = self.item.take() {
                    if let Some(entry) = item.finish(self.seen - 1) {
                        self.entries.push(entry);
                    }
                }
            }
            _ => {}
        }
    }

    /// Handles character data; `Err` carries an entity or decoding problem.
    fn text(&mut self, text: Result<Cow<'_, str>, String>) -> Result<(), ParseError> {
        if self.open.is_empty() {
            return match text {
                Ok(t) if t.trim().is_empty() => Ok(()),
                _ => Err(ParseError::Xml("text outside the root element".to_string())),
            };
        }

        if let (Some(item), Some(field)) = (self.item.as_mut(), self.field) {
            match text {
                Ok(t) => item.push_text(field, &t),
                Err(reason) => item.reject(reason),
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<ParsedFeed, ParseError> {
        if let Some(name) = self.open.last() {
            return Err(ParseError::Xml(format!(
                "document ends inside <{}>",
                String::from_utf8_lossy(name)
            )));
        }
        if !self.saw_root {
            return Err(ParseError::Xml("no root element".to_string()));
        }
        if !self.saw_channel {
            return Err(ParseError::Xml("missing <channel> element".to_string()));
        }

        tracing::debug!(seen = self.seen, usable = self.entries.len(), "Parsed feed");
        Ok(ParsedFeed {
            entries: self.entries,
            seen: self.seen,
        })
    }
}
