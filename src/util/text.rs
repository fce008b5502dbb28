/// Returns true for characters that must not reach the store.
///
/// C0 controls (except tab, newline and carriage return), DEL and the C1
/// range. Feed text regularly carries stray `\x0b`/`\x0c` from CMS exports.
fn is_stripped_control(c: char) -> bool {
    match c {
        '\t' | '\n' | '\r' => false,
        c => c.is_control(),
    }
}

/// Cleans a text value extracted from feed XML.
///
/// Strips control characters, folds every run of whitespace (including
/// newlines inside a title) into one space and trims both ends.
///
/// # Examples
///
/// ```
/// use news_etl::util::clean_text;
///
/// assert_eq!(clean_text("  Breaking:\n  markets\x0b rally "), "Breaking: markets rally");
/// assert_eq!(clean_text(" \t "), "");
/// ```
pub fn clean_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;

    for c in s.chars().filter(|c| !is_stripped_control(*c)) {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }

    out
}

/// Cleans an optional value and maps blank results to `None`.
pub fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(clean_text).filter(|s| !s.is_empty())
}
