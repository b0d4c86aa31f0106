use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"http\S+").expect("static regex compile"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<.*?>").expect("static regex compile"));
static NON_ASCII_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\x00-\x7F]+").expect("static regex compile"));

/// Cleans scraped article text before summarization.
///
/// Drops URLs and HTML tags, replaces non-ASCII runs with a space and
/// collapses all whitespace (newlines included) to single spaces.
pub fn preprocess(text: &str) -> String {
    let text = URL_RE.replace_all(text, "");
    let text = TAG_RE.replace_all(&text, "");
    let text = NON_ASCII_RE.replace_all(&text, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
