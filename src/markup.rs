//! Reply-reference parsing and comment rendering.
//!
//! `find_all_replies` extracts the `>>id` mentions used to record reply
//! edges at save time. `postmarkup` turns a raw comment into trusted-safe
//! HTML: escape, line-break, then substitution passes in longest-prefix
//! order (`>>>>board`, `>>>thread`, `>>post`, `>quote`, `<quote`). The
//! pass order is a behavioral contract: a `>>>>` token must never be
//! captured by the bare `>>` rule.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::models::Id;

static RE_REPLY: Lazy<Regex> = Lazy::new(|| Regex::new(r">>(\d+)").unwrap());

static RE_PARA: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").unwrap());
static RE_BOARD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:&gt;){4}([^\s<]*)").unwrap());
static RE_THREAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:&gt;){3}(\d+)").unwrap());
static RE_POST: Lazy<Regex> = Lazy::new(|| Regex::new(r"&gt;&gt;(\d+)").unwrap());
static RE_QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"&gt;[^&\d<][^<]+").unwrap());
static RE_ORANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"&lt;[^&][^<]+").unwrap());

pub fn board_url(name: &str) -> String {
    format!("/api/v1/boards/{name}")
}

pub fn thread_url(id: Id) -> String {
    format!("/api/v1/threads/{id}")
}

pub fn post_url(id: Id) -> String {
    format!("/api/v1/posts/{id}")
}

/// Ordered `>>id` mentions in `text`: the `>>` must not be preceded by
/// another `>`. Duplicates are kept; non-numeric and overflowing tokens are
/// skipped silently.
pub fn find_all_replies(text: &str) -> Vec<Id> {
    let mut ids = Vec::new();
    let mut search = 0;
    while let Some(caps) = RE_REPLY.captures_at(text, search) {
        let m = caps.get(0).unwrap();
        if text[..m.start()].ends_with('>') {
            // Inside a longer `>` run; retry one byte further in.
            search = m.start() + 1;
            continue;
        }
        if let Ok(id) = caps[1].parse::<Id>() {
            ids.push(id);
        }
        search = m.end();
    }
    ids
}

/// Render an escaped, line-broken comment with reference links and quote
/// spans. `displayed` holds the post ids already visible on the page:
/// references to those render as same-page anchors, everything else as full
/// page links. The result is trusted HTML; callers must not re-escape it.
pub fn postmarkup(text: &str, displayed: &[Id]) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut html = linebreaks(&escape(text));
    html = RE_BOARD
        .replace_all(&html, |caps: &Captures| {
            let name = &caps[1];
            format!(r#"<a href="{}">&gt;&gt;&gt;&gt;{}</a>"#, board_url(name), name)
        })
        .into_owned();
    html = RE_THREAD
        .replace_all(&html, |caps: &Captures| match caps[1].parse::<Id>() {
            Ok(id) => format!(r#"<a href="{}">&gt;&gt;&gt;{}</a>"#, thread_url(id), id),
            Err(_) => caps[0].to_string(),
        })
        .into_owned();
    html = sub_guarded(&RE_POST, &html, |caps| {
        let id: Id = caps[1].parse().ok()?;
        let href = if displayed.contains(&id) { format!("#{id}") } else { post_url(id) };
        Some(format!(r#"<a href="{href}">&gt;&gt;{id}</a>"#))
    });
    html = sub_guarded(&RE_QUOTE, &html, |caps| {
        Some(format!(r#"<span class="quote">{}</span>"#, &caps[0]))
    });
    html = sub_guarded(&RE_ORANGE, &html, |caps| {
        Some(format!(r#"<span class="orange">{}</span>"#, &caps[0]))
    });
    html
}

/// Substitution pass that skips matches preceded by an escaped `>`. A
/// skipped span is re-scanned one byte further in, so a valid token nested
/// after a rejected one is still found.
fn sub_guarded(re: &Regex, text: &str, repl: impl Fn(&Captures) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut search = 0;
    while let Some(caps) = re.captures_at(text, search) {
        let m = caps.get(0).unwrap();
        if text[..m.start()].ends_with("&gt;") {
            search = m.start() + 1;
            continue;
        }
        match repl(&caps) {
            Some(r) => {
                out.push_str(&text[copied..m.start()]);
                out.push_str(&r);
                copied = m.end();
                search = m.end();
            }
            None => search = m.start() + 1,
        }
    }
    out.push_str(&text[copied..]);
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Paragraphs on blank lines, `<br>` on single newlines. No raw newlines
/// survive, so later passes cannot bleed across line boundaries.
fn linebreaks(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    RE_PARA
        .split(&normalized)
        .map(|para| format!("<p>{}</p>", para.replace('\n', "<br>")))
        .collect()
}
