use once_cell::sync::Lazy;
use regex::Regex;

/// Telegram's per-message limit, in characters
pub const MESSAGE_LIMIT: usize = 4096;

/// Room kept for closing tags appended to a fragment
const CLOSING_RESERVE: usize = "</pre></code></b></i>".len();

static RE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(/?)(pre|code|b|i)(?:\s[^>]*)?>").unwrap());

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

/// Moves a cut back so it does not land inside a tag or an entity
fn safe_cut(text: &str, cut: usize) -> usize {
    let head = &text[..cut];
    let mut cut = cut;
    if let Some(lt) = head.rfind('<') {
        if head[lt..].find('>').is_none() {
            cut = lt;
        }
    }
    let head = &text[..cut];
    if let Some(amp) = head.rfind('&') {
        if !head[amp..].contains(';') && cut - amp <= 8 {
            cut = amp;
        }
    }
    cut
}

/// Splits off at most `budget` characters. Returns (body, remainder).
fn take_chunk(text: &str, budget: usize) -> (&str, &str) {
    let limit = byte_offset(text, budget);
    if limit >= text.len() {
        return (text, "");
    }

    let window = &text[..limit];
    if let Some(nl) = window.rfind('\n').filter(|&i| i > 0) {
        let cut = safe_cut(text, nl);
        if cut == nl {
            return (&text[..nl], &text[nl + 1..]);
        }
    }
    if let Some(sp) = window.rfind(' ').filter(|&i| i > 0) {
        let cut = safe_cut(text, sp);
        if cut == sp {
            return (&text[..sp], &text[sp + 1..]);
        }
    }

    let cut = safe_cut(text, limit);
    let cut = if cut == 0 { limit } else { cut };
    (&text[..cut], &text[cut..])
}

/// Tags still open after `body`, given those open before it
fn open_tags_after(mut open: Vec<String>, body: &str) -> Vec<String> {
    for cap in RE_TAG.captures_iter(body) {
        let closing = !cap[1].is_empty();
        let tag = cap[2].to_string();
        if closing {
            if let Some(pos) = open.iter().rposition(|t| *t == tag) {
                open.remove(pos);
            }
        } else {
            open.push(tag);
        }
    }
    open
}

pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut fragments = Vec::new();
    let mut open: Vec<String> = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let prefix: String = open.iter().map(|t| format!("<{}>", t)).collect();
        let budget = limit
            .saturating_sub(prefix.chars().count() + CLOSING_RESERVE)
            .max(1);

        let (body, remainder) = take_chunk(rest, budget);
        let still_open = open_tags_after(open.clone(), body);
        let suffix: String = still_open
            .iter()
            .rev()
            .map(|t| format!("</{}>", t))
            .collect();

        let fragment = format!("{}{}{}", prefix, body, suffix);
        if !body.trim().is_empty() {
            fragments.push(fragment);
        }
        open = still_open;
        rest = remainder;
    }

    fragments
}
