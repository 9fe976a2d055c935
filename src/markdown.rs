//! Telegram MarkdownV2 helpers for vendor answers.

use std::sync::LazyLock;

use regex::Regex;

/// Characters escaped in vendor text unless they touch a `|` (spoiler
/// markers are left alone).
const SOFT_SPECIALS: &str = ".-+#|{}!=()<>";
/// Everything MarkdownV2 reserves except `*`, which the Bard/Gemini
/// transform handles itself.
const ALL_SPECIALS: &str = "._-+#|{}!=()<>[]";

static MULTI_STAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*{2,}").unwrap());
static REF_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[(.*?)\]:\s?(.*?)\s"(.*?)"\n?"#).unwrap());
static CITATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\^\d+\^\]\s?").unwrap());

/// Escape MarkdownV2 specials, leaving `*`, `_`, `[`, `]`, `` ` `` and `~`
/// usable for formatting.
pub fn escape_markdown_v2(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for (i, &c) in chars.iter().enumerate() {
        let after_pipe = i > 0 && chars[i - 1] == '|';
        let before_pipe = chars.get(i + 1) == Some(&'|');
        if SOFT_SPECIALS.contains(c) && !after_pipe && !before_pipe {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape every MarkdownV2 special character except `*`.
pub fn escape_all(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        if ALL_SPECIALS.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Convert the markdown dialect Bard and Gemini answer in: a lone `*`
/// (list bullet) is escaped, `**bold**` becomes `*bold*`, everything else
/// reserved is escaped.
pub fn as_markdown(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut lone_escaped = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        let star_before = i > 0 && chars[i - 1] == '*';
        let star_after = chars.get(i + 1) == Some(&'*');
        if c == '*' && !star_before && !star_after {
            lone_escaped.push('\\');
        }
        lone_escaped.push(c);
    }
    let collapsed = MULTI_STAR.replace_all(&lone_escaped, "*");
    escape_all(&collapsed)
}

/// Rewrite Bing's reference-style footnotes as inline links.
///
/// `[1]: https://example.com "Title"` definitions are removed and every
/// `[^1^][1]` marker becomes ` [\[1\]](https://example.com)`.
pub fn inline_references(text: &str) -> String {
    let links: Vec<(String, String)> = REF_LINK
        .captures_iter(text)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    let stripped = REF_LINK.replace_all(text, "");
    let mut result = escape_markdown_v2(&stripped);

    for (label, url) in links {
        let marker = Regex::new(&format!(r"\[\^{}\^\]\[\d+\]", regex::escape(&label)));
        let Ok(marker) = marker else { continue };
        let url = url.replace('\\', "\\\\").replace(')', "\\)");
        let inline = format!(" [\\[{label}\\]]({url})");
        result = marker
            .replace_all(&result, regex::NoExpand(&inline))
            .into_owned();
    }
    result
}

/// Drop `[^1^]` citation markers.
pub fn strip_citations(text: &str) -> String {
    CITATION.replace_all(text, "").into_owned()
}

/// Split `message` into numbered parts of at most `max_len` UTF-16 units,
/// the unit Telegram measures message length in.
///
/// Each part reads `"{header}: {i} of {n}\n{chunk}"`. A chunk never ends in
/// an unpaired escape backslash.
pub fn split_long_message(message: &str, header: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(2);
    let chars: Vec<char> = message.chars().collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = start;
        let mut units = 0;
        while end < chars.len() && units + chars[end].len_utf16() <= max_len {
            units += chars[end].len_utf16();
            end += 1;
        }
        if end < chars.len() {
            let trailing = chars[start..end].iter().rev().take_while(|&&c| c == '\\').count();
            if trailing % 2 == 1 && end - start > 1 {
                end -= 1;
            }
        }
        chunks.push(chars[start..end].iter().collect());
        start = end;
    }

    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("{header}: {} of {total}\n{chunk}", i + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_basic() {
        assert_eq!(escape_markdown_v2("Hi. (x) 1+1=2!"), r"Hi\. \(x\) 1\+1\=2\!");
        assert_eq!(escape_markdown_v2("*bold* _it_"), "*bold* _it_");
    }

    #[test]
    fn test_escape_leaves_spoilers() {
        assert_eq!(escape_markdown_v2("||secret||"), "||secret||");
        assert_eq!(escape_markdown_v2("a | b"), r"a \| b");
        assert_eq!(escape_markdown_v2("x|.|y"), r"x\|.\|y");
    }

    #[test]
    fn test_as_markdown() {
        assert_eq!(as_markdown("**Rust** is fast."), r"*Rust* is fast\.");
        assert_eq!(as_markdown("* item one"), r"\* item one");
        assert_eq!(as_markdown("see [docs](x_y)"), r"see \[docs\]\(x\_y\)");
    }

    #[test]
    fn test_inline_references() {
        let text = "[1]: https://a.example/page \"Page A\"\n\
                    [2]: https://b.example \"Page B\"\n\
                    Rust is great[^1^][1] and safe[^2^][2].";
        let result = inline_references(text);
        assert!(!result.contains("Page A"));
        assert!(result.contains(r" [\[1\]](https://a.example/page)"));
        assert!(result.contains(r" [\[2\]](https://b.example)"));
        assert!(result.ends_with(r"\."));
    }

    #[test]
    fn test_strip_citations() {
        assert_eq!(strip_citations("Yes[^1^] it is[^12^] true"), "Yes it is true");
    }

    #[test]
    fn test_split_short_message_is_single_part() {
        let parts = split_long_message("hello", "Bing", 4000);
        assert_eq!(parts, vec!["Bing: 1 of 1\nhello"]);
    }

    #[test]
    fn test_split_counts_parts_exactly() {
        let message = "a".repeat(10);
        let parts = split_long_message(&message, "H", 5);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "H: 1 of 2\naaaaa");
        assert_eq!(parts[1], "H: 2 of 2\naaaaa");
    }

    #[test]
    fn test_split_respects_multibyte_chars() {
        let message = "żółw".repeat(3);
        let parts = split_long_message(&message, "H", 5);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].ends_with("żółwż"));
    }

    #[test]
    fn test_split_counts_utf16_units() {
        let message = "😀".repeat(5);
        let parts = split_long_message(&message, "H", 4);
        assert_eq!(parts.len(), 3);
        for part in &parts {
            let body = part.split_once('\n').unwrap().1;
            assert!(body.encode_utf16().count() <= 4, "{part}");
        }
        assert!(parts[2].ends_with("\n😀"));
    }

    #[test]
    fn test_split_never_ends_with_unpaired_backslash() {
        let message = r"abcd\.efgh";
        let parts = split_long_message(message, "H", 5);
        assert!(parts[0].ends_with("abcd"));
        assert!(parts[1].contains(r"\.efg"));
        for part in &parts {
            let body = part.split_once('\n').unwrap().1;
            let trailing = body.chars().rev().take_while(|&c| c == '\\').count();
            assert_eq!(trailing % 2, 0, "{part}");
        }
    }
}
