/// Longest body GitHub accepts for issues, PRs and comments.
pub const MAX_BODY_CHARS: usize = 60_000;

const LINK_PREFIXES: [&str; 3] = ["href=\"", "](", "]: "];

/// Prepare text for a GitHub PR/issue body.
///
/// Links to github.com in markdown or HTML link positions are pointed at
/// redirect.github.com so referenced issues don't receive backlinks, then
/// the text is cut to [`MAX_BODY_CHARS`].
pub fn massage_markdown(input: &str) -> String {
    let mut text = input.to_string();
    for prefix in LINK_PREFIXES {
        text = text.replace(
            &format!("{prefix}https://github.com/"),
            &format!("{prefix}https://redirect.github.com/"),
        );
    }
    truncate_chars(text, MAX_BODY_CHARS)
}

fn truncate_chars(mut text: String, max: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
    text
}
