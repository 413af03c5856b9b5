//! Notification text for Telegram's HTML parse mode.

use beacon_common::types::{Release, TrackedRepo};

/// `New release for {owner}/{name}: <b>{title}</b> ({tag})\n{url}`.
///
/// All interpolated values are escaped. An empty title falls back to the tag.
pub fn format_release_message(repo: &TrackedRepo, release: &Release) -> String {
    let title = if release.title.trim().is_empty() {
        &release.tag
    } else {
        &release.title
    };

    format!(
        "New release for {}/{}: <b>{}</b> ({})\n{}",
        escape_html(&repo.owner),
        escape_html(&repo.name),
        escape_html(title),
        escape_html(&release.tag),
        escape_html(&release.url),
    )
}

/// Escape the characters Telegram's HTML mode treats as markup.
pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
