//! Rejecting sanitizer for untrusted command text.
//!
//! Only printable ASCII plus tab, line feed and carriage return survive.
//! Callers compare the sanitized text with the original and reject on any
//! difference; the cleaned string is never executed in place of the input.

use std::borrow::Cow;

/// Returns `true` for characters the sanitizer keeps.
#[must_use]
pub fn is_permitted_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r' | ' '..='~')
}

/// Removes every character that is not permitted.
///
/// Borrows the input when nothing needs to be removed, so
/// `sanitize(sanitize(x)) == sanitize(x)` holds trivially for clean text.
///
/// ```
/// use psguard::sanitize::sanitize;
///
/// assert_eq!(sanitize("Get-Date"), "Get-Date");
/// assert_eq!(sanitize("Get-\u{0}Date"), "Get-Date");
/// ```
#[must_use]
pub fn sanitize(input: &str) -> Cow<'_, str> {
    if input.chars().all(is_permitted_char) {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(input.chars().filter(|c| is_permitted_char(*c)).collect())
    }
}

/// Returns `true` if sanitizing would leave the input unchanged.
#[must_use]
pub fn is_clean(input: &str) -> bool {
    matches!(sanitize(input), Cow::Borrowed(_))
}

/// Returns the first disallowed character and its 1-based line.
#[must_use]
pub fn first_disallowed(input: &str) -> Option<(usize, char)> {
    input.lines().enumerate().find_map(|(idx, line)| {
        line.chars()
            .find(|c| !is_permitted_char(*c))
            .map(|c| (idx + 1, c))
    })
}
