use std::borrow::Cow;

/// SEC-001: Sanitizes a user- or wire-supplied label before it becomes a folder name.
///
/// Control characters (including ANSI escape bytes) are dropped, runs of
/// whitespace collapse to a single space and the result is trimmed. Returns
/// `Cow::Borrowed` when the input is already clean.
pub fn sanitize_label(s: &str) -> Cow<'_, str> {
    let clean = !s.chars().any(char::is_control)
        && !s.contains("  ")
        && s.trim().len() == s.len();
    if clean {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.chars() {
        if c.is_control() {
            continue;
        }
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
    Cow::Owned(out)
}

/// Uppercases the first character of each `-`/`_`/space separated word,
/// turning provider ids like `meteofrance` into `Meteofrance`.
pub fn title_case(s: &str) -> String {
    s.split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
