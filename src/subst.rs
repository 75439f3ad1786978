//! Frame-number substitution in path and argument templates.
//!
//! A parameter token is `%d` (unpadded decimal) or `%0Nd` (zero-padded to
//! width `N`). Any other `%`-sequence, including `%%`, is left verbatim.

/// Length and padding width of a parameter token starting at `at`, which
/// must index a `%` byte. Returns `None` if the bytes there are not a
/// valid token.
fn token_at(bytes: &[u8], at: usize) -> Option<(usize, Option<usize>)> {
    match bytes.get(at + 1) {
        Some(b'd') => Some((2, None)),
        Some(b'0') => {
            let mut end = at + 2;
            while bytes.get(end).is_some_and(|b| b.is_ascii_digit()) {
                end += 1;
            }
            if end == at + 2 || bytes.get(end) != Some(&b'd') {
                return None;
            }
            let width = std::str::from_utf8(&bytes[at + 2..end])
                .ok()
                .and_then(|digits| digits.parse::<usize>().ok())?;
            Some((end + 1 - at, Some(width)))
        }
        _ => None,
    }
}

/// Whether the template contains at least one parameter token.
pub fn contains_parameter(template: &str) -> bool {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if token_at(bytes, i).is_some() {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// Replace every parameter token with the value. A negative value means
/// "no frame" and returns the template unchanged.
pub fn substitute(template: &str, value: i64) -> String {
    if value < 0 {
        return template.to_string();
    }

    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut verbatim_from = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some((len, width)) = token_at(bytes, i) {
                out.push_str(&template[verbatim_from..i]);
                match width {
                    Some(width) => out.push_str(&format!("{value:0width$}")),
                    None => out.push_str(&format!("{value}")),
                }
                i += len;
                verbatim_from = i;
                continue;
            }
        }
        i += 1;
    }
    out.push_str(&template[verbatim_from..]);
    out
}
