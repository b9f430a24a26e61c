//! File name cleanup for names taken from URLs and response headers.

/// Linux NAME_MAX in bytes.
const NAME_MAX: usize = 255;

/// Makes `name` safe to use as a single path component.
///
/// Separators, NUL, control characters and whitespace become `_` (runs
/// collapse to one); leading/trailing dots and underscores are dropped so the
/// result is never hidden, `.` or `..`. Truncated to 255 bytes on a char
/// boundary.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let unsafe_char = matches!(c, '/' | '\\' | '\0') || c.is_control() || c.is_whitespace();
        if unsafe_char {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    let mut end = trimmed.len().min(NAME_MAX);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_become_underscores() {
        assert_eq!(sanitize_filename("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("my  report\t.pdf"), "my_report_.pdf");
    }

    #[test]
    fn hidden_and_reserved_names_are_stripped() {
        assert_eq!(sanitize_filename("..secret"), "secret");
        assert_eq!(sanitize_filename(".."), "");
        assert_eq!(sanitize_filename(" . file.txt . "), "file.txt");
    }

    #[test]
    fn long_names_truncate_on_char_boundary() {
        let long = "é".repeat(200);
        let out = sanitize_filename(&long);
        assert!(out.len() <= NAME_MAX);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
