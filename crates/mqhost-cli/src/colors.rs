//! Terminal colors and translation of the host's inline color codes.

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const BLUE: &str = "\x1b[34m";
pub const MAGENTA: &str = "\x1b[35m";
pub const CYAN: &str = "\x1b[36m";
pub const WHITE: &str = "\x1b[37m";

fn ansi_for(code: char) -> Option<&'static str> {
    match code {
        'r' => Some(RED),
        'g' => Some(GREEN),
        'y' | 'o' => Some(YELLOW),
        'u' => Some(BLUE),
        'm' | 'p' => Some(MAGENTA),
        't' => Some(CYAN),
        'w' => Some(WHITE),
        'x' => Some(RESET),
        _ => None,
    }
}

/// Replace `\a<c>` and `\a-<c>` sequences with ANSI escapes.
///
/// With `ansi` off the sequences are stripped. Unknown codes are dropped.
pub fn render(text: &str, ansi: bool) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' || chars.peek() != Some(&'a') {
            out.push(c);
            continue;
        }
        chars.next();
        if chars.peek() == Some(&'-') {
            chars.next();
        }
        let Some(code) = chars.next() else {
            break;
        };
        if ansi {
            if let Some(escape) = ansi_for(code) {
                out.push_str(escape);
            }
        }
    }

    if ansi {
        out.push_str(RESET);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_strips_codes() {
        assert_eq!(
            render("\\ag[MQHost] \\arError: \\awboom", false),
            "[MQHost] Error: boom"
        );
    }

    #[test]
    fn test_render_dark_variant() {
        assert_eq!(render("\\a-gdark", false), "dark");
    }

    #[test]
    fn test_render_ansi() {
        let rendered = render("\\agok", true);
        assert!(rendered.starts_with(GREEN));
        assert!(rendered.ends_with(RESET));
        assert!(rendered.contains("ok"));
    }

    #[test]
    fn test_plain_backslash_kept() {
        assert_eq!(render("C:\\path", false), "C:\\path");
    }
}
