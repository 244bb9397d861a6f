//! mIRC formatting codes in a typeable form.
//!
//! `$b` bold, `$i` italic, `$s` strikethrough, `$u` underline, `$m`
//! monospace, `$r` reset, `$$` a literal dollar sign, and `$c[fg,bg]` a
//! color where each side is a name from [`COLORS`] or a number. `$c` and
//! `$c[]` alone are a bare color code (which resets color).

use std::iter::Peekable;
use std::str::Chars;

const BOLD: char = '\x02';
const COLOR: char = '\x03';
const MONOSPACE: char = '\x11';
const RESET: char = '\x0f';
const REVERSE: char = '\x16';
const ITALIC: char = '\x1d';
const STRIKETHROUGH: char = '\x1e';
const UNDERLINE: char = '\x1f';

/// Named colors and their numbers.
pub const COLORS: &[(&str, u8)] = &[
    ("white", 0),
    ("black", 1),
    ("blue", 2),
    ("green", 3),
    ("red", 4),
    ("brown", 5),
    ("magenta", 6),
    ("orange", 7),
    ("yellow", 8),
    ("light green", 9),
    ("cyan", 10),
    ("light cyan", 11),
    ("light blue", 12),
    ("pink", 13),
    ("grey", 14),
    ("light grey", 15),
    ("default", 99),
];

fn simple_escape(code: char) -> Option<char> {
    match code {
        BOLD => Some('b'),
        ITALIC => Some('i'),
        STRIKETHROUGH => Some('s'),
        UNDERLINE => Some('u'),
        MONOSPACE => Some('m'),
        RESET => Some('r'),
        _ => None,
    }
}

fn simple_code(letter: char) -> Option<char> {
    match letter {
        'b' => Some(BOLD),
        'i' => Some(ITALIC),
        's' => Some(STRIKETHROUGH),
        'u' => Some(UNDERLINE),
        'm' => Some(MONOSPACE),
        'r' => Some(RESET),
        _ => None,
    }
}

/// Name for `digits`, but only when [`unescape`] would turn the name back
/// into exactly these digits. `last` and `digit_follows` mirror its padding.
fn color_name(digits: &str, last: bool, digit_follows: bool) -> Option<&'static str> {
    let number: u8 = digits.parse().ok()?;
    let (name, n) = COLORS.iter().find(|(_, n)| *n == number)?;
    let canonical = if last && digit_follows {
        format!("{n:02}")
    } else {
        n.to_string()
    };
    (canonical == digits).then_some(*name)
}

fn color_number(name: &str) -> Option<String> {
    let name = name.trim();
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
        return Some(name.to_string());
    }
    COLORS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|(_, n)| n.to_string())
}

fn take_digits(chars: &mut Peekable<Chars<'_>>, max: usize) -> String {
    let mut digits = String::new();
    while digits.len() < max {
        match chars.peek() {
            Some(c) if c.is_ascii_digit() => {
                digits.push(*c);
                chars.next();
            }
            _ => break,
        }
    }
    digits
}

/// Read the `fg[,bg]` digits following a color code. The comma is only
/// consumed when a digit follows it.
fn take_color(chars: &mut Peekable<Chars<'_>>) -> (String, Option<String>) {
    let fg = take_digits(chars, 2);
    if fg.is_empty() || chars.peek() != Some(&',') {
        return (fg, None);
    }
    let mut lookahead = chars.clone();
    lookahead.next();
    if !lookahead.peek().is_some_and(char::is_ascii_digit) {
        return (fg, None);
    }
    chars.next();
    let bg = take_digits(chars, 2);
    (fg, Some(bg))
}

/// Turn raw formatting codes into `$` escapes.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            out.push_str("$$");
        } else if let Some(letter) = simple_escape(c) {
            out.push('$');
            out.push(letter);
        } else if c == COLOR {
            let (fg, bg) = take_color(&mut chars);
            let digit_follows = chars.peek().is_some_and(char::is_ascii_digit);
            out.push_str("$c[");
            if !fg.is_empty() {
                out.push_str(color_name(&fg, bg.is_none(), digit_follows).unwrap_or(&fg));
            }
            if let Some(bg) = bg {
                out.push(',');
                out.push_str(color_name(&bg, true, digit_follows).unwrap_or(&bg));
            }
            out.push(']');
        } else {
            out.push(c);
        }
    }
    out
}

/// Turn `$` escapes into raw formatting codes. An unknown escape keeps the
/// character and drops the `$`.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            break;
        };
        if let Some(code) = simple_code(next) {
            out.push(code);
        } else if next == 'c' {
            out.push(COLOR);
            if chars.peek() == Some(&'[') {
                chars.next();
                let colors: String = chars.by_ref().take_while(|&c| c != ']').collect();
                push_color(&mut out, &colors, chars.peek().is_some_and(char::is_ascii_digit));
            }
        } else {
            out.push(next);
        }
    }
    out
}

/// Append the numeric form of `fg[,bg]`. When a digit follows, the last
/// number is padded to two digits so it is not read as part of the color.
fn push_color(out: &mut String, colors: &str, digit_follows: bool) {
    let (fg, bg) = match colors.split_once(',') {
        Some((fg, bg)) => (fg, Some(bg)),
        None => (colors, None),
    };
    let fg = color_number(fg);
    let bg = bg.and_then(color_number);
    let pad = |n: String, last: bool| {
        if last && digit_follows && n.len() < 2 {
            format!("0{n}")
        } else {
            n
        }
    };
    if let Some(fg) = fg {
        out.push_str(&pad(fg, bg.is_none()));
    }
    if let Some(bg) = bg {
        out.push(',');
        out.push_str(&pad(bg, true));
    }
}

/// Remove every formatting code, including color numbers.
pub fn strip(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            COLOR => {
                take_color(&mut chars);
            }
            BOLD | ITALIC | STRIKETHROUGH | UNDERLINE | MONOSPACE | RESET | REVERSE => {}
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIRS: &[(&str, &str)] = &[
        ("te$bst", "te\x02st"),
        ("te$c[green]st", "te\x033st"),
        ("te$c[red,green]st", "te\x034,3st"),
        ("te$c[green]4st", "te\x03034st"),
        ("te$c[red,green]9st", "te\x034,039st"),
        (" ▀█▄▀▪.▀  ▀ ▀  ▀ ·▀▀▀▀", " ▀█▄▀▪.▀  ▀ ▀  ▀ ·▀▀▀▀"),
        ("test $$c", "test $c"),
        ("test $c[]", "test \x03"),
        ("test $$", "test $"),
    ];

    #[test]
    fn escape_known_pairs() {
        for (escaped, raw) in PAIRS {
            assert_eq!(escape(raw), *escaped, "escaping {raw:?}");
        }
        assert_eq!(escape("te\x03st"), "te$c[]st");
        assert_eq!(escape("test\x03"), "test$c[]");
        assert_eq!(escape("\x0342x"), "$c[42]x");
        assert_eq!(escape("te\x0301st"), "te$c[01]st");
        assert_eq!(escape("\x0301,04x"), "$c[01,04]x");
    }

    #[test]
    fn unescape_known_pairs() {
        for (escaped, raw) in PAIRS {
            assert_eq!(unescape(escaped), *raw, "unescaping {escaped:?}");
        }
        assert_eq!(unescape("te$xt"), "text");
        assert_eq!(unescape("te$st"), "te\x1et");
        assert_eq!(unescape("test$c"), "test\x03");
        assert_eq!(unescape("$c[Light Blue]$u!"), "\x0312\x1f!");
    }

    #[test]
    fn escape_then_unescape_is_identity() {
        for (_, raw) in PAIRS {
            assert_eq!(unescape(&escape(raw)), *raw);
        }
    }

    #[test]
    fn padded_and_unpadded_colors_survive_a_round_trip() {
        let numbers = ["1", "01", "4", "04", "12", "99", "42"];
        for fg in numbers {
            for bg in std::iter::once(None).chain(numbers.map(Some)) {
                for after in ["", "x", "5", ",", ",7"] {
                    let raw = match bg {
                        Some(bg) => format!("a\x03{fg},{bg}{after}"),
                        None => format!("a\x03{fg}{after}"),
                    };
                    assert_eq!(unescape(&escape(&raw)), raw, "via {:?}", escape(&raw));
                }
            }
        }
    }

    #[test]
    fn strip_removes_codes() {
        assert_eq!(strip("te\x02st"), "test");
        assert_eq!(strip("te\x033st"), "test");
        assert_eq!(strip("te\x034,3st"), "test");
        assert_eq!(strip("te\x03034st"), "te4st");
        assert_eq!(strip("te\x034,039st"), "te9st");
        assert_eq!(strip("\x16rev\x0f \x034,x"), "rev ,x");
        for (escaped, raw) in PAIRS {
            assert_eq!(strip(&unescape(escaped)), strip(raw));
        }
    }
}
