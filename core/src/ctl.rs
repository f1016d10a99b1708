// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Text-based control messages.
//!
//! Control messages are a single line of blank-separated fields. A field containing blanks is
//! surrounded with single quotes, and a quote within a quoted field is doubled.

use crate::Error;

use alloc::{borrow::Cow, string::String, vec::Vec};

/// Splits a control line into fields.
pub fn tokenize(line: &str) -> Result<Vec<String>, Error> {
    let mut fields = Vec::new();
    let mut chars = line.trim_end_matches(|c| c == '\n' || c == '\0').chars().peekable();

    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut field = String::new();
        let mut quoted = false;
        while let Some(c) = chars.next() {
            match c {
                '\'' if quoted && chars.peek() == Some(&'\'') => {
                    chars.next();
                    field.push('\'');
                }
                '\'' => quoted = !quoted,
                c if c.is_whitespace() && !quoted => break,
                c => field.push(c),
            }
        }
        if quoted {
            return Err(Error::BadCommand);
        }
        fields.push(field);
    }

    Ok(fields)
}

/// Quotes `s` if it is empty or contains blanks or quotes.
pub fn quote(s: &str) -> Cow<str> {
    if !s.is_empty() && !s.chars().any(|c| c.is_whitespace() || c == '\'') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    Cow::Owned(out)
}

/// Returns an error if `fields` doesn't contain exactly `n` fields, verb included.
pub fn expect_fields(fields: &[String], n: usize) -> Result<(), Error> {
    if fields.len() == n {
        Ok(())
    } else {
        Err(Error::BadCommand)
    }
}

/// Parses a number. Accepts decimal, and hexadecimal with a `0x` prefix.
pub fn parse_number(s: &str) -> Result<u64, Error> {
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|_| Error::BadArgument)
}

#[cfg(test)]
mod tests {
    use super::{parse_number, quote, tokenize};
    use crate::Error;

    #[test]
    fn tokenize_fields() {
        let fields = tokenize("part 'my disk' 0 1024\n").unwrap();
        assert_eq!(fields, ["part", "my disk", "0", "1024"]);
    }

    #[test]
    fn tokenize_doubled_quote() {
        let fields = tokenize("descr 'it''s'").unwrap();
        assert_eq!(fields, ["descr", "it's"]);
    }

    #[test]
    fn tokenize_unterminated() {
        assert_eq!(tokenize("descr 'oops"), Err(Error::BadCommand));
    }

    #[test]
    fn quote_when_needed() {
        assert_eq!(quote("sata"), "sata");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("WDC WD10"), "'WDC WD10'");
        assert_eq!(quote("it's"), "'it''s'");
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("512"), Ok(512));
        assert_eq!(parse_number("0x200"), Ok(512));
        assert_eq!(parse_number("-1"), Err(Error::BadArgument));
    }
}
