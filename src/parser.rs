//! Tag-stream parser for `.sql` sources.
//!
//! Splits a stream of SQL into named statements, one line at a time.
//!
//! ```text
//! -- name: find-user            <- tag line, opens "find-user"
//! SELECT * FROM users           <- body
//! WHERE id = $1;                <- body, ';' terminates
//!
//! /* block comment */           <- skipped
//! DELETE FROM sessions;         <- untagged, registered as "000000"
//!
//! -- name: bump
//! CREATE FUNCTION bump() RETURNS void AS $$
//! BEGIN UPDATE counter SET n = n + 1; END;   <- inside $$ .. $$, no split
//! $$ LANGUAGE plpgsql;
//! ```
//!
//! Function bodies are tracked by `$$` parity only, not by depth, so nested
//! or named dollar quotes (`$body$ .. $body$`) are not recognized.

use std::io::BufRead;

use nom::{
    bytes::complete::tag,
    character::complete::char,
    combinator::{opt, rest},
    IResult,
};

use crate::error::{SqlTagError, SqlTagResult};
use crate::registry::QueryMap;

/// Parse tagged SQL from a reader.
///
/// `serial` is the next number to hand out to an untagged statement; the
/// advanced value is returned next to the parsed queries so it can be
/// threaded into the following call.
pub fn parse<R: BufRead>(reader: R, serial: usize) -> SqlTagResult<(QueryMap, usize)> {
    let mut scanner = Scanner::new(serial);
    for line in reader.lines() {
        scanner.feed(&line?);
    }
    scanner.finish()
}

/// Parse tagged SQL held in memory.
pub fn parse_str(input: &str, serial: usize) -> SqlTagResult<(QueryMap, usize)> {
    parse(input.as_bytes(), serial)
}

/// Line scanner state.
#[derive(Debug)]
struct Scanner {
    queries: QueryMap,
    serial: usize,
    /// Statement currently receiving body lines.
    tag: Option<String>,
    block_comment: bool,
    function_body: bool,
}

impl Scanner {
    fn new(serial: usize) -> Self {
        Self {
            queries: QueryMap::new(),
            serial,
            tag: None,
            block_comment: false,
            function_body: false,
        }
    }

    fn feed(&mut self, line: &str) {
        let line = line.trim();

        if self.block_comment {
            if line.ends_with("*/") {
                self.block_comment = false;
            }
            return;
        }

        if let Some(name) = tag_line(line) {
            // Re-declaring a tag starts over with an empty body.
            self.queries.insert(name, Default::default());
            self.tag = Some(name.to_string());
            self.function_body = false;
            return;
        }

        if line.is_empty() || line.starts_with("--") {
            return;
        }

        if line.starts_with("/*") {
            self.block_comment = !(line.len() >= 4 && line.ends_with("*/"));
            return;
        }

        let name = match self.tag.take() {
            Some(name) => name,
            None => self.next_auto_tag(),
        };

        let fragment = strip_inline_comment(line).trim();
        self.queries.entry(&name).push_fragment(fragment);

        if fragment.matches("$$").count() % 2 == 1 {
            self.function_body = !self.function_body;
        }

        let terminated = line.ends_with(';') && !self.function_body;
        if !terminated {
            self.tag = Some(name);
        }
    }

    fn next_auto_tag(&mut self) -> String {
        let name = format!("{:06}", self.serial);
        self.serial += 1;
        name
    }

    fn finish(self) -> SqlTagResult<(QueryMap, usize)> {
        if self.function_body {
            tracing::warn!(
                "Source ended inside a $$ function body of '{}'",
                self.tag.as_deref().unwrap_or_default()
            );
        }
        if self.queries.is_empty() {
            return Err(SqlTagError::EmptyInput);
        }
        tracing::debug!("Parsed {} queries", self.queries.len());
        Ok((self.queries, self.serial))
    }
}

/// Recognize `-- name: <tag>` and `--name: <tag>`.
fn parse_name_tag(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag("--")(input)?;
    let (input, _) = opt(char(' '))(input)?;
    let (input, _) = tag("name:")(input)?;
    let (input, name) = rest(input)?;
    Ok((input, name.trim()))
}

/// The tag declared by `line`, if it is a tag line with a non-empty name.
fn tag_line(line: &str) -> Option<&str> {
    match parse_name_tag(line) {
        Ok((_, name)) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Cut a trailing `-- comment`. A `--` inside a single-quoted literal is
/// left alone.
fn strip_inline_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut quoted = false;
    for (i, &byte) in bytes.iter().enumerate() {
        match byte {
            b'\'' => quoted = !quoted,
            b'-' if !quoted && bytes.get(i + 1) == Some(&b'-') => return &line[..i],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sql_of(map: &QueryMap, name: &str) -> String {
        map.get_query(name).unwrap().raw_sql().to_string()
    }

    #[test]
    fn test_tag_line_forms() {
        assert_eq!(tag_line("-- name: find-user"), Some("find-user"));
        assert_eq!(tag_line("--name:find-user  "), Some("find-user"));
        assert_eq!(tag_line("--  name: find-user"), None);
        assert_eq!(tag_line("-- name:"), None);
        assert_eq!(tag_line("-- just a comment"), None);
        assert_eq!(tag_line("select 1; -- name: x"), None);
    }

    #[test]
    fn test_strip_inline_comment() {
        assert_eq!(strip_inline_comment("select 1 -- one"), "select 1 ");
        assert_eq!(strip_inline_comment("select 1"), "select 1");
        assert_eq!(
            strip_inline_comment("select '--not' from t -- real"),
            "select '--not' from t "
        );
        assert_eq!(strip_inline_comment("select 'it''s' -- x"), "select 'it''s' ");
    }

    #[test]
    fn test_tagged_multiline_body() {
        let input = "-- name: one\nselect 1\n   from users\nwhere $1 = me;   -- trailing\n";
        let (map, serial) = parse_str(input, 0).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(sql_of(&map, "one"), "select 1 from users where $1 = me;");
        assert_eq!(serial, 0);
    }

    #[test]
    fn test_auto_tags_are_zero_padded() {
        let input = "select 1;\nselect 2;\n";
        let (map, serial) = parse_str(input, 41).unwrap();
        assert_eq!(map.sorted(), vec!["000041", "000042"]);
        assert_eq!(sql_of(&map, "000042"), "select 2;");
        assert_eq!(serial, 43);
    }

    #[test]
    fn test_function_body_keeps_semicolons() {
        let input = "-- name: fn\nbegin $$\nSELECT 1; SELECT 2;\n$$ end;\n";
        let (map, _) = parse_str(input, 0).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(sql_of(&map, "fn"), "begin $$ SELECT 1; SELECT 2; $$ end;");
    }

    #[test]
    fn test_single_line_dollar_pair_terminates() {
        let input = "create function f() returns int as $$ select 1 $$ language sql;\nselect 2;\n";
        let (map, _) = parse_str(input, 0).unwrap();
        assert_eq!(map.sorted(), vec!["000000", "000001"]);
        assert_eq!(sql_of(&map, "000001"), "select 2;");
    }

    #[test]
    fn test_block_comments_are_skipped() {
        let input = "/*\n-- name: hidden\nselect 0;\n*/\n/* one line */\n-- name: shown\nselect 1;\n";
        let (map, _) = parse_str(input, 0).unwrap();
        assert_eq!(map.sorted(), vec!["shown"]);
        assert_eq!(sql_of(&map, "shown"), "select 1;");
    }

    #[test]
    fn test_retag_starts_fresh_body() {
        let input = "-- name: dup\nselect old\n-- name: dup\nselect new;\n";
        let (map, _) = parse_str(input, 0).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(sql_of(&map, "dup"), "select new;");
    }

    #[test]
    fn test_tag_at_end_of_stream_is_empty() {
        let (map, _) = parse_str("select 1;\n-- name: last\n", 0).unwrap();
        assert_eq!(sql_of(&map, "last"), "");
    }

    #[test]
    fn test_semicolon_before_inline_comment_does_not_terminate() {
        let input = "select 1; -- note\nselect 2;\n";
        let (map, _) = parse_str(input, 0).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(sql_of(&map, "000000"), "select 1; select 2;");
    }

    #[test]
    fn test_unterminated_function_body_is_kept() {
        let input = "-- name: open\ndo $$\nbegin perform 1;\n";
        let (map, _) = parse_str(input, 0).unwrap();
        assert_eq!(sql_of(&map, "open"), "do $$ begin perform 1;");
    }

    #[test]
    fn test_empty_and_comment_only_inputs() {
        assert!(matches!(parse_str("", 0), Err(SqlTagError::EmptyInput)));
        assert!(matches!(
            parse_str("-- nothing here\n\n/*\nselect 1;\n*/\n", 0),
            Err(SqlTagError::EmptyInput)
        ));
    }

    #[test]
    fn test_read_failure_propagates() {
        let invalid: &[u8] = b"select 1;\n\xff\xfe\n";
        assert!(matches!(parse(invalid, 0), Err(SqlTagError::Io(_))));
    }
}
