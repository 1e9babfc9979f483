//! Parsing and quoting of PostgreSQL table identifiers.
//!
//! The overview rewriter substitutes table names inside arbitrary SQL text,
//! so it needs to understand optionally schema-qualified, optionally
//! double-quoted identifiers (with `""` as the escape for an embedded
//! quote). Malformed combinations yield `None` rather than an error: the
//! caller treats them as "not a table reference we can rewrite".

use once_cell::sync::Lazy;
use regex::Regex;

static BARE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z_0-9]*$").expect("valid identifier regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTableName {
    pub schema: Option<String>,
    pub table: String,
}

/// Quote an identifier if it is not a plain lower-case bare identifier.
pub fn quote(ident: &str) -> String {
    if !ident.is_empty() && !BARE_IDENTIFIER.is_match(ident) {
        format!("\"{}\"", ident.replace('"', "\"\""))
    } else {
        ident.to_string()
    }
}

/// Re-serialize a parsed name, quoting each part as needed.
pub fn table_identifier(parsed: &ParsedTableName) -> String {
    match &parsed.schema {
        Some(schema) => format!("{}.{}", quote(schema), quote(&parsed.table)),
        None => quote(&parsed.table),
    }
}

#[derive(Debug)]
struct Part {
    text: String,
    quoted: bool,
}

// Split the input on double quotes into runs of quoted/unquoted text,
// merging `""` escapes back into the preceding quoted part.
fn split_quoted_parts(input: &str) -> Vec<Part> {
    let pieces: Vec<&str> = input.split('"').collect();
    let mut parts: Vec<Part> = Vec::new();
    let mut i = 0;
    while i < pieces.len() {
        if pieces[i].is_empty() {
            if !parts.is_empty() && i < pieces.len() - 1 {
                i += 1;
                let last = parts.last_mut().expect("parts not empty");
                last.text.push('"');
                last.text.push_str(pieces[i]);
            }
        } else {
            let quoted = (i > 0 && pieces[i - 1].is_empty())
                || (i < pieces.len() - 1 && pieces[i + 1].is_empty());
            parts.push(Part {
                text: pieces[i].to_string(),
                quoted,
            });
        }
        i += 1;
    }
    parts
}

fn split_single_part(part: &Part) -> Option<ParsedTableName> {
    if part.quoted {
        return Some(ParsedTableName {
            schema: None,
            table: part.text.clone(),
        });
    }
    let segments: Vec<&str> = part.text.split('.').collect();
    match segments.as_slice() {
        [table] => Some(ParsedTableName {
            schema: None,
            table: (*table).to_string(),
        }),
        [schema, table] => Some(ParsedTableName {
            schema: Some((*schema).to_string()),
            table: (*table).to_string(),
        }),
        _ => None,
    }
}

fn split_two_parts(first: &Part, second: &Part) -> Option<ParsedTableName> {
    if first.quoted && !second.quoted {
        // `"schema".table`
        let rest = second.text.strip_prefix('.')?;
        Some(ParsedTableName {
            schema: Some(first.text.clone()),
            table: rest.to_string(),
        })
    } else if !first.quoted && second.quoted {
        // `schema."table"`
        let schema = first.text.strip_suffix('.')?;
        Some(ParsedTableName {
            schema: Some(schema.to_string()),
            table: second.text.clone(),
        })
    } else {
        None
    }
}

/// Parse a possibly quoted, possibly schema-qualified table name.
pub fn parse(input: &str) -> Option<ParsedTableName> {
    let parts = split_quoted_parts(input);
    match parts.as_slice() {
        [single] => split_single_part(single),
        [first, second] => split_two_parts(first, second),
        // `"schema"."table"`
        [first, dot, third] if dot.text == "." => Some(ParsedTableName {
            schema: Some(first.text.clone()),
            table: third.text.clone(),
        }),
        _ => None,
    }
}
