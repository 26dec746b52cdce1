//! Read-Only SQL Analysis
//!
//! This module classifies untrusted SQL before it can reach a driver.
//! Colloquy is a read-only gateway - all write and DDL operations are rejected.
//!
//! # Analysis Strategy
//! - Comments are stripped (string-literal aware) before any keyword scan
//! - The leading statement keyword sets the query type
//! - Stacked `;`-separated statements are flagged unsafe
//! - Dangerous keywords outside string literals are flagged unsafe
//! - Conservative approach (fail-safe defaults)
//!
//! The analyzer only reports; policy lives in [`ensure_read_only`], which the
//! query pipeline calls before execution.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatewayError, Result};

/// Maximum raw query length accepted before analysis, bounding scan cost.
pub const MAX_QUERY_LENGTH: usize = 10_000;

/// Maximum length accepted for a table/schema identifier.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Keywords that mark a statement as modifying data or schema.
const DANGEROUS_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "REPLACE", "MERGE",
    "GRANT", "REVOKE", "EXEC", "EXECUTE", "ATTACH", "VACUUM",
];

/// Classification of a SQL statement by its leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Other,
}

impl QueryType {
    fn from_leading_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CREATE" => Self::Create,
            "DROP" => Self::Drop,
            "ALTER" => Self::Alter,
            _ => Self::Other,
        }
    }

    /// Uppercase name as shown in rejection messages and JSON output
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Create => "CREATE",
            Self::Drop => "DROP",
            Self::Alter => "ALTER",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verdict produced by [`analyze`]
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnalysis {
    pub query_type: QueryType,
    pub is_safe: bool,
    pub warnings: Vec<String>,
}

/// Classify an untrusted SQL string.
///
/// Never executes anything; the result describes what the string would do.
/// Empty input is classified `Other`/unsafe rather than erroring, so callers
/// get one uniform rejection path.
#[must_use]
pub fn analyze(sql: &str) -> QueryAnalysis {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return QueryAnalysis {
            query_type: QueryType::Other,
            is_safe: false,
            warnings: vec!["Query is empty".to_string()],
        };
    }

    let mut warnings = Vec::new();
    if contains_line_comment(trimmed) {
        warnings.push("Query contains line comments".to_string());
    }
    if trimmed.contains("/*") {
        warnings.push("Query contains block comments".to_string());
    }

    // Strip comments and mask string literals so keyword detection cannot be
    // fooled by either
    let stripped = strip_comments(trimmed);
    let masked = mask_string_literals(&stripped).to_uppercase();

    let mut is_safe = true;

    // Stacked statements: anything after a non-trailing semicolon
    if masked.trim_end().trim_end_matches(';').contains(';') {
        warnings.push("Multiple statements detected".to_string());
        is_safe = false;
    }

    let words = word_tokens(&masked);
    let query_type = words
        .first()
        .map_or(QueryType::Other, |first| QueryType::from_leading_keyword(first));

    for word in &words {
        if DANGEROUS_KEYWORDS.contains(&word.as_str()) {
            warnings.push(format!("Dangerous keyword {word} detected"));
            is_safe = false;
        }
    }

    QueryAnalysis { query_type, is_safe, warnings }
}

/// Enforce the read-only policy over an analysis.
///
/// Only `SELECT` verdicts with no safety flags may reach a driver. The
/// rejection names the blocked statement type so the user sees exactly what
/// was refused.
pub fn ensure_read_only(sql: &str) -> Result<QueryAnalysis> {
    let analysis = analyze(sql);
    if analysis.query_type != QueryType::Select || !analysis.is_safe {
        return Err(GatewayError::security_rejection(analysis.query_type));
    }
    Ok(analysis)
}

/// Reject queries longer than `max_length` before any analysis runs
pub fn check_query_length(sql: &str, max_length: usize) -> Result<()> {
    if sql.len() > max_length {
        return Err(GatewayError::validation(format!(
            "Query exceeds maximum length of {max_length} characters"
        )));
    }
    Ok(())
}

/// Validate a table or schema identifier before it is interpolated into
/// dialect SQL.
///
/// Only unquoted simple identifiers are accepted: a letter or underscore
/// followed by letters, digits, underscores, or `$`. Everything else
/// (whitespace, quoting, semicolons, dots) is rejected, which is what makes
/// name interpolation in the dialect layer injection-safe.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GatewayError::validation("Identifier cannot be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(GatewayError::validation(format!(
            "Identifier exceeds maximum length of {MAX_IDENTIFIER_LENGTH} characters"
        )));
    }

    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !name.chars().skip(1).all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        return Err(GatewayError::validation(format!("Invalid identifier: {name}")));
    }

    Ok(())
}

/// Detect a `--` line comment outside of string literals
fn contains_line_comment(sql: &str) -> bool {
    let masked = mask_string_literals(sql);
    masked.contains("--")
}

/// Strip SQL comments from a query
///
/// Handles:
/// - Line comments: -- comment
/// - Block comments: /* comment */
///
/// Comment markers inside single- or double-quoted literals are left intact.
fn strip_comments(sql: &str) -> String {
    let mut result = String::new();
    let mut chars = sql.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                result.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                result.push(ch);
            }
            '-' if !in_single && !in_double && chars.peek() == Some(&'-') => {
                // Line comment: skip until newline
                chars.next(); // consume second '-'
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        result.push('\n'); // preserve newline
                        break;
                    }
                }
            }
            '/' if !in_single && !in_double && chars.peek() == Some(&'*') => {
                // Block comment: skip until */
                chars.next(); // consume '*'
                let mut prev = ' ';
                for ch in chars.by_ref() {
                    if prev == '*' && ch == '/' {
                        break;
                    }
                    prev = ch;
                }
                result.push(' '); // replace comment with space
            }
            _ => result.push(ch),
        }
    }

    result
}

/// Replace the contents of string literals with spaces so keyword scans never
/// match inside quoted data. Quote characters themselves are preserved.
fn mask_string_literals(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut in_single = false;
    let mut in_double = false;

    for ch in sql.chars() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                result.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                result.push(ch);
            }
            _ if in_single || in_double => result.push(' '),
            _ => result.push(ch),
        }
    }

    result
}

/// Split into identifier-shaped word tokens for whole-word keyword matching
fn word_tokens(sql: &str) -> Vec<String> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}
