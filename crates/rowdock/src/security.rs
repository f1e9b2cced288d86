//! Guards for text that ends up inside generated SQL.
//!
//! Identifiers are always quoted by the dialect, but they are still checked
//! here because quoting rules differ per dialect and catalog queries embed
//! table names as string literals. Merge expressions are raw SQL fragments
//! and only get a deny-list check.

use crate::error::{Error, Result};

const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_TYPE_NAME_LEN: usize = 255;
const MAX_EXPRESSION_LEN: usize = 4096;

/// Validate a table, schema or column name.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_$]*` up to 128 characters; `$` appears in
/// Oracle dictionary names.
///
/// ```
/// use rowdock::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("users_8f3a_bl_tmp").is_ok());
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("1st").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    if !chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': must start with a letter or underscore",
            name
        )));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, bad
        )));
    }
    Ok(())
}

/// Double single quotes for use inside a SQL string literal.
///
/// ```
/// use rowdock::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("o'brien"), "o''brien");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Validate a declared column type before it is placed in DDL.
///
/// Type tokens come from live catalogs (`VARCHAR(255)`, `NUMBER(19,0)`,
/// `INT UNSIGNED`, `ENUM('a','b')`) so only the characters such tokens use
/// are allowed.
pub fn validate_sql_type_name(type_name: &str) -> Result<()> {
    if type_name.is_empty() {
        return Err(Error::config("SQL type name cannot be empty"));
    }
    if type_name.len() > MAX_TYPE_NAME_LEN {
        return Err(Error::config(format!(
            "SQL type name too long: {} chars (max {})",
            type_name.len(),
            MAX_TYPE_NAME_LEN
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "_(), '.".contains(c);
    match type_name.chars().find(|c| !allowed(*c)) {
        Some(bad) => Err(Error::config(format!(
            "Invalid SQL type name '{}': contains invalid character '{}'",
            type_name, bad
        ))),
        None => Ok(()),
    }
}

/// Best-effort check of a per-column merge expression.
///
/// Expressions come from trusted load configuration and are spliced into the
/// merge statement verbatim, so this only rejects statement stacking and
/// comments.
pub fn validate_merge_expression(expr: &str) -> Result<()> {
    if expr.trim().is_empty() {
        return Err(Error::config("merge expression cannot be empty"));
    }
    if expr.len() > MAX_EXPRESSION_LEN {
        return Err(Error::config(format!(
            "merge expression too long: {} chars (max {})",
            expr.len(),
            MAX_EXPRESSION_LEN
        )));
    }
    for pattern in [";", "--", "/*", "*/", "\\"] {
        if expr.contains(pattern) {
            return Err(Error::config(format!(
                "merge expression contains prohibited pattern '{}': {}",
                pattern, expr
            )));
        }
    }
    Ok(())
}
