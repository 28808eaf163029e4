//! Textual filter predicates for the embedded backend.
//!
//! Values are embedded as single-quoted literals with embedded quotes
//! doubled. Blank values are rejected instead of being treated as "no filter".

use super::VectorStoreError;

/// Reject an empty or all-whitespace filter value.
pub fn require_value<'a>(field: &str, value: &'a str) -> Result<&'a str, VectorStoreError> {
    if value.trim().is_empty() {
        return Err(VectorStoreError::InvalidFilter(format!(
            "empty value for '{}'",
            field
        )));
    }
    Ok(value)
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `column = 'value'`
pub fn eq(column: &str, value: &str) -> Result<String, VectorStoreError> {
    let value = require_value(column, value)?;
    Ok(format!("{} = {}", column, quote(value)))
}

/// `column IN ('a', 'b')`
pub fn in_list<S: AsRef<str>>(column: &str, values: &[S]) -> Result<String, VectorStoreError> {
    if values.is_empty() {
        return Err(VectorStoreError::InvalidFilter(format!(
            "empty value list for '{}'",
            column
        )));
    }
    let literals = values
        .iter()
        .map(|v| require_value(column, v.as_ref()).map(quote))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("{} IN ({})", column, literals.join(", ")))
}

/// Join clauses with AND; `None` when there is nothing to filter on.
pub fn and(clauses: &[String]) -> Option<String> {
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quotes_are_doubled() {
        assert_eq!(
            eq("file", "src/it's.rs").unwrap(),
            "file = 'src/it''s.rs'"
        );
        assert_eq!(quote("a'' OR ''1"), "'a'''' OR ''''1'");
    }

    #[test]
    fn test_blank_values_are_rejected() {
        assert!(matches!(
            eq("language", "   "),
            Err(VectorStoreError::InvalidFilter(_))
        ));
        assert!(eq("file", "").is_err());
        assert!(in_list("file", &["a.rs", " "]).is_err());
        assert!(in_list::<&str>("file", &[]).is_err());
    }

    #[test]
    fn test_in_list_and_conjunction() {
        let files = in_list("file", &["a.rs", "b'.rs"]).unwrap();
        assert_eq!(files, "file IN ('a.rs', 'b''.rs')");
        let language = eq("language", "rust").unwrap();
        assert_eq!(
            and(&[files, language]).unwrap(),
            "file IN ('a.rs', 'b''.rs') AND language = 'rust'"
        );
        assert!(and(&[]).is_none());
    }
}
