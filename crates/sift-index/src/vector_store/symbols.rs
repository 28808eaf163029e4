/// Stored symbol kinds that satisfy a requested kind.
///
/// Asymmetric on purpose: methods are functions, but asking for methods
/// does not return free functions. Unknown kinds match only themselves.
pub fn compatible_kinds(requested: &str) -> Vec<String> {
    let requested = requested.trim().to_lowercase();
    let kinds: &[&str] = match requested.as_str() {
        "function" => &["function", "method"],
        "method" => &["method"],
        "class" => &["class"],
        "interface" => &["interface"],
        _ => return vec![requested],
    };
    kinds.iter().map(|k| k.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_includes_methods() {
        assert_eq!(compatible_kinds("function"), vec!["function", "method"]);
        assert_eq!(compatible_kinds("Function"), vec!["function", "method"]);
    }

    #[test]
    fn test_method_does_not_include_functions() {
        assert_eq!(compatible_kinds("method"), vec!["method"]);
    }

    #[test]
    fn test_unknown_kind_matches_itself() {
        assert_eq!(compatible_kinds("struct"), vec!["struct"]);
    }
}
