//! Variable substitution in templated strings.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static TEMPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}|\$\{([^{}]+)\}").unwrap()
});

/// Replaces `${{ name }}`, `${{ variables.name }}` and `${name}` with values
/// from `variables`. Unknown references are left as written.
pub fn interpolate(input: &str, variables: &HashMap<String, String>) -> String {
    if !input.contains("${") {
        return input.to_string();
    }
    TEMPLATE
        .replace_all(input, |caps: &Captures| {
            let expr = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str())
                .trim();
            let name = expr.strip_prefix("variables.").unwrap_or(expr);
            match variables.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

/// Expands each template and splits the result on commas.
pub fn expand_list(templates: &[String], variables: &HashMap<String, String>) -> Vec<String> {
    templates
        .iter()
        .flat_map(|t| {
            interpolate(t, variables)
                .split(',')
                .map(|s| s.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("branch".to_string(), "main".to_string()),
            ("approvers".to_string(), "alice, bob".to_string()),
        ])
    }

    #[test]
    fn test_all_syntaxes() {
        let v = vars();
        assert_eq!(interpolate("${branch}", &v), "main");
        assert_eq!(interpolate("${{ branch }}", &v), "main");
        assert_eq!(interpolate("${{variables.branch}}", &v), "main");
        assert_eq!(interpolate("ref/${branch}/x", &v), "ref/main/x");
    }

    #[test]
    fn test_unknown_kept() {
        assert_eq!(interpolate("${missing}", &vars()), "${missing}");
        assert_eq!(interpolate("plain", &vars()), "plain");
    }

    #[test]
    fn test_expand_list() {
        let users = expand_list(&["${approvers}".to_string(), "carol,".to_string()], &vars());
        assert_eq!(users, vec!["alice", "bob", "carol"]);
    }
}
