//! Placeholder substitution applied to message content before an ESP
//! adapter sends (see SPEC_FULL.md §4.C).
//!
//! Two token forms are recognized: handlebar (`{{name}}`) and hyphen
//! (`-name-`). Expansion runs in two passes so that a substitution value
//! naming a section gets that section's content expanded too.

use std::collections::HashMap;

/// Replace every occurrence of `{{name}}` and `-name-` in `content` with
/// `values[name]`, leaving unmatched tokens untouched.
fn substitute_once(content: &str, values: &HashMap<String, String>) -> String {
    let mut out = content.to_string();
    for (name, value) in values {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
        out = out.replace(&format!("-{name}-"), value);
    }
    out
}

/// Apply personalization substitutions, then expand named sections, then
/// apply substitutions once more so that placeholders pulled in by a
/// section (or produced by a first-pass substitution) are also resolved.
pub fn expand(
    content: &str,
    substitutions: &HashMap<String, String>,
    sections: &HashMap<String, String>,
) -> String {
    let first_pass = substitute_once(content, substitutions);
    let with_sections = substitute_once(&first_pass, sections);
    substitute_once(&with_sections, substitutions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn handlebar_form_is_replaced() {
        let subs = map(&[("first_name", "Alice")]);
        let result = expand("Hi {{first_name}}!", &subs, &HashMap::new());
        assert_eq!(result, "Hi Alice!");
    }

    #[test]
    fn hyphen_form_is_replaced() {
        let subs = map(&[("first_name", "Alice")]);
        let result = expand("Hi -first_name-!", &subs, &HashMap::new());
        assert_eq!(result, "Hi Alice!");
    }

    #[test]
    fn unmatched_token_is_left_alone() {
        let subs = map(&[("first_name", "Alice")]);
        let result = expand("Hi {{last_name}}!", &subs, &HashMap::new());
        assert_eq!(result, "Hi {{last_name}}!");
    }

    #[test]
    fn section_expansion_runs_between_substitution_passes() {
        let subs = map(&[("company_name", "Acme")]);
        let sections = map(&[("footer", "(c) -company_name-")]);
        let result = expand("Body. {{footer}}", &subs, &sections);
        assert_eq!(result, "Body. (c) Acme");
    }

    #[test]
    fn substitution_value_naming_a_section_is_expanded() {
        let subs = map(&[("cta", "{{button}}")]);
        let sections = map(&[("button", "Click here")]);
        let result = expand("{{cta}}", &subs, &sections);
        assert_eq!(result, "Click here");
    }
}
