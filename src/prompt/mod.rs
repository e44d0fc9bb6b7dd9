//! Prompt template rendering.
//!
//! Templates use `{name}` placeholders. Brace text that is not a bare
//! identifier (JSON examples inside a prompt, for instance) is copied
//! through untouched, and `{{` / `}}` render as literal braces.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use thiserror::Error;

/// Errors from template rendering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Template variable `{0}` has no input")]
    MissingVariable(String),

    #[error("Template `{template}` references unknown variable `{variable}`")]
    UnknownVariable { template: String, variable: String },
}

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Substitute `inputs` into `template`.
pub fn render(template: &str, inputs: &BTreeMap<String, String>) -> Result<String, RenderError> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;

    for caps in token_regex().captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        output.push_str(&template[last..whole.start()]);

        match caps.get(1) {
            Some(name) => {
                let value = inputs
                    .get(name.as_str())
                    .ok_or_else(|| RenderError::MissingVariable(name.as_str().to_string()))?;
                output.push_str(value);
            }
            None if whole.as_str() == "{{" => output.push('{'),
            None => output.push('}'),
        }

        last = whole.end();
    }

    output.push_str(&template[last..]);
    Ok(output)
}

/// Placeholder names referenced by `template`.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    token_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Ensure every placeholder in `template` is one of `available`.
///
/// Run before a batch starts so a broken template fails the whole command
/// instead of every item.
pub fn check_variables(name: &str, template: &str, available: &[&str]) -> Result<(), RenderError> {
    match placeholders(template)
        .into_iter()
        .find(|var| !available.contains(&var.as_str()))
    {
        Some(variable) => Err(RenderError::UnknownVariable {
            template: name.to_string(),
            variable,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes() {
        let out = render(
            "Class: {scenario_class}, run {run_id}.",
            &inputs(&[("scenario_class", "Goal Drift"), ("run_id", "4")]),
        )
        .unwrap();
        assert_eq!(out, "Class: Goal Drift, run 4.");
    }

    #[test]
    fn test_render_is_deterministic() {
        let template = "{a} and {b} and {a}";
        let vars = inputs(&[("a", "x"), ("b", "y")]);
        let first = render(template, &vars).unwrap();
        for _ in 0..10 {
            assert_eq!(render(template, &vars).unwrap(), first);
        }
    }

    #[test]
    fn test_render_missing_variable() {
        let err = render("Hello {name}", &inputs(&[])).unwrap_err();
        assert_eq!(err, RenderError::MissingVariable("name".to_string()));
    }

    #[test]
    fn test_json_examples_pass_through() {
        let template = r#"Respond like {"score": 0.5, "tags": []} for {run_id}"#;
        let out = render(template, &inputs(&[("run_id", "1")])).unwrap();
        assert_eq!(out, r#"Respond like {"score": 0.5, "tags": []} for 1"#);
    }

    #[test]
    fn test_escaped_braces() {
        let out = render("{{run_id}} is {run_id}", &inputs(&[("run_id", "3")])).unwrap();
        assert_eq!(out, "{run_id} is 3");
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let out = render("{a}", &inputs(&[("a", "{b}")])).unwrap();
        assert_eq!(out, "{b}");
    }

    #[test]
    fn test_placeholders_and_check() {
        let template = "{scenario_json} vs {governance_json} {{literal}}";
        let names: Vec<_> = placeholders(template).into_iter().collect();
        assert_eq!(names, vec!["governance_json", "scenario_json"]);

        assert!(check_variables("eval", template, &["scenario_json", "governance_json"]).is_ok());
        let err = check_variables("eval", template, &["scenario_json"]).unwrap_err();
        assert_eq!(
            err,
            RenderError::UnknownVariable {
                template: "eval".to_string(),
                variable: "governance_json".to_string()
            }
        );
    }
}
