//! Parameter template rendering.
//!
//! Search specs carry a `parameter_template` whose values may reference the
//! scenario text and request-level overrides:
//!
//! ```text
//! query    = "{scenario}"
//! country  = "{country}"        # from overrides["country"]
//! filter   = "{{raw braces}}"   # literal "{raw braces}"
//! ```
//!
//! `{scenario}` always refers to the request's scenario text; every other
//! placeholder must be supplied by the overrides map.

use std::collections::BTreeMap;
use thiserror::Error;

/// Placeholder that always resolves to the scenario text.
pub const SCENARIO_PLACEHOLDER: &str = "scenario";

/// Why a template could not be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("parameter '{param}' references unknown placeholder '{{{placeholder}}}'")]
    UnknownPlaceholder { param: String, placeholder: String },
    #[error("parameter '{param}' has an unterminated placeholder")]
    Unterminated { param: String },
}

/// Render every value of `template`, returning concrete call parameters.
pub fn render_params(
    template: &BTreeMap<String, String>,
    scenario: &str,
    overrides: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, TemplateError> {
    template
        .iter()
        .map(|(param, raw)| {
            render_value(param, raw, scenario, overrides).map(|value| (param.clone(), value))
        })
        .collect()
}

fn render_value(
    param: &str,
    raw: &str,
    scenario: &str,
    overrides: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(TemplateError::Unterminated {
                        param: param.to_string(),
                    });
                }
                let name = name.trim();
                let value = if name == SCENARIO_PLACEHOLDER {
                    Some(scenario)
                } else {
                    overrides.get(name).map(String::as_str)
                };
                match value {
                    Some(v) => out.push_str(v),
                    None => {
                        return Err(TemplateError::UnknownPlaceholder {
                            param: param.to_string(),
                            placeholder: name.to_string(),
                        })
                    }
                }
            }
            other => out.push(other),
        }
    }

    Ok(out)
}
