//! Label and field selectors.
//!
//! Clients backed by a real API server pass selectors through verbatim. The helpers in here are
//! used to build selector strings from structured [`k8s::LabelSelector`]s and by the in-memory
//! client, which has to evaluate selectors itself.
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as k8s;
use snafu::{Snafu, ensure};

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    LabelSelectorBinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    LabelSelectorUnaryOperatorWithValues { operator: String },

    #[snafu(display("labelSelector has an invalid operator {operator:?}"))]
    LabelSelectorInvalidOperator { operator: String },

    #[snafu(display("selector term {term:?} has an empty key"))]
    EmptyKey { term: String },

    #[snafu(display("selector term {term:?} is malformed"))]
    MalformedTerm { term: String },

    #[snafu(display("selector {selector:?} has unbalanced parentheses"))]
    UnbalancedParentheses { selector: String },

    #[snafu(display("field selector term {term:?} does not use one of =, == or !="))]
    UnsupportedFieldOperator { term: String },
}

/// This trait extends the functionality of [`k8s::LabelSelector`].
pub trait LabelSelectorExt {
    /// Takes a [`k8s::LabelSelector`] and converts it to a String that can be used in
    /// Kubernetes API calls. It will return an error if the LabelSelector contains illegal
    /// things (e.g. an `Exists` operator with a value).
    fn to_query_string(&self) -> Result<String>;
}

impl LabelSelectorExt for k8s::LabelSelector {
    fn to_query_string(&self) -> Result<String> {
        let mut terms: Vec<String> = self
            .match_labels
            .iter()
            .flatten()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        for requirement in self.match_expressions.iter().flatten() {
            let has_values = requirement
                .values
                .as_ref()
                .is_some_and(|values| !values.is_empty());

            let term = match requirement.operator.as_str() {
                operator @ ("In" | "NotIn") => {
                    ensure!(
                        has_values,
                        LabelSelectorBinaryOperatorWithoutValuesSnafu { operator }
                    );
                    let values: Vec<&str> =
                        requirement.values.iter().flatten().map(String::as_str).collect();
                    format!(
                        "{key} {operator} ({values})",
                        key = requirement.key,
                        operator = operator.to_ascii_lowercase(),
                        values = values.join(", ")
                    )
                }
                operator @ ("Exists" | "DoesNotExist") => {
                    ensure!(
                        !has_values,
                        LabelSelectorUnaryOperatorWithValuesSnafu { operator }
                    );
                    if operator == "Exists" {
                        requirement.key.clone()
                    } else {
                        format!("!{key}", key = requirement.key)
                    }
                }
                operator => {
                    return LabelSelectorInvalidOperatorSnafu { operator }.fail();
                }
            };

            terms.push(term);
        }

        Ok(terms.join(","))
    }
}

/// A single label requirement.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    In { key: String, values: BTreeSet<String> },
    NotIn { key: String, values: BTreeSet<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals { key, value } => labels.get(key) == Some(value),
            // A missing label never equals the value, so it satisfies `!=`
            Self::NotEquals { key, value } => labels.get(key) != Some(value),
            Self::In { key, values } => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn { key, values } => !labels.get(key).is_some_and(|v| values.contains(v)),
            Self::Exists { key } => labels.contains_key(key),
            Self::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

/// A parsed label selector in its query string form, e.g. `app=web,tier in (frontend),!legacy`.
///
/// The empty selector matches every object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        let requirements = split_terms(selector)?
            .into_iter()
            .map(parse_label_term)
            .collect::<Result<_>>()?;

        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|requirement| requirement.matches(labels))
    }
}

/// A parsed field selector, e.g. `metadata.name=foo,status.phase!=Running`.
///
/// Fields are addressed by their dotted path in the serialized object. A missing field compares
/// as the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<(String, bool, String)>,
}

impl FieldSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();

        for term in split_terms(selector)? {
            let (path, equal, value) = if let Some((path, value)) = term.split_once("!=") {
                (path, false, value)
            } else if let Some((path, value)) = term.split_once("==") {
                (path, true, value)
            } else if let Some((path, value)) = term.split_once('=') {
                (path, true, value)
            } else {
                return UnsupportedFieldOperatorSnafu { term }.fail();
            };

            let path = path.trim();
            ensure!(!path.is_empty(), EmptyKeySnafu { term });
            requirements.push((path.to_owned(), equal, value.trim().to_owned()));
        }

        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, object: &serde_json::Value) -> bool {
        self.requirements.iter().all(|(path, equal, expected)| {
            let actual = field_value(object, path);
            (actual == *expected) == *equal
        })
    }
}

/// Renders the value at the dotted `path` the way the API server compares field selectors.
fn field_value(object: &serde_json::Value, path: &str) -> String {
    let value = path
        .split('.')
        .try_fold(object, |value, segment| value.get(segment));

    match value {
        Some(serde_json::Value::String(value)) => value.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Splits a selector on the commas which separate its terms, leaving commas inside value sets
/// alone.
fn split_terms(selector: &str) -> Result<Vec<&str>> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (index, character) in selector.char_indices() {
        match character {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| UnbalancedParenthesesSnafu { selector }.build())?;
            }
            ',' if depth == 0 => {
                terms.push(&selector[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }

    ensure!(depth == 0, UnbalancedParenthesesSnafu { selector });
    terms.push(&selector[start..]);

    Ok(terms
        .into_iter()
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .collect())
}

fn parse_label_term(term: &str) -> Result<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        ensure!(!key.is_empty(), EmptyKeySnafu { term });
        ensure!(is_bare_key(key), MalformedTermSnafu { term });
        return Ok(Requirement::DoesNotExist { key: key.to_owned() });
    }

    if let Some(open) = term.find('(') {
        let (head, set) = term.split_at(open);
        let set = set
            .strip_prefix('(')
            .and_then(|set| set.strip_suffix(')'))
            .ok_or_else(|| MalformedTermSnafu { term }.build())?;
        let values: BTreeSet<String> = set
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        let mut words = head.split_whitespace();
        let (Some(key), Some(operator), None) = (words.next(), words.next(), words.next()) else {
            return MalformedTermSnafu { term }.fail();
        };
        ensure!(
            !values.is_empty(),
            LabelSelectorBinaryOperatorWithoutValuesSnafu { operator }
        );

        let key = key.to_owned();
        return match operator {
            "in" => Ok(Requirement::In { key, values }),
            "notin" => Ok(Requirement::NotIn { key, values }),
            operator => LabelSelectorInvalidOperatorSnafu { operator }.fail(),
        };
    }

    let requirement = if let Some((key, value)) = term.split_once("!=") {
        Requirement::NotEquals {
            key: key.trim().to_owned(),
            value: value.trim().to_owned(),
        }
    } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        Requirement::Equals {
            key: key.trim().to_owned(),
            value: value.trim().to_owned(),
        }
    } else {
        ensure!(is_bare_key(term), MalformedTermSnafu { term });
        Requirement::Exists {
            key: term.to_owned(),
        }
    };

    match &requirement {
        Requirement::Equals { key, .. } | Requirement::NotEquals { key, .. } => {
            ensure!(!key.is_empty(), EmptyKeySnafu { term });
        }
        _ => {}
    }

    Ok(requirement)
}

fn is_bare_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(char::is_whitespace)
}
