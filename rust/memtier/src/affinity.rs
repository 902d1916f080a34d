// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Container affinities. An [`Affinity`] is a weighted rule pulling a
//! container toward (positive weight) or away from (negative weight)
//! pools hosting other containers matching an [`Expression`]. The policy
//! sums the weights of matching, already-placed containers per pool and
//! feeds the result into pool scoring.

use std::collections::HashMap;

use anyhow::bail;
use anyhow::Result;
use glob::Pattern;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, Container, TAG_AVX512};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Equal,
    NotEqual,
    MatchesAny,
    MatchesNone,
    MatchesNot,
    AlwaysTrue,
}

/// A predicate over a container attribute. Keys name the attribute:
/// `name`, `namespace`, `pod`, `tags/<tag>` or `labels/<label>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expression {
    pub key: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Expression {
    /// Resolve this expression's key against a container. Missing
    /// attributes resolve to `None`; the operators other than
    /// Exists/DoesNotExist treat that as the empty string.
    fn key_value<'a>(&self, container: &'a Container) -> Option<&'a str> {
        match self.key.as_str() {
            "name" => Some(&container.name),
            "namespace" => Some(&container.namespace),
            "pod" => Some(&container.pod_id),
            key => {
                if let Some(tag) = key.strip_prefix("tags/") {
                    container.get_tag(tag)
                } else if let Some(label) = key.strip_prefix("labels/") {
                    container.labels.get(label).map(String::as_str)
                } else {
                    None
                }
            }
        }
    }

    pub fn evaluate(&self, container: &Container) -> bool {
        let value = self.key_value(container);

        match self.op {
            Operator::AlwaysTrue => true,
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::In => self.values.iter().any(|v| v == value.unwrap_or("")),
            Operator::NotIn => !self.values.iter().any(|v| v == value.unwrap_or("")),
            Operator::Equal => self.values.first().map(String::as_str) == Some(value.unwrap_or("")),
            Operator::NotEqual => {
                self.values.first().map(String::as_str) != Some(value.unwrap_or(""))
            }
            Operator::MatchesAny => self
                .values
                .iter()
                .any(|v| glob_matches(v, value.unwrap_or(""))),
            Operator::MatchesNone => !self
                .values
                .iter()
                .any(|v| glob_matches(v, value.unwrap_or(""))),
            Operator::MatchesNot => !self
                .values
                .first()
                .map(|v| glob_matches(v, value.unwrap_or("")))
                .unwrap_or(false),
        }
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(e) => {
            warn!("ignoring invalid glob pattern {pattern:?}: {e}");
            false
        }
    }
}

/// A weighted affinity rule. Negative weights are anti-affinities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Affinity {
    #[serde(default)]
    pub scope: Option<Expression>,
    #[serde(rename = "match")]
    pub match_expr: Expression,
    pub weight: i32,
}

impl Affinity {
    /// An affinity over all containers matching the keyed attribute.
    pub fn global(key: &str, weight: i32) -> Self {
        Self {
            scope: None,
            match_expr: Expression {
                key: key.to_string(),
                op: Operator::Exists,
                values: Vec::new(),
            },
            weight,
        }
    }

    /// The anti-affine counterpart of [`Affinity::global`].
    pub fn global_anti(key: &str, weight: i32) -> Self {
        Self::global(key, -weight)
    }

    /// Parse the configuration shorthand `[pod/|global/]key<op>v1,v2,…`
    /// where `<op>` is one of `=` (In), `!=` (NotIn), `=~` (MatchesAny)
    /// or `!~` (MatchesNone); a bare `key` means Exists and `!key` means
    /// DoesNotExist. `pod_id` anchors the `pod/` scope to the declaring
    /// pod.
    pub fn parse_shorthand(s: &str, weight: i32, pod_id: &str) -> Result<Self> {
        let (scope, rest) = if let Some(rest) = s.strip_prefix("pod/") {
            (
                Some(Expression {
                    key: "pod".to_string(),
                    op: Operator::Equal,
                    values: vec![pod_id.to_string()],
                }),
                rest,
            )
        } else if let Some(rest) = s.strip_prefix("global/") {
            (None, rest)
        } else {
            (None, s)
        };

        let split_values = |v: &str| -> Vec<String> {
            v.split(',').map(|v| v.trim().to_string()).collect()
        };

        let match_expr = if let Some((key, values)) = rest.split_once("!=") {
            Expression {
                key: key.to_string(),
                op: Operator::NotIn,
                values: split_values(values),
            }
        } else if let Some((key, values)) = rest.split_once("=~") {
            Expression {
                key: key.to_string(),
                op: Operator::MatchesAny,
                values: split_values(values),
            }
        } else if let Some((key, values)) = rest.split_once("!~") {
            Expression {
                key: key.to_string(),
                op: Operator::MatchesNone,
                values: split_values(values),
            }
        } else if let Some((key, values)) = rest.split_once('=') {
            Expression {
                key: key.to_string(),
                op: Operator::In,
                values: split_values(values),
            }
        } else if let Some(key) = rest.strip_prefix('!') {
            Expression {
                key: key.to_string(),
                op: Operator::DoesNotExist,
                values: Vec::new(),
            }
        } else if !rest.is_empty() {
            Expression {
                key: rest.to_string(),
                op: Operator::Exists,
                values: Vec::new(),
            }
        } else {
            bail!("empty affinity expression {:?}", s);
        };

        Ok(Self {
            scope,
            match_expr,
            weight,
        })
    }
}

/// The policy's implicit rules: pull AVX512-tagged containers toward
/// their peers, push untagged ones away from them.
pub fn implicit_affinities(container: &Container) -> Vec<Affinity> {
    let key = format!("tags/{TAG_AVX512}");
    if container.get_tag(TAG_AVX512).is_some() {
        vec![Affinity::global(&key, 5)]
    } else {
        vec![Affinity::global_anti(&key, 5)]
    }
}

/// Evaluate the declared and implicit affinities of a container against
/// all other cached containers, producing per-container weights.
pub fn calculate_container_affinity(
    container: &Container,
    cache: &Cache,
) -> HashMap<String, i32> {
    let mut result = HashMap::new();

    let mut rules = container.affinities.clone();
    rules.extend(implicit_affinities(container));

    for rule in &rules {
        for other in cache.containers() {
            if other.id == container.id {
                continue;
            }
            if let Some(scope) = &rule.scope {
                if !scope.evaluate(other) {
                    continue;
                }
            }
            if rule.match_expr.evaluate(other) {
                *result.entry(other.id.clone()).or_insert(0) += rule.weight;
            }
        }
    }

    result
}
