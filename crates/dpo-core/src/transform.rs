//! User transformation interface.
//!
//! An action either copies its main input (identity) or holds an ordered
//! chain of transformation links. A one-to-one link maps a single frame and
//! can be lifted into the chain by naming the subfeed it applies to; frames
//! not named pass through untouched. A many-to-many link sees the whole
//! frame map. After the chain runs, the produced subfeed names must equal
//! the action's declared outputs.
//!
//! Options come in two flavors: static options known at configuration time
//! and runtime options, expressions evaluated against the run context just
//! before the transformation. Both are exposed to the transformation
//! functions through [`TransformerContext`] and to templated strings as
//! `%{name}` tokens.

use crate::error::{DpoError, Result};
use crate::expression;
use crate::frame::DataFrame;
use crate::id::ActionId;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub type OneToOneFn = dyn Fn(&TransformerContext, DataFrame) -> Result<DataFrame> + Send + Sync;
pub type ManyToManyFn = dyn Fn(&TransformerContext, HashMap<String, DataFrame>) -> Result<HashMap<String, DataFrame>>
    + Send
    + Sync;

/// Context handed to every transformation function.
pub struct TransformerContext {
    pub action_id: ActionId,
    /// Static options merged with evaluated runtime options.
    pub options: HashMap<String, String>,
}

#[derive(Clone)]
pub enum TransformerLink {
    OneToOne {
        name: String,
        /// Subfeed this link applies to; may be omitted when the action has
        /// exactly one input.
        subfeed: Option<String>,
        func: Arc<OneToOneFn>,
    },
    ManyToMany {
        name: String,
        func: Arc<ManyToManyFn>,
    },
}

impl TransformerLink {
    pub fn name(&self) -> &str {
        match self {
            TransformerLink::OneToOne { name, .. } => name,
            TransformerLink::ManyToMany { name, .. } => name,
        }
    }
}

impl fmt::Debug for TransformerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformerLink::OneToOne { name, subfeed, .. } => f
                .debug_struct("OneToOne")
                .field("name", name)
                .field("subfeed", subfeed)
                .finish_non_exhaustive(),
            TransformerLink::ManyToMany { name, .. } => f
                .debug_struct("ManyToMany")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformerChain {
    pub links: Vec<TransformerLink>,
    pub options: HashMap<String, String>,
    /// Option name to expression, evaluated against the run context.
    pub runtime_options: HashMap<String, String>,
}

impl TransformerChain {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn new(links: Vec<TransformerLink>) -> Self {
        Self {
            links,
            ..Self::default()
        }
    }

    pub fn is_identity(&self) -> bool {
        self.links.is_empty()
    }

    pub fn one_to_one(
        mut self,
        name: impl Into<String>,
        subfeed: Option<String>,
        func: Arc<OneToOneFn>,
    ) -> Self {
        self.links.push(TransformerLink::OneToOne {
            name: name.into(),
            subfeed,
            func,
        });
        self
    }

    pub fn many_to_many(mut self, name: impl Into<String>, func: Arc<ManyToManyFn>) -> Self {
        self.links.push(TransformerLink::ManyToMany {
            name: name.into(),
            func,
        });
        self
    }

    /// Static options merged with runtime options evaluated against the
    /// context document. Runtime options win on name collisions.
    pub fn resolve_options(&self, context_doc: &Value) -> Result<HashMap<String, String>> {
        let mut options = self.options.clone();
        for (name, expr) in &self.runtime_options {
            let value = expression::evaluate(expr, context_doc)?;
            let rendered = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            options.insert(name.clone(), rendered);
        }
        Ok(options)
    }

    /// Runs the chain over the frame map and validates the result against
    /// the declared outputs. A single remaining frame is renamed onto a
    /// single declared output; any other mismatch is a configuration error.
    pub fn apply(
        &self,
        action_id: &ActionId,
        mut frames: HashMap<String, DataFrame>,
        declared_outputs: &[String],
        context_doc: &Value,
    ) -> Result<HashMap<String, DataFrame>> {
        let ctx = TransformerContext {
            action_id: action_id.clone(),
            options: self.resolve_options(context_doc)?,
        };

        for link in &self.links {
            match link {
                TransformerLink::OneToOne { name, subfeed, func } => {
                    let key = match subfeed {
                        Some(k) => k.clone(),
                        None if frames.len() == 1 => frames.keys().next().cloned().unwrap(),
                        None => {
                            return Err(DpoError::config(format!(
                                "transformer '{}' of action {} needs a subfeed name, the action has {} inputs",
                                name,
                                action_id,
                                frames.len()
                            )))
                        }
                    };
                    let df = frames.remove(&key).ok_or_else(|| {
                        DpoError::config(format!(
                            "transformer '{}' of action {} references unknown subfeed '{}'",
                            name, action_id, key
                        ))
                    })?;
                    let out = func(&ctx, df).map_err(|e| as_transform_error(action_id, e))?;
                    frames.insert(key, out);
                }
                TransformerLink::ManyToMany { func, .. } => {
                    frames =
                        func(&ctx, frames).map_err(|e| as_transform_error(action_id, e))?;
                }
            }
        }

        let produced: BTreeSet<&str> = frames.keys().map(String::as_str).collect();
        let declared: BTreeSet<&str> = declared_outputs.iter().map(String::as_str).collect();
        if produced == declared {
            return Ok(frames);
        }
        if declared.len() == 1 && frames.len() == 1 {
            let df = frames.into_values().next().unwrap();
            let mut renamed = HashMap::new();
            renamed.insert(declared_outputs[0].clone(), df);
            return Ok(renamed);
        }
        Err(DpoError::config(format!(
            "action {} transformation produced subfeeds [{}] but declares outputs [{}]",
            action_id,
            produced.into_iter().collect::<Vec<_>>().join(", "),
            declared.into_iter().collect::<Vec<_>>().join(", ")
        )))
    }
}

/// Soft no-data errors raised by a transformation keep their class, every
/// other failure is fatal for the action.
fn as_transform_error(action_id: &ActionId, e: DpoError) -> DpoError {
    match e {
        DpoError::NoDataDontStop { .. } | DpoError::NoDataStop => e,
        other => DpoError::task(action_id.clone(), anyhow::anyhow!(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(rows: &str) -> DataFrame {
        DataFrame::from_rows(serde_json::from_str(rows).unwrap())
    }

    #[test]
    fn single_frame_is_renamed_onto_a_single_output() {
        let chain = TransformerChain::identity().one_to_one(
            "double",
            None,
            Arc::new(|_, df: DataFrame| Ok(df)),
        );
        let mut frames = HashMap::new();
        frames.insert("src".to_string(), frame(r#"[{"rating": 5}]"#));
        let out = chain
            .apply(
                &ActionId::new("a"),
                frames,
                &["tgt".to_string()],
                &json!({}),
            )
            .unwrap();
        assert!(out.contains_key("tgt"));
    }

    #[test]
    fn unnamed_one_to_one_is_rejected_with_multiple_inputs() {
        let chain = TransformerChain::identity().one_to_one(
            "noop",
            None,
            Arc::new(|_, df: DataFrame| Ok(df)),
        );
        let mut frames = HashMap::new();
        frames.insert("a".to_string(), DataFrame::empty());
        frames.insert("b".to_string(), DataFrame::empty());
        let err = chain
            .apply(
                &ActionId::new("x"),
                frames,
                &["a".to_string(), "b".to_string()],
                &json!({}),
            )
            .unwrap_err();
        assert!(err.to_string().contains("needs a subfeed name"));
    }

    #[test]
    fn output_name_mismatch_is_a_configuration_error() {
        let chain = TransformerChain::identity().many_to_many(
            "route",
            Arc::new(|_, mut frames: HashMap<String, DataFrame>| {
                frames.insert("extra".to_string(), DataFrame::empty());
                Ok(frames)
            }),
        );
        let mut frames = HashMap::new();
        frames.insert("a".to_string(), DataFrame::empty());
        frames.insert("b".to_string(), DataFrame::empty());
        let err = chain
            .apply(
                &ActionId::new("x"),
                frames,
                &["a".to_string(), "b".to_string()],
                &json!({}),
            )
            .unwrap_err();
        assert!(err.to_string().contains("declares outputs"));
    }

    #[test]
    fn runtime_options_override_static_options() {
        let chain = TransformerChain {
            links: Vec::new(),
            options: HashMap::from([("who".to_string(), "static".to_string())]),
            runtime_options: HashMap::from([("who".to_string(), "feed".to_string())]),
        };
        let resolved = chain
            .resolve_options(&json!({"feed": "ingest"}))
            .unwrap();
        assert_eq!(resolved["who"], "ingest");
    }
}
