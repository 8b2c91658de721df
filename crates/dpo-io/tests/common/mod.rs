#![allow(dead_code)]

use dpo_core::frame::{DataFrame, Record};
use dpo_core::transform::TransformerChain;
use std::sync::Arc;

pub fn record(value: serde_json::Value) -> Record {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("expected a json object"),
    }
}

pub fn rows(value: serde_json::Value) -> Vec<Record> {
    serde_json::from_value(value).expect("rows")
}

/// A transformation that always fails, standing in for broken user code.
pub fn failing_transformer() -> TransformerChain {
    TransformerChain::identity().one_to_one(
        "boom",
        None,
        Arc::new(|_, _df: DataFrame| Err(anyhow::anyhow!("transformation blew up").into())),
    )
}

/// Identity as an explicit one-to-one link.
pub fn identity_transformer() -> TransformerChain {
    TransformerChain::identity().one_to_one("noop", None, Arc::new(|_, df: DataFrame| Ok(df)))
}
