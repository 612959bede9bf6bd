//! Remote function declarations and call argument normalization.
//!
//! A remote function is a serializable value that declares, at compile time,
//! everything the job builder needs to know about it:
//! - [`RemoteFunction::NAME`]: the entry point the runtime invokes.
//! - [`RemoteFunction::PARAMETERS`]: the parameter names, in positional order.
//!   A parameter named `obj` marks the function as object-processing, which
//!   makes the builder partition its inputs.
//! - [`RemoteFunction::MODULES`]: the modules the function references. These
//!   are the roots from which dependencies are resolved and bundled.
//!
//! The trait is normally derived:
//!
//! ```rust
//! use nimbus::RemoteFunction;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, RemoteFunction)]
//! #[nimbus(name = "count_words", params(obj, min_len), modules("textutils"))]
//! struct CountWords;
//!
//! assert_eq!(CountWords::NAME, "count_words");
//! assert!(CountWords::is_object_processing());
//! ```
//!
//! # Call arguments
//!
//! Each element of a job's input data describes one call. [`normalize_args`]
//! turns every element into [`CallArgs`], a map from parameter name to value,
//! accepting three shapes:
//! - a JSON object whose keys are all declared parameters (named arguments),
//! - a JSON array with exactly one value per parameter (positional arguments),
//! - any other value, when the function takes exactly one parameter.
use serde_json::{Map, Value};

use crate::{
    error::{JobError, Result},
    serializer::{Serializable, Serializer},
};

/// The parameter name that marks a function as object-processing.
pub const OBJECT_PARAMETER: &str = "obj";

/// Named arguments of one call.
pub type CallArgs = Map<String, Value>;

/// A declared remote function.
pub trait RemoteFunction: Serializable {
    const NAME: &'static str;
    const PARAMETERS: &'static [&'static str];
    const MODULES: &'static [&'static str];

    fn is_object_processing() -> bool {
        Self::PARAMETERS.contains(&OBJECT_PARAMETER)
    }

    /// The serialized function body.
    fn as_bytes(&self, serializer: Serializer) -> anyhow::Result<Vec<u8>> {
        serializer.to_bytes(self)
    }
}

/// Normalizes every element of `iterdata` into named arguments of `F`.
///
/// A call is an object of named arguments, or a non-empty array binding the
/// leading parameters in order; a one-parameter function also takes any other
/// value as its single argument. `extra_args` are merged into every call. A
/// call that names an unknown parameter, names a parameter twice, or leaves a
/// parameter unset fails the whole batch.
pub fn normalize_args<F: RemoteFunction>(
    iterdata: Vec<Value>,
    extra_args: Option<&CallArgs>,
) -> Result<Vec<CallArgs>> {
    normalize_with(F::NAME, F::PARAMETERS, iterdata, extra_args)
}

pub(crate) fn normalize_with(
    name: &str,
    params: &[&str],
    iterdata: Vec<Value>,
    extra_args: Option<&CallArgs>,
) -> Result<Vec<CallArgs>> {
    if let Some(extra) = extra_args {
        if let Some(unknown) = extra.keys().find(|k| !params.contains(&k.as_str())) {
            return Err(JobError::invalid_arguments(format!(
                "{name}() got an unexpected extra argument `{unknown}`"
            )));
        }
    }

    iterdata
        .into_iter()
        .enumerate()
        .map(|(index, elem)| {
            let mut args = match elem {
                Value::Object(map) if map.keys().all(|k| params.contains(&k.as_str())) => map,
                Value::Array(values) if !values.is_empty() && values.len() <= params.len() => params
                    .iter()
                    .map(|p| p.to_string())
                    .zip(values)
                    .collect(),
                value if params.len() == 1 => {
                    let mut map = Map::new();
                    map.insert(params[0].to_string(), value);
                    map
                }
                value => {
                    return Err(JobError::invalid_arguments(format!(
                        "call {index}: {name}() takes parameters {params:?}, got {value}"
                    )))
                }
            };

            if let Some(extra) = extra_args {
                for (key, value) in extra {
                    if args.contains_key(key) {
                        return Err(JobError::invalid_arguments(format!(
                            "call {index}: {name}() got multiple values for argument `{key}`"
                        )));
                    }
                    args.insert(key.clone(), value.clone());
                }
            }

            if let Some(missing) = params.iter().find(|p| !args.contains_key(**p)) {
                return Err(JobError::invalid_arguments(format!(
                    "call {index}: {name}() missing required argument `{missing}`"
                )));
            }

            Ok(args)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, name = "add", params(x, y))]
    struct Add;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, params(x))]
    struct Square;

    #[derive(Serialize, Deserialize, nimbus_function_derive::RemoteFunction)]
    #[nimbus(internal, params(obj, sep), modules("textutils", "textutils.split"))]
    struct Split;

    #[test]
    fn derive_declares_contract() {
        assert_eq!(Add::NAME, "add");
        assert_eq!(Square::NAME, "Square");
        assert_eq!(Split::MODULES, &["textutils", "textutils.split"]);
        assert!(Split::is_object_processing());
        assert!(!Add::is_object_processing());
    }

    #[test]
    fn accepts_all_call_shapes() {
        let calls =
            normalize_args::<Add>(vec![json!({"x": 1, "y": 2}), json!([3, 4])], None).unwrap();
        assert_eq!(Value::Object(calls[0].clone()), json!({"x": 1, "y": 2}));
        assert_eq!(Value::Object(calls[1].clone()), json!({"x": 3, "y": 4}));

        let calls = normalize_args::<Square>(vec![json!(1), json!([5, 6])], None).unwrap();
        assert_eq!(Value::Object(calls[0].clone()), json!({"x": 1}));
        assert_eq!(Value::Object(calls[1].clone()), json!({"x": [5, 6]}));
    }

    #[test]
    fn extra_args_fill_every_call() {
        let extra = json!({"y": 10}).as_object().cloned().unwrap();
        let calls = normalize_args::<Add>(vec![json!({"x": 1}), json!({"x": 2})], Some(&extra))
            .unwrap();
        assert!(calls.iter().all(|c| c["y"] == json!(10)));
    }

    #[test]
    fn short_positional_calls_take_the_rest_from_extra_args() {
        let extra = json!({"y": 10}).as_object().cloned().unwrap();
        let calls = normalize_args::<Add>(vec![json!([1]), json!([[2, 3]])], Some(&extra)).unwrap();
        assert_eq!(Value::Object(calls[0].clone()), json!({"x": 1, "y": 10}));
        assert_eq!(Value::Object(calls[1].clone()), json!({"x": [2, 3], "y": 10}));

        assert!(matches!(
            normalize_args::<Add>(vec![json!([1])], None),
            Err(JobError::InvalidArguments(_))
        ));
        // An empty array is a value, not an empty argument list.
        let calls = normalize_args::<Square>(vec![json!([])], None).unwrap();
        assert_eq!(Value::Object(calls[0].clone()), json!({"x": []}));
    }

    #[test]
    fn rejects_mismatched_calls() {
        assert!(matches!(
            normalize_args::<Add>(vec![json!({"x": 1})], None),
            Err(JobError::InvalidArguments(_))
        ));
        assert!(matches!(
            normalize_args::<Add>(vec![json!([1, 2, 3])], None),
            Err(JobError::InvalidArguments(_))
        ));
        let extra = json!({"z": 1}).as_object().cloned().unwrap();
        assert!(matches!(
            normalize_args::<Add>(vec![json!([1, 2])], Some(&extra)),
            Err(JobError::InvalidArguments(_))
        ));
        let extra = json!({"y": 1}).as_object().cloned().unwrap();
        assert!(matches!(
            normalize_args::<Add>(vec![json!([1, 2])], Some(&extra)),
            Err(JobError::InvalidArguments(_))
        ));
    }
}
