//! Strategies shared by the property tests.

use proptest::prelude::*;
use serde_json::Value;

use crate::envelope::{codes, CommandError};

/// Arbitrary JSON without floats, nested a few levels deep.
pub(crate) fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 $.]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

prop_compose! {
    pub(crate) fn arb_error()(
        code in prop::sample::select(vec![
            codes::VALIDATION_ERROR,
            codes::NOT_FOUND,
            codes::CONFLICT,
            codes::TIMEOUT,
            codes::INTERNAL_ERROR,
            "CUSTOM_CODE",
        ]),
        message in "[ -~]{0,24}",
        suggestion in proptest::option::of("[a-z ]{1,12}"),
        retryable in any::<bool>(),
    ) -> CommandError {
        let mut error = CommandError::new(code, message).with_retryable(retryable);
        if let Some(suggestion) = suggestion {
            error = error.with_suggestion(suggestion);
        }
        error
    }
}

/// Command names: dotted lowercase segments.
pub(crate) fn arb_command_name() -> impl Strategy<Value = String> {
    "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}"
}
