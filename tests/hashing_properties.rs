//! Property tests for cache key derivation
//!
//! Properties:
//! - keys are deterministic and always 32 lowercase hex characters
//! - map iteration order never changes a key
//! - arguments named with a leading underscore never change a key
//! - distinct values and distinct functions get distinct keys
//! - floats are keyed by their bits, including `NaN` and the infinities

use memo_replay::{make_function_key, make_value_key, CallArgs, FuncIdentity};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// STRATEGIES
// ============================================================================

fn arb_arg_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}"
}

fn arb_json() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[ -~]{0,16}".prop_map(serde_json::Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_float() -> impl Strategy<Value = f64> {
    prop_oneof![
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        any::<f64>(),
    ]
}

/// All NaN payloads share one key
fn float_identity(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

fn is_key(key: &str) -> bool {
    key.len() == 32 && key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_value_key_is_deterministic(name in arb_arg_name(), value in arb_json()) {
        let first = make_value_key("f", &CallArgs::new().arg(&name, &value)).unwrap();
        let second = make_value_key("f", &CallArgs::new().arg(&name, &value)).unwrap();

        prop_assert!(is_key(&first));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_map_order_does_not_matter(
        entries in prop::collection::btree_map("[a-z]{1,8}", any::<i32>(), 0..12)
    ) {
        let forward: HashMap<String, i32> = entries.clone().into_iter().collect();
        let reversed: HashMap<String, i32> = entries.clone().into_iter().rev().collect();
        let sorted: BTreeMap<String, i32> = entries;

        let a = make_value_key("f", &CallArgs::new().arg("m", &forward)).unwrap();
        let b = make_value_key("f", &CallArgs::new().arg("m", &reversed)).unwrap();
        let c = make_value_key("f", &CallArgs::new().arg("m", &sorted)).unwrap();

        prop_assert_eq!(&a, &b);
        prop_assert_eq!(&a, &c);
    }

    #[test]
    fn prop_underscore_arguments_are_ignored(
        value in any::<i64>(),
        ignored in arb_json(),
        suffix in "[a-z]{1,8}",
    ) {
        let without = make_value_key("f", &CallArgs::new().arg("x", &value)).unwrap();
        let with = make_value_key(
            "f",
            &CallArgs::new().arg("x", &value).arg(&format!("_{}", suffix), &ignored),
        )
        .unwrap();

        prop_assert_eq!(without, with);
    }

    #[test]
    fn prop_distinct_values_get_distinct_keys(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(a != b);

        let key_a = make_value_key("f", &CallArgs::new().arg("n", &a)).unwrap();
        let key_b = make_value_key("f", &CallArgs::new().arg("n", &b)).unwrap();

        prop_assert_ne!(key_a, key_b);
    }

    #[test]
    fn prop_floats_are_keyed_by_bits(a in arb_float(), b in arb_float()) {
        let key_a = make_value_key("f", &CallArgs::new().arg("x", &a)).unwrap();
        let key_b = make_value_key("f", &CallArgs::new().arg("x", &b)).unwrap();
        let key_none = make_value_key("f", &CallArgs::new().arg("x", &None::<f64>)).unwrap();

        prop_assert_ne!(&key_a, &key_none);
        if float_identity(a) == float_identity(b) {
            prop_assert_eq!(key_a, key_b);
        } else {
            prop_assert_ne!(key_a, key_b);
        }
    }

    #[test]
    fn prop_argument_name_is_part_of_the_key(
        first in arb_arg_name(),
        second in arb_arg_name(),
        value in any::<u32>(),
    ) {
        prop_assume!(first != second);

        let key_first = make_value_key("f", &CallArgs::new().arg(&first, &value)).unwrap();
        let key_second = make_value_key("f", &CallArgs::new().arg(&second, &value)).unwrap();

        prop_assert_ne!(key_first, key_second);
    }

    #[test]
    fn prop_function_key_tracks_name_and_source(
        module in "[a-z]{1,8}",
        name in "[a-z]{1,8}",
        source in "[ -~]{1,40}",
        other_source in "[ -~]{1,40}",
    ) {
        let plain = make_function_key(&FuncIdentity::new(module.as_str(), name.as_str())).unwrap();
        let again = make_function_key(&FuncIdentity::new(module.as_str(), name.as_str())).unwrap();
        prop_assert!(is_key(&plain));
        prop_assert_eq!(&plain, &again);

        let with_source = make_function_key(
            &FuncIdentity::new(module.as_str(), name.as_str()).source(source.as_str()),
        )
        .unwrap();
        prop_assert_ne!(&plain, &with_source);

        prop_assume!(source != other_source);
        let edited = make_function_key(
            &FuncIdentity::new(module.as_str(), name.as_str()).source(other_source.as_str()),
        )
        .unwrap();
        prop_assert_ne!(with_source, edited);
    }
}
