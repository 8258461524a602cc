//! Encode/decode identity for every value constructor variant.

use core_types::{Heap, JsBigInt, ObjectId, Value};

#[test]
fn test_roundtrip_all_constructors() {
    let heap = Heap::new();
    let string = heap.strings.intern("roundtrip");
    let symbol = heap.symbols.create(Some("s"));
    let bigint = heap.alloc_bigint(JsBigInt::from_i64(-5));

    let values = vec![
        Value::undefined(),
        Value::null(),
        Value::boolean(true),
        Value::boolean(false),
        Value::int32(0),
        Value::int32(i32::MIN),
        Value::int32(i32::MAX),
        Value::number(0.0),
        Value::number(-0.0),
        Value::number(f64::NAN),
        Value::number(f64::INFINITY),
        Value::number(f64::NEG_INFINITY),
        Value::number(f64::MIN_POSITIVE),
        Value::number(1.0 + f64::EPSILON),
        Value::object(ObjectId(0)),
        Value::object(ObjectId(u32::MAX)),
        Value::string(string),
        Value::symbol(symbol),
        Value::bigint(bigint),
    ];

    for v in values {
        let bits = v.to_bits();
        assert_eq!(Value::from_bits(bits), v, "{:?} did not round-trip", v);
    }
}

#[test]
fn test_negative_zero_preserved() {
    let v = Value::number(-0.0);
    let back = Value::from_bits(v.to_bits()).as_double().unwrap();
    assert_eq!(back, 0.0);
    assert!(back.is_sign_negative());
}

#[test]
fn test_nan_roundtrips_to_nan() {
    let v = Value::number(f64::NAN);
    assert!(Value::from_bits(v.to_bits()).as_double().unwrap().is_nan());
}

#[test]
fn test_symbol_registry_properties() {
    let heap = Heap::new();
    // Symbol.for returns the same symbol for the same key
    let a = heap.symbols.for_key("k");
    let b = heap.symbols.for_key("k");
    assert_eq!(a, b);
    // Symbol.keyFor inverts Symbol.for
    assert_eq!(heap.symbols.key_for(a).as_deref(), Some("k"));
    // Distinct create() calls with equal descriptions are unequal
    let c = heap.symbols.create(Some("d"));
    let d = heap.symbols.create(Some("d"));
    assert!(!Value::symbol(c).strict_equals(Value::symbol(d), &heap));
    assert_eq!(Value::symbol(c).loose_equals(Value::symbol(d), &heap), Some(false));
}
