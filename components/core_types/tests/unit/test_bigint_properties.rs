//! Algebraic properties of the BigInt primitive, cross-checked against
//! num-bigint on a spread of magnitudes.

use core_types::JsBigInt;
use num_bigint::BigInt;

fn big(text: &str) -> JsBigInt {
    JsBigInt::from_str_radix(text, 10).unwrap()
}

const CASES: &[&str] = &[
    "0",
    "1",
    "-1",
    "4294967295",
    "4294967296",
    "-4294967297",
    "123456789012345678901234567890",
    "-340282366920938463463374607431768211455",
    "999999999999999999999999999999999999999999",
];

#[test]
fn test_mul_div_identity() {
    for a in CASES {
        for b in CASES {
            if *b == "0" {
                continue;
            }
            let xa = big(a);
            let xb = big(b);
            let (q, r) = xa.mul(&xb).div_rem(&xb).unwrap();
            assert_eq!(q, xa, "({} * {}) / {}", a, b, b);
            assert!(r.is_zero());
        }
    }
}

#[test]
fn test_add_sub_identity() {
    for a in CASES {
        for b in CASES {
            let xa = big(a);
            let xb = big(b);
            assert_eq!(xa.add(&xb).sub(&xb), xa, "({} + {}) - {}", a, b, b);
        }
    }
}

#[test]
fn test_string_roundtrip_normalizes() {
    for radix in [2u32, 7, 10, 16, 36] {
        for text in CASES {
            let value = big(text);
            let rendered = value.to_string_radix(radix);
            assert_eq!(JsBigInt::from_str_radix(&rendered, radix).unwrap(), value);
        }
    }
    // Leading zeros and an explicit plus normalize away
    assert_eq!(big("+007").to_string(), "7");
    assert_eq!(big("-000").to_string(), "0");
}

#[test]
fn test_differential_arithmetic() {
    for a in CASES {
        for b in CASES {
            let xa = big(a);
            let xb = big(b);
            let na: BigInt = a.parse().unwrap();
            let nb: BigInt = b.parse().unwrap();
            assert_eq!(xa.add(&xb).to_string(), (&na + &nb).to_string());
            assert_eq!(xa.sub(&xb).to_string(), (&na - &nb).to_string());
            assert_eq!(xa.mul(&xb).to_string(), (&na * &nb).to_string());
            assert_eq!(
                xa.compare(&xb),
                na.cmp(&nb),
                "compare({}, {})",
                a,
                b
            );
        }
    }
}

#[test]
fn test_differential_bitwise() {
    for a in CASES {
        for b in CASES {
            let xa = big(a);
            let xb = big(b);
            let na: BigInt = a.parse().unwrap();
            let nb: BigInt = b.parse().unwrap();
            assert_eq!(xa.bit_and(&xb).to_string(), (&na & &nb).to_string());
            assert_eq!(xa.bit_or(&xb).to_string(), (&na | &nb).to_string());
            assert_eq!(xa.bit_xor(&xb).to_string(), (&na ^ &nb).to_string());
        }
    }
}

#[test]
fn test_differential_shifts() {
    for a in CASES {
        for shift in [0u64, 1, 31, 32, 33, 64, 100] {
            let xa = big(a);
            let na: BigInt = a.parse().unwrap();
            assert_eq!(xa.shl(shift).to_string(), (&na << shift).to_string());
            assert_eq!(xa.shr(shift).to_string(), (&na >> shift).to_string());
        }
    }
}
