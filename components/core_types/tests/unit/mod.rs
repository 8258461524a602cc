mod test_bigint_properties;
mod test_value_roundtrip;
