mod test_roundtrip;
