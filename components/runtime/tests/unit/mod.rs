mod test_inline_cache_scenarios;
