mod test_lowering_shapes;
