use rust_stacknet::{
    Activation, ActivationLayer, Dense, Error, Loss, LossOutput, Network, NetworkBuilder,
    NetworkConfig, Node, SimpleRnn, TensorMap, tensor,
};

fn network() -> Network {
    NetworkBuilder::new(NetworkConfig::default())
        .seed(9)
        .layer(Node::recurrent(SimpleRnn::new(3, 4, Activation::Tanh)))
        .layer(Node::standard(ActivationLayer::new(Activation::ReLU)))
        .layer(Node::standard(Dense::new(4, 2, Activation::Sigmoid)))
        .layer(Node::output(LossOutput::new(2, 2, Activation::Identity, Loss::Mse)))
        .build()
        .unwrap()
}

#[test]
fn table_lists_every_parameter_in_layer_order() {
    let net = network();
    let table = net.param_table().unwrap();
    let keys: Vec<&str> = table.keys().collect();
    assert_eq!(
        keys,
        vec!["0_W", "0_RW", "0_b", "2_W", "2_b", "3_W", "3_b"]
    );
    assert_eq!(table.get("0_RW").unwrap().shape(), &[4, 4]);
    let total: usize = table.iter().map(|(_, t)| t.len()).sum();
    assert_eq!(total, net.num_params());
}

#[test]
fn setting_the_table_it_returned_is_a_no_op() {
    let mut net = network();
    let before = net.params();
    let ptr = net.params_ptr();
    let ranges: Vec<_> = (0..4).map(|i| net.param_range(i).unwrap()).collect();

    let table = net.param_table().unwrap();
    net.set_param_table(&table).unwrap();

    assert_eq!(net.params(), before);
    assert_eq!(net.params_ptr(), ptr);
    let after: Vec<_> = (0..4).map(|i| net.param_range(i).unwrap()).collect();
    assert_eq!(after, ranges);
}

#[test]
fn a_table_with_a_different_key_set_changes_nothing() {
    let mut net = network();
    let before = net.params();

    let mut table = net.param_table().unwrap();
    table.insert("2_W", tensor::zeros(&[4, 2]));
    table.remove("3_b");
    assert!(matches!(
        net.set_param_table(&table),
        Err(Error::InvalidConfig(_))
    ));
    assert_eq!(net.params(), before);

    let mut extra = net.param_table().unwrap();
    extra.insert("9_W", tensor::zeros(&[1, 1]));
    assert!(net.set_param_table(&extra).is_err());
    assert_eq!(net.params(), before);
}

#[test]
fn a_wrong_shape_anywhere_changes_nothing() {
    let mut net = network();
    let before = net.params();

    let mut table: TensorMap = net.param_table().unwrap();
    // Valid update to an early entry, invalid shape on a later one.
    table.insert("0_b", tensor::zeros(&[1, 4]));
    table.insert("3_W", tensor::zeros(&[2, 3]));
    assert!(matches!(
        net.set_param_table(&table),
        Err(Error::ShapeMismatch(_))
    ));
    assert_eq!(net.params(), before);
}

#[test]
fn keyed_access_reads_and_writes_single_parameters() {
    let mut net = network();
    let b = tensor::from_vec(&[1, 2], vec![0.25, -0.75]).unwrap();
    net.set_param_by_key("2_b", &b).unwrap();
    assert_eq!(net.get_param_by_key("2_b").unwrap(), b);
    assert_eq!(net.get_param(2, "b").unwrap(), b);

    assert!(matches!(net.get_param_by_key("W"), Err(Error::InvalidParamKey(_))));
    assert!(matches!(net.get_param_by_key("x_W"), Err(Error::InvalidParamKey(_))));
    assert!(matches!(net.get_param_by_key("2_nope"), Err(Error::InvalidParamKey(_))));
    assert!(matches!(net.get_param_by_key("8_W"), Err(Error::InvalidIndex(_))));
}

#[test]
fn whole_buffer_assignment_checks_length() {
    let mut net = network();
    let n = net.num_params();
    let ones = tensor::row_vector(&vec![1.0; n]);
    net.set_params(&ones).unwrap();
    assert!(net.params().iter().all(|&v| v == 1.0));

    let short = tensor::row_vector(&vec![1.0; n - 1]);
    assert!(matches!(net.set_params(&short), Err(Error::ShapeMismatch(_))));
}
