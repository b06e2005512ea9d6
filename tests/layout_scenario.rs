use rust_stacknet::{
    Activation, ActivationLayer, Dense, Error, LossOutput, Loss, NetworkBuilder, NetworkConfig,
    Node, Tensor, tensor,
};

fn builder() -> NetworkBuilder {
    NetworkBuilder::new(NetworkConfig::default())
        .layer(Node::standard(Dense::new(9, 2, Activation::Tanh)))
        .layer(Node::standard(ActivationLayer::new(Activation::ReLU)))
        .layer(Node::output(LossOutput::new(2, 4, Activation::Identity, Loss::Mse)))
}

fn counting(n: usize) -> Tensor {
    tensor::row_vector(&(0..n).map(|i| i as f32).collect::<Vec<_>>())
}

#[test]
fn views_are_contiguous_and_parameterless_layers_have_none() {
    let params = counting(32);
    let net = builder().build_with_params(&params).unwrap();

    assert_eq!(net.num_params(), 32);
    assert_eq!(net.param_range(0).unwrap(), Some(0..20));
    assert_eq!(net.param_range(1).unwrap(), None);
    assert_eq!(net.param_range(2).unwrap(), Some(20..32));
    assert!(net.param_view(1).unwrap().is_none());

    let tail: Vec<f32> = (20..32).map(|i| i as f32).collect();
    assert_eq!(net.param_view(2).unwrap().unwrap(), tail.as_slice());
    assert_eq!(net.params(), params);
}

#[test]
fn setting_layer_zero_writes_the_first_twenty_values() {
    let mut net = builder().build_with_params(&counting(32)).unwrap();
    let ptr = net.params_ptr();

    let w = tensor::from_vec(&[9, 2], (0..18).map(|i| -(i as f32) - 0.5).collect()).unwrap();
    let b = tensor::from_vec(&[1, 2], vec![100.0, 200.0]).unwrap();
    net.set_param(0, "W", &w).unwrap();
    net.set_param(0, "b", &b).unwrap();

    let flat = net.params();
    // W is stored column-major.
    for j in 0..2 {
        for i in 0..9 {
            assert_eq!(flat[[0, j * 9 + i]].to_bits(), w[[i, j]].to_bits());
        }
    }
    assert_eq!(flat[[0, 18]], 100.0);
    assert_eq!(flat[[0, 19]], 200.0);
    assert_eq!(flat[[0, 20]], 20.0);

    assert_eq!(net.get_param(0, "W").unwrap(), w);
    assert_eq!(net.params_ptr(), ptr);
}

#[test]
fn supplied_buffer_must_be_a_row_vector_of_the_right_length() {
    let short = counting(31);
    assert!(matches!(
        builder().build_with_params(&short),
        Err(Error::ShapeMismatch(_))
    ));

    let column = tensor::from_vec(&[32, 1], vec![0.0; 32]).unwrap();
    assert!(matches!(
        builder().build_with_params(&column),
        Err(Error::ShapeMismatch(_))
    ));
}

#[test]
fn out_of_range_layer_index_is_rejected() {
    let mut net = builder().build().unwrap();
    assert!(matches!(net.get_param(3, "W"), Err(Error::InvalidIndex(_))));
    let w = tensor::zeros(&[9, 2]);
    assert!(matches!(net.set_param(7, "W", &w), Err(Error::InvalidIndex(_))));
    assert!(matches!(net.param_range(3), Err(Error::InvalidIndex(_))));
}

#[test]
fn every_layer_starts_where_the_previous_one_ends() {
    let net = NetworkBuilder::new(NetworkConfig::default())
        .layer(Node::standard(Dense::new(3, 5, Activation::Tanh)))
        .layer(Node::standard(ActivationLayer::new(Activation::Sigmoid)))
        .layer(Node::standard(Dense::new(5, 4, Activation::ReLU)))
        .layer(Node::standard(ActivationLayer::new(Activation::Identity)))
        .layer(Node::output(LossOutput::new(4, 2, Activation::Identity, Loss::Mse)))
        .build()
        .unwrap();

    let counts = [3 * 5 + 5, 0, 5 * 4 + 4, 0, 4 * 2 + 2];
    let mut offset = 0;
    for (idx, &count) in counts.iter().enumerate() {
        let range = net.param_range(idx).unwrap();
        if count == 0 {
            assert_eq!(range, None);
        } else {
            assert_eq!(range, Some(offset..offset + count));
        }
        offset += count;
    }
    assert_eq!(net.num_params(), offset);
}
