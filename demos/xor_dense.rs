use rust_stacknet::{
    Activation, ActivationLayer, DataSet, Dense, Loss, LossOutput, NetworkBuilder, NetworkConfig,
    Node, Optimizer,
};

fn main() -> rust_stacknet::Result<()> {
    // Classic XOR dataset.
    let xs = vec![
        vec![0.0, 0.0],
        vec![0.0, 1.0],
        vec![1.0, 0.0],
        vec![1.0, 1.0],
    ];
    let ys = vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]];
    let train = DataSet::from_rows(&xs, &ys)?;

    // 2 -> 8 -> 1, with the hidden nonlinearity as its own parameterless layer.
    let config = NetworkConfig {
        lr: 0.05,
        optimizer: Optimizer::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        },
        ..NetworkConfig::default()
    };
    let mut net = NetworkBuilder::new(config)
        .seed(0)
        .layer(Node::standard(Dense::new(2, 8, Activation::Identity)))
        .layer(Node::standard(ActivationLayer::new(Activation::Tanh)))
        .layer(Node::output(LossOutput::new(8, 1, Activation::Sigmoid, Loss::Mse)))
        .build()?;
    println!("{}", net.summary());

    let mut last = None;
    for _ in 0..500 {
        last = net.fit_dataset(&train, 4)?.final_score;
    }
    println!(
        "epochs={} iterations={} final_score={last:?}",
        net.config().epoch_count,
        net.config().iteration_count
    );

    let out = net.output(&train.features, false)?;
    for (x, y) in xs.iter().zip(out.iter()) {
        println!("x={x:?} y={y:.3}");
    }
    Ok(())
}
