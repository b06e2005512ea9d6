use ndarray::Axis;

use rust_stacknet::{
    Activation, BackpropType, DataSet, Loss, LossOutput, NetworkBuilder, NetworkConfig, Node,
    ScoreLogger, SimpleRnn, tensor,
};

const BATCH: usize = 4;
const STEPS: usize = 60;

/// Predict the next value of a phase-shifted sine wave.
fn sine_batch() -> rust_stacknet::Result<DataSet> {
    let mut features = Vec::with_capacity(BATCH * STEPS);
    let mut labels = Vec::with_capacity(BATCH * STEPS);
    for b in 0..BATCH {
        let phase = b as f32 * 0.7;
        for t in 0..STEPS {
            features.push((phase + t as f32 * 0.2).sin());
            labels.push((phase + (t + 1) as f32 * 0.2).sin());
        }
    }
    DataSet::new(
        tensor::from_vec(&[BATCH, 1, STEPS], features)?,
        tensor::from_vec(&[BATCH, 1, STEPS], labels)?,
    )
}

fn main() -> rust_stacknet::Result<()> {
    let train = sine_batch()?;
    let config = NetworkConfig {
        backprop_type: BackpropType::TruncatedBptt,
        tbptt_fwd_length: 15,
        tbptt_back_length: 15,
        lr: 0.02,
        ..NetworkConfig::default()
    };
    let mut net = NetworkBuilder::new(config)
        .seed(3)
        .layer(Node::recurrent(SimpleRnn::new(1, 16, Activation::Tanh)))
        .layer(Node::output(LossOutput::new(16, 1, Activation::Identity, Loss::Mse)))
        .build()?;
    net.add_listener(ScoreLogger::new(50));

    for epoch in 0..200 {
        let report = net.fit_dataset(&train, BATCH)?;
        if epoch % 50 == 0 {
            println!("epoch={epoch} updates={} score={:?}", report.iterations, report.final_score);
        }
    }

    // Stream the first sequence through one step at a time, carrying the state.
    let first = train.features.index_axis(Axis(0), 0).to_owned();
    net.rnn_clear_previous_state();
    for t in 0..10 {
        let x = tensor::from_vec(&[1, 1], vec![first[[0, t]]])?;
        let y = net.rnn_time_step(&x)?;
        println!("t={t} x={:.3} next={:.3}", first[[0, t]], y[[0, 0]]);
    }
    Ok(())
}
