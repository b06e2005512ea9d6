use rust_stacknet::{
    Activation, DataSet, Dense, Loss, LossOutput, NetworkBuilder, NetworkConfig, Node,
};

fn main() -> rust_stacknet::Result<()> {
    // Fields left out take their defaults.
    let config = NetworkConfig::from_json_str(
        r#"{
            "seed": 11,
            "lr": 0.1,
            "optimizer": { "SgdMomentum": { "momentum": 0.9 } },
            "lr_schedule": { "StepDecay": { "step_size": 100, "gamma": 0.5 } }
        }"#,
    )?;

    let path = std::env::temp_dir().join("rust_stacknet_config.json");
    config.save_json(&path)?;
    let loaded = NetworkConfig::load_json(&path)?;
    assert_eq!(loaded, config);
    println!("{}", loaded.to_json_string_pretty()?);

    let train = DataSet::from_rows(
        &[vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
        &[vec![1.0], vec![1.0], vec![2.0]],
    )?;
    let mut net = NetworkBuilder::new(loaded)
        .layer(Node::standard(Dense::new(2, 4, Activation::ReLU)))
        .layer(Node::output(LossOutput::new(4, 1, Activation::Identity, Loss::Mse)))
        .build()?;
    for _ in 0..200 {
        net.fit_dataset(&train, 3)?;
    }
    println!("score={:?}", net.score_dataset(&train)?);

    // The updater state travels separately from the configuration.
    let state = net.updater_state();
    println!("updater state entries={}", state.len());
    Ok(())
}
