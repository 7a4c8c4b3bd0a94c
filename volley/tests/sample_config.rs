//! The sample configuration shipped at the workspace root must stay loadable

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use volley::{Volley, simulation::Simulation};

#[test]
fn test_sample_config_loads_and_validates() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../volley.config.ron");
    let config = Volley::load(&path).expect("sample config parses");

    config.validate().expect("sample config is valid");
    assert_eq!(config.dispatch.worker_count, 30);
    assert_eq!(config.dispatch.rate_limit.burst_size, Some(40));
    assert_eq!(config.simulation.campaigns.len(), 2);
    assert!(!config.metrics.enabled);

    let simulation = Simulation::seed(config.simulation).unwrap();
    assert_eq!(simulation.campaign_ids.len(), 2);
}
