use anyhow::Context;
use env_logger::Builder;
use log::{LevelFilter, info};
use std::path::PathBuf;

use lorawan_mac_simulator::common::{SimulationConfig, load_scene};
use lorawan_mac_simulator::simulation::Network;

fn usage() -> ! {
    eprintln!("usage: lorawan-mac-simulator <scene.json> [config.toml]");
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(scene_path) = args.next() else { usage() };
    let explicit_config = args.next().map(PathBuf::from);
    if args.next().is_some() {
        usage();
    }

    let config = match &explicit_config {
        Some(path) => SimulationConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            let path = SimulationConfig::config_path_from_scene(&scene_path);
            if path.exists() {
                SimulationConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
            } else {
                SimulationConfig::default()
            }
        }
    };

    // Logging setup
    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Info)
        .filter(Some("lorawan_mac_simulator"), LevelFilter::Debug);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    if let Some(level) = config.log_level()? {
        builder.filter(Some("lorawan_mac_simulator"), level);
    }
    builder.init();

    let scene = load_scene(&scene_path).with_context(|| format!("loading scene {}", scene_path))?;
    info!(
        "Starting up: {} gateways, {} end devices, {} s of simulated time",
        scene.gateways.len(),
        scene.end_devices.len(),
        config.simulation.duration_secs
    );

    let mut network = Network::from_scene(&scene, &config);
    network.run_for(config.duration());

    info!("Simulation finished at {} s", network.now().as_secs());
    println!("{}", network.stats());
    Ok(())
}
