//! dust link simulation: the HELLO pair under several channel conditions

use anyhow::{Context, Result};
use colored::Colorize;
use dust_sim::{scenarios, ConfigError, SimConfig, SimulationPresets};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let path = SimConfig::path_from_env(std::env::args().skip(1));
    let sim = SimConfig::load(path.as_deref()).context("loading simulation config")?;

    println!("{}", "Dust Link Simulation".bright_blue().bold());
    println!("{}", "====================".bright_blue());
    println!("Node {} -> master {}, message {:?}", sim.node, sim.peer, sim.message);

    for name in &sim.presets {
        let radio = SimulationPresets::by_name(name).ok_or_else(|| ConfigError::UnknownPreset(name.clone()))?;
        let header = format!("\n>>> {} conditions", name);
        if radio.packet_loss >= 0.5 {
            println!("{}", header.bright_red().bold());
        } else {
            println!("{}", header.bright_green().bold());
        }
        println!("Bandwidth: {} bps", radio.bandwidth_bps);
        println!("Packet Loss: {}%", (radio.packet_loss * 100.0) as u32);
        println!("Latency: {:?} (+{:?} jitter)", radio.latency, radio.latency_jitter);

        println!("\n{}", "HELLO exchange".bright_yellow());
        scenarios::hello_exchange(radio.clone(), &sim).await?;

        println!("\n{}", format!("Burst of {}", sim.burst).bright_yellow());
        scenarios::burst_test(radio.clone(), &sim).await?;

        println!("{}", "-".repeat(50));
    }

    println!("\n{}", ">>> Master off the air".bright_red().bold());
    scenarios::unreachable_master(SimulationPresets::good_conditions(), &sim).await?;

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
