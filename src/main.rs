use std::collections::BTreeMap;

use clap::Parser;
use log::info;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use rust_dqmc::{
    read_run_config, Checkpoint, ContinuousTimeSimulation, Measurement, Replica, Result, RunConfig, Simulation,
    TimeDiscretization,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yml")]
    config: String,
    /// Where to write the final checkpoint; overrides the config file
    #[arg(long)]
    checkpoint: Option<String>,
    /// Continue from a checkpoint instead of drawing a fresh configuration
    #[arg(short, long)]
    resume: Option<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = read_run_config(&args.config)?;
    let checkpoint = args.resume.as_ref().map(Checkpoint::load).transpose()?;
    let discretization = checkpoint
        .as_ref()
        .map_or(config.simulation.discretization, |c| c.parameters.discretization);
    match discretization {
        TimeDiscretization::Trotter => drive::<Simulation>(args, &config, checkpoint),
        TimeDiscretization::Continuous => drive::<ContinuousTimeSimulation>(args, &config, checkpoint),
    }
}

fn drive<S: Replica>(args: &Args, config: &RunConfig, checkpoint: Option<Checkpoint>) -> Result<()> {
    let (mut simulation, mut rng, mut summaries, mut thermalized, mut measured) = match checkpoint {
        Some(checkpoint) => {
            info!(
                "resuming after {} thermalization and {} measurement sweeps",
                checkpoint.thermalization_done, checkpoint.sweeps_done
            );
            let simulation = S::resume(&checkpoint)?;
            (
                simulation,
                checkpoint.rng,
                checkpoint.summaries,
                checkpoint.thermalization_done,
                checkpoint.sweeps_done,
            )
        }
        None => {
            let mut rng = Pcg64::seed_from_u64(config.simulation.seed);
            let simulation = S::start(config.simulation.clone(), &mut rng)?;
            (simulation, rng, BTreeMap::<String, Measurement>::new(), 0, 0)
        }
    };

    while thermalized < config.thermalization {
        simulation.sweep(&mut rng)?;
        thermalized += 1;
    }
    info!("thermalized after {thermalized} sweeps, log-weight {:.6}", simulation.log_weight());

    let mut acceptance = Measurement::new();
    let mut site_flips = (0, 0);
    let mut warnings = 0;
    while measured < config.sweeps {
        let report = simulation.sweep(&mut rng)?;
        acceptance.merge(&report.acceptance);
        summaries.entry("step_sign".to_string()).or_default().merge(&report.sign);
        site_flips.0 += report.site_flips_attempted;
        site_flips.1 += report.site_flips_accepted;
        warnings += report.warnings();
        let sample = simulation.measure()?;
        for (name, value) in sample.named_values() {
            summaries.entry(name).or_default().add(value);
        }
        measured += 1;
        if measured % 100 == 0 {
            info!("{measured}/{} sweeps measured", config.sweeps);
        }
    }

    let p = simulation.parameters();
    println!("DQMC Simulation Results for the Hubbard Model");
    println!("---------------------------------------------");
    println!("Lattice: {}x{}x{}, N = {}, beta = {}", p.lx, p.ly, p.lz, p.time_slices, p.beta);
    println!("U = {}, mu = {}, B = {}, h = {}", p.u, p.mu, p.b, p.h);
    println!("Discretization: {:?}, stabilization: {:?}", p.discretization, p.stabilization);
    println!("Measurement sweeps: {measured}");
    if acceptance.samples() > 0 {
        println!("Acceptance rate: {:.4} ± {:.4}", acceptance.mean(), acceptance.error());
    }
    if site_flips.0 > 0 {
        println!("Site-flip acceptance: {}/{}", site_flips.1, site_flips.0);
    }
    println!("Drift warnings: {warnings}");
    for (name, m) in &summaries {
        println!("{name:<28} {:>14.8} ± {:.8}", m.mean(), m.error());
    }

    if let Some(path) = args.checkpoint.as_ref().or(config.checkpoint.as_ref()) {
        let checkpoint = Checkpoint {
            parameters: simulation.parameters().clone(),
            state: simulation.snapshot(),
            rng,
            summaries,
            thermalization_done: thermalized,
            sweeps_done: measured,
        };
        checkpoint.save(path)?;
        info!("checkpoint written to {path}");
    }
    Ok(())
}
