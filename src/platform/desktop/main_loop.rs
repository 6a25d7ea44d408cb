use std::{collections::BTreeMap, time::Instant};

use clap::{value_t, App, AppSettings, Arg, ArgMatches, SubCommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use liquid_sph::{
    floating_type_mod::FT, DeviceClass, EquationOfState, ExecutionMode, FluidSolver, PredictiveCorrective,
    PressureSolver, SceneConfig, SimulationError, SolverConfig, V3,
};

const CARGO_PKG_AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &'static str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &'static str = env!("CARGO_PKG_DESCRIPTION");

pub fn start() {
    let matches = App::new("Liquid SPH")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a scene headless and print a summary")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Solver parameters (YAML)")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Collision objects and emitters (YAML)")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("STEPS")
                        .long("steps")
                        .short("n")
                        .takes_value(true)
                        .default_value("1000")
                        .help("Number of time steps"),
                )
                .arg(
                    Arg::with_name("DT")
                        .long("dt")
                        .takes_value(true)
                        .default_value("0.001")
                        .help("Time step in seconds"),
                )
                .arg(
                    Arg::with_name("SOLVER")
                        .long("solver")
                        .takes_value(true)
                        .possible_values(&["sph", "pcisph"])
                        .default_value("pcisph")
                        .help("Pressure solver"),
                )
                .arg(
                    Arg::with_name("PARALLEL")
                        .long("parallel")
                        .takes_value(false)
                        .help("Execute on a compute device if one is available"),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite individual entries of the simulation config"),
                ),
        )
        .subcommand(
            SubCommand::with_name("write-default-config")
                .about("Write the default simulation config")
                .arg(
                    Arg::with_name("OUTPUT_YAML")
                        .help("YAML file the config is written to")
                        .default_value("./simulation-config.yaml")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .get_matches();

    init_logging(matches.occurrences_of("v"));

    let result = if let Some(run_matches) = matches.subcommand_matches("run") {
        run(run_matches)
    } else if let Some(subcmd_matches) = matches.subcommand_matches("write-default-config") {
        write_default_config(subcmd_matches.value_of("OUTPUT_YAML").unwrap_or("./simulation-config.yaml"))
    } else {
        unreachable!()
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbosity: u64) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn write_default_config(path: &str) -> Result<(), SimulationError> {
    std::fs::write(path, SolverConfig::default().to_yaml()?)?;
    println!("Writing to file `{}`...", path);
    Ok(())
}

/// Simulation config with the entries of the overwrite file replaced. Unknown keys are rejected on parsing.
fn load_config(path: &str, overwrite_path: Option<&str>) -> Result<SolverConfig, SimulationError> {
    let mut config_value: serde_yaml::Value = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;

    if let Some(overwrite_path) = overwrite_path {
        let overwrites: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&std::fs::read_to_string(overwrite_path)?)?;
        if let serde_yaml::Value::Mapping(mapping) = &mut config_value {
            for (k, v) in overwrites {
                mapping.insert(serde_yaml::Value::String(k), v);
            }
        } else {
            config_value = serde_yaml::to_value(overwrites)?;
        }
    }

    let config: SolverConfig = serde_yaml::from_value(config_value)?;
    config.validate()?;
    Ok(config)
}

fn run(run_matches: &ArgMatches) -> Result<(), SimulationError> {
    let parameter_file = run_matches.value_of("SIMULATION_CONFIG").unwrap_or_default();
    let mut config = load_config(parameter_file, run_matches.value_of("OVERWRITE_CONFIG_FILE"))?;
    if run_matches.is_present("PARALLEL") {
        config.execution_mode = ExecutionMode::Parallel(DeviceClass::Gpu);
    }
    info!("{:?}", config);

    let scene_file_path = run_matches.value_of("SCENE_CONFIG").unwrap_or_default();
    let scene_config = SceneConfig::from_yaml(&std::fs::read_to_string(scene_file_path)?)?;

    let steps = value_t!(run_matches, "STEPS", usize).unwrap_or_else(|e| e.exit());
    let time_step = value_t!(run_matches, "DT", FT).unwrap_or_else(|e| e.exit());

    match run_matches.value_of("SOLVER") {
        Some("sph") => simulate::<EquationOfState>(config, &scene_config, steps, time_step),
        _ => simulate::<PredictiveCorrective>(config, &scene_config, steps, time_step),
    }
}

fn simulate<P: PressureSolver + Default>(
    config: SolverConfig,
    scene_config: &SceneConfig,
    steps: usize,
    time_step: FT,
) -> Result<(), SimulationError> {
    let mut solver = FluidSolver::<P>::new(config)?;
    let emitted = scene_config.populate(&mut solver);
    info!(
        "emitted {} particles, {} collision objects",
        emitted,
        solver.static_collision_objects().len()
    );

    let start = Instant::now();
    for step in 0..steps {
        solver.update(time_step)?;
        if (step + 1) % 100 == 0 {
            info!("step {}/{} ({:.3}s simulated)", step + 1, steps, (step + 1) as FT * time_step);
        }
    }
    let elapsed = start.elapsed();

    print_summary(&solver, steps, elapsed.as_secs_f64());
    Ok(())
}

fn print_summary<P: PressureSolver>(solver: &FluidSolver<P>, steps: usize, seconds: f64) {
    let positions = &solver.particles().position;
    let (min, max) = positions.iter().fold(
        (V3::repeat(FT::INFINITY), V3::repeat(FT::NEG_INFINITY)),
        |(min, max), p| (min.inf(p), max.sup(p)),
    );

    println!("solver:            {}", P::NAME);
    println!("execution mode:    {:?}", solver.execution_mode());
    println!("particles:         {}", solver.particle_count());
    println!("particle mass:     {}", solver.particle_mass());
    println!("kernel radius:     {}", solver.kernel_radius());
    if !positions.is_empty() {
        println!(
            "bounding box:      [{}, {}, {}] - [{}, {}, {}]",
            min.x, min.y, min.z, max.x, max.y, max.z
        );
    }
    println!("non-finite values: {}", solver.particles().count_non_finite());
    println!(
        "steps:             {} in {:.2}s ({:.2} ms/step)",
        steps,
        seconds,
        if steps > 0 { 1000. * seconds / steps as f64 } else { 0. }
    );
}

