use std::env;
use std::fs;
use std::io;
use std::process;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use carlang::analyzer;
use carlang::engine::{Engine, EngineConfig, StepStatus};
use carlang::errors::Severity;
use carlang::world::{GridWorld, MapError};

/// Used when no `--map` is given: a straight road east to the finish.
const DEFAULT_MAP: &str = "\
#########F
car mainCar 0 0 E
";

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("{flag} expects a number, got '{value}'")]
    InvalidNumber { flag: String, value: String },

    #[error("{0} needs a value")]
    MissingValue(String),

    #[error("{0} error(s) found")]
    Invalid(usize),

    #[error("runtime error: {0}")]
    Runtime(String),
}

struct Options {
    source_path: String,
    map_path: Option<String>,
    check_only: bool,
    max_iterations: Option<u64>,
    delay_ms: u64,
    verbose: bool,
}

fn usage() -> ! {
    eprintln!("carlang v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Usage: carlang <script.car> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --check                Parse and validate only");
    eprintln!("  --map <file>           Grid map to drive on (default: a straight road)");
    eprintln!("  --max-iterations <n>   Fail when a loop runs more than n times");
    eprintln!("                         (falls back to CARLANG_MAX_ITERATIONS)");
    eprintln!("  --delay-ms <n>         Wait n milliseconds after each visible command");
    eprintln!("  -v | --verbose         Print the world after every command");
    process::exit(1);
}

fn parse_number(flag: &str, value: &str) -> Result<u64, CliError> {
    value.parse().map_err(|_| CliError::InvalidNumber {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}

fn parse_args(args: &[String]) -> Result<Options, CliError> {
    if args.len() < 2 {
        usage();
    }

    let mut options = Options {
        source_path: args[1].clone(),
        map_path: None,
        check_only: false,
        max_iterations: None,
        delay_ms: 0,
        verbose: false,
    };

    let mut i = 2;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--check" => options.check_only = true,
            "--verbose" | "-v" => options.verbose = true,
            "--map" | "--max-iterations" | "--delay-ms" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| CliError::MissingValue(flag.to_string()))?;
                match flag {
                    "--map" => options.map_path = Some(value.clone()),
                    "--max-iterations" => options.max_iterations = Some(parse_number(flag, value)?),
                    _ => options.delay_ms = parse_number(flag, value)?,
                }
            }
            _ => eprintln!("Ignoring unknown option '{}'", flag),
        }
        i += 1;
    }

    if options.max_iterations.is_none() {
        if let Ok(value) = env::var("CARLANG_MAX_ITERATIONS") {
            options.max_iterations = Some(parse_number("CARLANG_MAX_ITERATIONS", &value)?);
        }
    }

    Ok(options)
}

fn read(path: &str) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_string(),
        source,
    })
}

fn run(options: &Options) -> Result<(), CliError> {
    let source = read(&options.source_path)?;
    let map = match &options.map_path {
        Some(path) => read(path)?,
        None => DEFAULT_MAP.to_string(),
    };
    let world = GridWorld::from_map(&map)?;

    let car_names: Vec<String> = world.cars().iter().map(|c| c.name.clone()).collect();
    let cars: Vec<&str> = car_names.iter().map(String::as_str).collect();

    if options.verbose {
        println!("Checking {} for {} car(s)...", options.source_path, cars.len());
    }

    let result = analyzer::check(&source, &cars);
    for warning in &result.warnings {
        eprint!("{}", warning.render(Severity::Warning));
    }
    for error in &result.errors {
        eprint!("{}", error.render(Severity::Error));
    }
    if !result.valid {
        return Err(CliError::Invalid(result.errors.len()));
    }

    if options.check_only {
        println!("{}: ok", options.source_path);
        return Ok(());
    }

    let (world, registry) = world.into_agents();
    let config = EngineConfig {
        max_loop_iterations: options.max_iterations,
        trace: options.verbose,
    };
    let mut engine = Engine::load(&result.program, registry, config);

    if options.verbose {
        print!("{}", world.borrow());
    }

    loop {
        let step = engine.step();
        match step.status {
            StepStatus::Continue => {}
            StepStatus::Paused => {
                if options.verbose {
                    if let Some(command) = &step.command_name {
                        println!("\n{} (line {})", command, step.current_line.unwrap_or(0));
                    }
                    print!("{}", world.borrow());
                }
                if options.delay_ms > 0 {
                    thread::sleep(Duration::from_millis(options.delay_ms));
                }
            }
            StepStatus::Complete => break,
            StepStatus::Error => {
                return Err(CliError::Runtime(step.error.unwrap_or_default()));
            }
        }
    }

    let world = world.borrow();
    print!("{}", world);
    for car in world.cars() {
        let state = if car.crashed {
            "crashed"
        } else if world.finish() == Some(car.position) {
            "finished"
        } else {
            "stopped"
        };
        println!("{}: {} at ({}, {}) facing {}", car.name, state, car.position.0, car.position.1, car.heading);
    }

    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(&options) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
