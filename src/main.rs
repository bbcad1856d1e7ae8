/// graphtrace - demo CLI
///
/// Runs a small classifier (linear, relu, linear, softmax) through the host
/// interpreter several times and reports what the tracer cached.
use graphtrace::host::{CodeBuilder, Interpreter, Module, Opcode, Tensor, Value, VmConfig};
use graphtrace::{TracerConfig, TracerContext};
use std::env;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("graphtrace v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    graphtrace [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help            Print this help message");
    eprintln!("    -V, --version         Print version information");
    eprintln!("    -c, --config <FILE>   Load tracer config from a TOML file");
    eprintln!("    -n, --runs <N>        Number of forward passes (default: 3)");
    eprintln!("    -v, --verbose         Log restarts, commits and cache hits");
    eprintln!("    -t, --trace           Log every interpreted instruction");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    GRAPHTRACE_ENABLED, GRAPHTRACE_DEBUG, GRAPHTRACE_DYNSHAPE");
    eprintln!("    RUST_LOG              Log filter, e.g. graphtrace::tracker=info");
}

fn print_version() {
    println!("graphtrace {}", VERSION);
}

struct Options {
    config: Option<String>,
    runs: usize,
    verbose: bool,
    trace: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut config = None;
    let mut runs = 3;
    let mut verbose = false;
    let mut trace = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-V" | "--version" => {
                print_version();
                process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing file after --config".to_string());
                }
                config = Some(args[i].clone());
            }
            "-n" | "--runs" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing count after --runs".to_string());
                }
                runs = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid run count: {}", args[i]))?;
            }
            "-v" | "--verbose" => {
                verbose = true;
            }
            "-t" | "--trace" => {
                trace = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}", arg));
            }
        }
        i += 1;
    }

    Ok(Options {
        config,
        runs,
        verbose,
        trace,
    })
}

fn install_tracing(options: &Options) {
    let default = match (options.trace, options.verbose) {
        (true, _) => "graphtrace=trace",
        (false, true) => "graphtrace=debug",
        (false, false) => "graphtrace=warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Deterministic weights so runs are reproducible.
fn weights(shape: &[usize], seed: f64) -> Result<Tensor, String> {
    let data = (0..shape.iter().product::<usize>())
        .map(|i| ((i as f64 + seed) * 0.37).sin() * 0.5)
        .collect();
    Tensor::from_vec(shape, data).map_err(|e| e.to_string())
}

/// `forward(self, x): return self.softmax(self.fc2(self.act(self.fc1(x))))`
fn build_model() -> Result<Value, String> {
    let mut b = CodeBuilder::new("Classifier.forward").with_params(&["self", "x"]);
    b.load_fast("self");
    b.load_method("softmax");
    b.load_fast("self");
    b.load_method("fc2");
    b.load_fast("self");
    b.load_method("act");
    b.load_fast("self");
    b.load_method("fc1");
    b.load_fast("x");
    b.call_method(1);
    b.call_method(1);
    b.call_method(1);
    b.call_method(1);
    b.emit(Opcode::ReturnValue);

    let fc1 = Module::linear(weights(&[8, 4], 1.0)?, Some(weights(&[8], 2.0)?));
    let fc2 = Module::linear(weights(&[3, 8], 3.0)?, None);
    Ok(Value::module(
        Module::container("Classifier", b.build_arc())
            .with_child("fc1", Value::module(fc1))
            .with_child("act", Value::module(Module::relu()))
            .with_child("fc2", Value::module(fc2))
            .with_child("softmax", Value::module(Module::softmax(-1))),
    ))
}

fn run(options: &Options) -> Result<(), String> {
    let config = match &options.config {
        Some(path) => TracerConfig::load(path).map_err(|e| e.to_string())?,
        None => TracerConfig::default(),
    }
    .with_env_overrides();

    let ctx = Arc::new(TracerContext::new(config));
    let vm_config = if options.trace {
        VmConfig::default().with_trace()
    } else {
        VmConfig::default()
    };
    let mut vm = Interpreter::with_config(Arc::clone(&ctx), vm_config);
    let model = build_model()?;
    let x = Value::tensor(weights(&[2, 4], 5.0)?);

    for run in 1..=options.runs {
        let y = vm.call(&model, &[x.clone()]).map_err(|e| e.to_string())?;
        let stats = ctx.stats();
        println!(
            "run {}: {} -> {} (hits={}, restarts={})",
            run, x, y, stats.cache_hits, stats.restarts
        );
    }

    let stats = ctx.stats();
    println!();
    println!("records:        {}", ctx.cache().total_records());
    println!("commits:        {}", stats.commits);
    println!("abandoned:      {}", stats.abandoned);
    println!("cache hits:     {}", stats.cache_hits);
    println!("guard failures: {}", stats.guard_failures);
    println!("hit rate:       {:.2}", stats.hit_rate());
    Ok(())
}

fn main() {
    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    install_tracing(&options);

    if let Err(e) = run(&options) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
