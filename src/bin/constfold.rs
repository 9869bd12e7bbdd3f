// The constfold command-line driver: parse, validate, fold, print.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use constfold::lir::Program;
use constfold::optimization::{constant_fold, DivZeroPolicy, FoldOptions};

#[derive(Parser)]
#[command(about = "constant folding & propagation over lir programs")]
struct Args {
    /// Input file; reads stdin if omitted.
    file: Option<PathBuf>,

    /// Dump the program as JSON instead of lir text.
    #[arg(long)]
    json: bool,

    /// Parse and validate only; skip the optimization.
    #[arg(long)]
    no_fold: bool,

    /// Print per-fold diagnostics to stderr.
    #[arg(long)]
    trace: bool,

    /// What to do when a fold divides by zero.
    #[arg(long, value_enum, default_value_t = DivZeroPolicy::Skip)]
    div_zero: DivZeroPolicy,
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let input = match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("cannot read stdin: {e}"))?;
            buf
        }
    };

    let program = input
        .parse::<Program>()
        .map_err(|e| e.to_string())?
        .validate()
        .map_err(|e| e.to_string())?;

    let program = if args.no_fold {
        program
    } else {
        let opts = FoldOptions {
            div_zero: args.div_zero,
            trace: args.trace,
        };
        let (folded, _) = constant_fold(program, &opts).map_err(|e| e.to_string())?;
        folded
    };

    if args.json {
        let json = serde_json::to_string_pretty(&program.0)
            .map_err(|e| format!("cannot serialize program: {e}"))?;
        println!("{json}");
    } else {
        print!("{}", program.0);
    }

    Ok(())
}
