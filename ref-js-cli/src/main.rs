use clap::Parser;
use ref_js::{AggregatorOptions, Shape};
use script::{replay, RearmArg, Script, ShapeArg};
use std::fs::File;
use std::io::stdin;
use std::io::stdout;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

mod script;

#[derive(Parser)]
#[command(
  name = "ref-js",
  version,
  about = "Replays a driver script against a ref aggregator and prints what it observed"
)]
struct Cli {
  /// Script to replay; omit for stdin.
  #[arg(short, long)]
  input: Option<PathBuf>,

  /// Aggregator shape. Overrides the script's `shape`; defaults to `mapping`.
  #[arg(short, long, value_enum)]
  shape: Option<ShapeArg>,

  /// What to do with registrations after the first settlement. Overrides the script's `rearm`.
  #[arg(long, value_enum)]
  rearm: Option<RearmArg>,

  /// Emit logs on stderr as JSON lines.
  #[arg(long)]
  log_json: bool,

  /// Log every slot operation. `REF_JS_LOG` takes precedence when set.
  #[arg(short, long)]
  verbose: bool,
}

fn init_logging(args: &Cli) {
  let filter = EnvFilter::try_from_env("REF_JS_LOG").unwrap_or_else(|_| {
    EnvFilter::new(if args.verbose {
      "ref_js=trace,ref_js_cli=debug"
    } else {
      "warn"
    })
  });
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_ansi(false);
  let _ = if args.log_json {
    builder.json().try_init()
  } else {
    builder.try_init()
  };
}

fn exit_with_error(source: &str, code: &str, message: impl std::fmt::Display) -> ! {
  eprintln!("error[{code}]: {source}: {message}");
  process::exit(1);
}

fn main() {
  let args = Cli::parse();
  init_logging(&args);

  let input_name = args
    .input
    .as_ref()
    .map(|p| p.to_string_lossy().into_owned())
    .unwrap_or_else(|| "<stdin>".to_string());
  let mut input: Box<dyn Read> = match args.input.as_ref() {
    Some(p) => match File::open(p) {
      Ok(f) => Box::new(f),
      Err(err) => exit_with_error(&input_name, "RC0001", format!("failed to open: {err}")),
    },
    None => Box::new(stdin()),
  };
  let mut source = Vec::new();
  if let Err(err) = input.read_to_end(&mut source) {
    exit_with_error(&input_name, "RC0001", format!("failed to read input: {err}"));
  }
  let script: Script = match serde_json::from_slice(&source) {
    Ok(script) => script,
    Err(err) => exit_with_error(&input_name, "RC0002", format!("invalid script: {err}")),
  };

  let shape: Shape = args.shape.or(script.shape).unwrap_or(ShapeArg::Mapping).into();
  let mut options = AggregatorOptions::new(shape);
  if let Some(rearm) = args.rearm.or(script.rearm) {
    options = options.with_rearm(rearm.into());
  }

  let report = match replay(script, options) {
    Ok(report) => report,
    Err(err) => exit_with_error(&input_name, err.code(), err),
  };
  let mut out = stdout().lock();
  let written = serde_json::to_writer(&mut out, &report)
    .map_err(std::io::Error::from)
    .and_then(|()| writeln!(out));
  if let Err(err) = written {
    exit_with_error("<stdout>", "RC0001", format!("failed to write output: {err}"));
  }
}
