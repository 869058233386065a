use std::env;
use std::ffi::CString;
use std::path::PathBuf;

use clap::Parser;
use judgebox::{Arch, BasicOutputSink, Executor, JudgeConfig, LoggerListener};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// Path to a YAML judge configuration; defaults to allow-all.
    #[arg(long)]
    config: Option<PathBuf>,
    /// The target executable
    target: String,
    /// Arguments passed to the target
    args: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => JudgeConfig::from_file(path),
        None => Ok(JudgeConfig::allow_all(Arch::X86_64)),
    }
    .unwrap_or_else(|err| {
        eprintln!("judgebox: {err}");
        std::process::exit(1);
    });

    if let Err(err) = judgebox::kernel::check_kernel_version(config.minimum_kernel) {
        eprintln!("judgebox: {err}");
        std::process::exit(1);
    }

    let policy = config.policy.compile().unwrap_or_else(|err| {
        eprintln!("judgebox: {err}");
        std::process::exit(1);
    });

    let program = CString::new(cli.target).expect("target path must not contain NUL");
    let mut argv = vec![program.clone()];
    argv.extend(cli.args.into_iter().map(|arg| CString::new(arg).expect("argument must not contain NUL")));
    let envp = env::vars()
        .map(|(key, val)| CString::new(format!("{key}={val}")).expect("environment entry must not contain NUL"))
        .collect::<Vec<_>>();

    let executor = Executor::new(program, argv, envp, Box::<BasicOutputSink>::default())
        .with_listener(Box::new(LoggerListener))
        .with_seccomp_policy(policy);

    match executor.execute() {
        Ok(event) => println!("{event:?}"),
        Err(err) => {
            eprintln!("judgebox: {err}");
            std::process::exit(1);
        }
    }
}
