//! The vesper command line front end.
//!
//! `vesper file.vsp` runs a file; with no file it starts a line-per-
//! statement REPL sharing one orchestrator across inputs, so definitions
//! persist between lines. Module resolution talks to the oracle named by
//! `VESPER_ORACLE` (host:port); without it, exposes fail.

use std::{
    env,
    io::{BufRead, Write},
    process::ExitCode,
    time::Instant,
};

use vesper::{
    ExposeError, FsLoader, NullOracle, Oracle, Orchestra, Settings, StdIo, TcpOracle, VesperError,
};

const HELP: &str = "\
usage: vesper [options] [file.vsp]

options:
  -h, --help                 show this help
  -v, --version              show the version
  -r, --print-result         print the program's result
  -m, --measure              report stage timings on stderr
  -d, --disassemble          print the compiled chunks instead of running
  -O LEVEL                   optimization passes = LEVEL x 8 (default 1)
  -e, --verbose-expose LEVEL report module resolution on stderr
  --with-screen              allow screen actions (default)
  --with-disk                allow disk actions

with no file, starts an interactive session.
the VESPER_ORACLE environment variable (host:port) names the module
resolution oracle.";

#[derive(Debug)]
struct Options {
    print_result: bool,
    measure: bool,
    disassemble: bool,
    opt_level: u32,
    verbose_expose: u8,
    with_screen: bool,
    with_disk: bool,
    file: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            print_result: false,
            measure: false,
            disassemble: false,
            opt_level: 1,
            verbose_expose: 0,
            with_screen: true,
            with_disk: false,
            file: None,
        }
    }
}

fn parse_options(args: &[String]) -> Result<Option<Options>, String> {
    let mut options = Options::default();
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{HELP}");
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("vesper {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-r" | "--print-result" => options.print_result = true,
            "-m" | "--measure" => options.measure = true,
            "-d" | "--disassemble" => options.disassemble = true,
            "-O" => {
                let level = args.next().ok_or("-O expects a level")?;
                options.opt_level = level.parse().map_err(|_| format!("bad -O level: {level}"))?;
            }
            "-e" | "--verbose-expose" => {
                let level = args.next().ok_or("--verbose-expose expects a level")?;
                options.verbose_expose = level.parse().map_err(|_| format!("bad verbose level: {level}"))?;
            }
            "--with-screen" => options.with_screen = true,
            "--with-disk" => options.with_disk = true,
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            file => {
                if options.file.is_some() {
                    return Err("more than one file given".to_owned());
                }
                options.file = Some(file.to_owned());
            }
        }
    }
    Ok(Some(options))
}

/// Routes to the oracle named by `VESPER_ORACLE`, or refuses exposes.
struct EnvOracle {
    tcp: Option<TcpOracle>,
}

impl EnvOracle {
    fn from_env() -> Self {
        Self {
            tcp: env::var("VESPER_ORACLE").ok().map(TcpOracle::new),
        }
    }
}

impl Oracle for EnvOracle {
    fn files_for(&mut self, distinct: &str) -> Result<Vec<String>, ExposeError> {
        match &mut self.tcp {
            Some(tcp) => tcp.files_for(distinct),
            None => NullOracle.files_for(distinct),
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_options(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    };

    let settings = Settings {
        passes: options.opt_level * 8,
        verbose_expose: options.verbose_expose,
        permissions: vesper::ActionPermissions {
            screen: options.with_screen,
            disk: options.with_disk,
        },
    };
    let mut orchestra = Orchestra::new(EnvOracle::from_env(), FsLoader, StdIo, settings);

    match &options.file {
        Some(file) => run_file(&mut orchestra, file, &options),
        None => repl(&mut orchestra, &options),
    }
}

fn run_file(orchestra: &mut Orchestra<EnvOracle, FsLoader, StdIo>, file: &str, options: &Options) -> ExitCode {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: cannot read {file}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if options.disassemble {
        return match orchestra.disassemble(file, &source) {
            Ok(listing) => {
                print!("{listing}");
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("{error}");
                ExitCode::FAILURE
            }
        };
    }

    let prepare_start = Instant::now();
    let entry = match orchestra.prepare(file, &source) {
        Ok(entry) => entry,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };
    let prepared = prepare_start.elapsed();

    let run_start = Instant::now();
    let result = orchestra.execute(entry);
    let ran = run_start.elapsed();
    if options.measure {
        eprintln!("read+compile: {prepared:?}, run: {ran:?}");
    }

    match result {
        Ok(value) => {
            if options.print_result {
                println!("{value}");
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn repl(orchestra: &mut Orchestra<EnvOracle, FsLoader, StdIo>, options: &Options) -> ExitCode {
    eprintln!("vesper {} interactive session", env!("CARGO_PKG_VERSION"));
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut counter = 0u32;
    loop {
        eprint!("vesper> ");
        let _ = std::io::stderr().flush();
        let Some(Ok(line)) = lines.next() else {
            return ExitCode::SUCCESS;
        };
        if line.trim().is_empty() {
            continue;
        }
        counter += 1;
        match orchestra.run(&format!("repl:{counter}"), &line) {
            Ok(value) => {
                if options.print_result {
                    println!("{value}");
                } else {
                    println!("= {value}");
                }
            }
            Err(error) => report(&error),
        }
    }
}

fn report(error: &VesperError) {
    eprintln!("{error}");
}
