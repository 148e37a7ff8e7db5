use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;

use logengine::cache::RegexCache;
use logengine::compile;
use logengine::engine::state::EngineState;
use logengine::engine::{Engine, EngineOptions};
use logengine::host::lua::LuaHost;
use logengine::input::{self, LogSource, LogSpec, SortOrder};
use logengine::script::{Diagnostics, ScriptSource, load_scripts};
use logengine::user_opts::UserOpts;

const EXIT_OK: i32 = 0;
const EXIT_HELP: i32 = 1;
const EXIT_BAD_SWITCH: i32 = 2;
const EXIT_INTERNAL: i32 = 3;
const EXIT_BAD_ARGS: i32 = 4;
const EXIT_NO_SCRIPTS: i32 = 5;
const EXIT_SCRIPT_ERROR: i32 = 6;
const EXIT_GENERAL: i32 = 7;

#[derive(Parser)]
#[command(
    name = "logengine",
    version,
    about = "Streaming log analysis — declarative multi-line rules with embedded Luau actions"
)]
#[allow(clippy::struct_excessive_bools)] // CLI flags are naturally booleans
struct Cli {
    /// Rule script to load (repeatable)
    #[arg(long)]
    rules: Vec<PathBuf>,

    /// Read a rule script from standard input
    #[arg(long)]
    stdin: bool,

    /// Log file to scan (repeatable; "-" reads the log from stdin)
    #[arg(long)]
    logfile: Vec<String>,

    /// Tail mode: keep logfiles open at EOF and poll for appended data
    #[arg(long)]
    forever: bool,

    /// Order for the logfile list: asc, desc, or none
    #[arg(long, default_value = "none")]
    sort: String,

    /// Progress heartbeat to stderr every N lines (0 = off)
    #[arg(long, default_value_t = 0)]
    status: u64,

    /// Read-buffer capacity per logfile, in KB
    #[arg(long, default_value_t = 64)]
    buffer: usize,

    /// Complete single-match rules directly, without creating an instance
    #[arg(long)]
    fast: bool,

    /// Print the compiled rules as JSON and exit
    #[arg(long)]
    dump: bool,

    /// Print the program banner before processing
    #[arg(long)]
    title: bool,

    /// Show scan progress details on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Show matching internals on stderr
    #[arg(long)]
    debug: bool,

    /// User option NAME=VALUE (repeatable; repeated names form an ordered list)
    #[arg(long)]
    user: Vec<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                    EXIT_HELP
                }
                ErrorKind::DisplayVersion => EXIT_OK,
                ErrorKind::Io | ErrorKind::Format => EXIT_INTERNAL,
                _ => EXIT_BAD_SWITCH,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(&cli));
}

#[allow(clippy::too_many_lines)]
fn run(cli: &Cli) -> i32 {
    if cli.title {
        println!("logengine {}", env!("CARGO_PKG_VERSION"));
    }
    if cli.rules.is_empty() && !cli.stdin {
        eprintln!("[logengine] no rule scripts given (use --rules or --stdin)");
        return EXIT_NO_SCRIPTS;
    }
    let Some(sort) = SortOrder::parse(&cli.sort) else {
        eprintln!("[logengine] bad --sort value '{}' (asc|desc|none)", cli.sort);
        return EXIT_BAD_ARGS;
    };

    let mut sources: Vec<ScriptSource> = cli
        .rules
        .iter()
        .map(|p| ScriptSource::File(p.clone()))
        .collect();
    if cli.stdin {
        match std::io::read_to_string(std::io::stdin()) {
            Ok(content) => sources.push(ScriptSource::Text {
                name: "<stdin>".to_string(),
                content,
            }),
            Err(e) => {
                eprintln!("[logengine] cannot read rules from stdin: {e}");
                return EXIT_GENERAL;
            }
        }
    }

    let mut diags = Diagnostics::default();
    let set = load_scripts(&sources, &mut diags);
    let mut rules = compile::compile(&set, &mut diags);
    let cache = RegexCache::build(&mut rules, &mut diags);
    diags.report();
    if diags.has_errors() {
        return EXIT_SCRIPT_ERROR;
    }
    if cli.verbose {
        eprintln!(
            "[logengine] {} rules, {} shared regexes",
            rules.rules.len(),
            cache.len()
        );
    }

    let user_opts = match UserOpts::parse(&cli.user) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("[logengine] {e:#}");
            return EXIT_BAD_ARGS;
        }
    };
    let unreferenced = user_opts.unreferenced(&set.sources);
    if !unreferenced.is_empty() {
        eprintln!(
            "[logengine] --user option(s) referenced by no loaded script: {}",
            unreferenced.join(", ")
        );
        return EXIT_BAD_ARGS;
    }

    if cli.dump {
        return match serde_json::to_string_pretty(&rules) {
            Ok(json) => {
                println!("{json}");
                EXIT_OK
            }
            Err(e) => {
                eprintln!("[logengine] cannot serialize rules: {e}");
                EXIT_GENERAL
            }
        };
    }

    let mut specs: Vec<LogSpec> = cli
        .logfile
        .iter()
        .map(|path| LogSpec {
            source: if path == "-" {
                LogSource::Stdin
            } else {
                LogSource::File(PathBuf::from(path))
            },
            forever: cli.forever,
        })
        .collect();
    input::sort_specs(&mut specs, sort);

    let state = Rc::new(RefCell::new(EngineState::new(user_opts)));
    let host = match LuaHost::new() {
        Ok(host) => host,
        Err(e) => {
            eprintln!("[logengine] cannot start action host: {e:#}");
            return EXIT_GENERAL;
        }
    };
    if let Err(e) = host.install_builtins(Rc::clone(&state)) {
        eprintln!("[logengine] cannot install builtins: {e:#}");
        return EXIT_GENERAL;
    }

    let engine = Engine::new(
        rules,
        cache,
        host,
        Rc::clone(&state),
        EngineOptions {
            fast: cli.fast,
            verbose: cli.verbose,
            debug: cli.debug,
            status: cli.status,
        },
    );
    match engine.run(&specs, cli.buffer) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("[logengine] error: {e:#}");
            EXIT_GENERAL
        }
    }
}
