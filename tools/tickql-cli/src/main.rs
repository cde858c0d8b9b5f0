///
/// tickql CLI - Host simulator for the tickql engine
///
/// Stands in for a scripting host: connects one database, submits SQL and
/// prints whatever the engine reports back through callbacks.
/// - tickql query "<sql>": Run one statement
/// - tickql script <file>: Run every non-empty line of a file
///
/// With `--threaded` statements go through the worker queue and are
/// reported by a reconciliation tick, exactly as a host would see them.
///

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use tickql::{
    init_logging, Arg, BackendKind, CallFrame, CallbackHost, Cell, ConnectParams, Engine, EngineConfig,
    EngineError, HandlerId, OwnerId, PublicIndex, QueryRequest, StatementFlags, StatementId,
};

const OWNER: OwnerId = OwnerId(1);
const RESULT_CALLBACK: &str = "OnResult";

#[derive(Parser)]
#[command(name = "tickql")]
#[command(author, version, about = "Run SQL through the tickql engine", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    connection: Connection,

    /// Queue statements on the worker thread
    #[arg(long, global = true)]
    threaded: bool,

    /// Buffer result rows client side
    #[arg(long, global = true)]
    cached: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Connection {
    /// Backend to connect (sqlite, postgres)
    #[arg(long, default_value = "sqlite", global = true)]
    backend: String,

    /// Database name, or file path for SQLite
    #[arg(long, default_value = ":memory:", global = true)]
    database: String,

    #[arg(long, default_value = "localhost", global = true)]
    host: String,

    #[arg(long, default_value = "", global = true)]
    user: String,

    #[arg(long, default_value = "", global = true)]
    password: String,

    /// 0 selects the backend's default port
    #[arg(long, default_value_t = 0, global = true)]
    port: u16,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single statement
    Query {
        /// SQL text
        sql: String,
    },

    /// Run every non-empty, non-comment line of a file as a statement
    Script {
        /// The script to run
        file: PathBuf,
    },
}

/// Prints result sets handed to `OnResult` and failures handed to the
/// configured error handler.
struct PrintHost {
    error_handler: String,
    failures: usize,
}

impl CallbackHost for PrintHost {
    fn find_public(&mut self, _owner: OwnerId, name: &str) -> Option<PublicIndex> {
        if name == RESULT_CALLBACK {
            Some(PublicIndex(0))
        } else if name == self.error_handler {
            Some(PublicIndex(1))
        } else {
            None
        }
    }

    fn exec(&mut self, engine: &Engine, _owner: OwnerId, index: PublicIndex, frame: CallFrame) -> Cell {
        let args = frame.into_args();
        match (index.0, args.as_slice()) {
            (0, [Arg::Cell(id)]) => {
                if let Err(e) = print_results(engine, StatementId(i64::from(*id))) {
                    eprintln!("Error reading results: {}", e);
                }
            }
            (1, [_, Arg::Cell(code), Arg::Str(message), Arg::Str(query), ..]) => {
                self.failures += 1;
                eprintln!("Error {}: {}", code, message);
                eprintln!("  in: {}", query);
            }
            _ => eprintln!("Unexpected callback frame: {:?}", args),
        }
        1
    }
}

fn print_results(engine: &Engine, id: StatementId) -> Result<(), EngineError> {
    loop {
        let (fields, rows) = engine.with_cursor(id, |cursor| {
            let fields: Vec<String> = (0..cursor.num_fields())
                .map(|field| cursor.fetch_field(field).into_owned())
                .collect();
            let mut rows = Vec::with_capacity(cursor.num_rows());
            for row in 0..cursor.num_rows() {
                if !cursor.seek_row(row as i64) {
                    break;
                }
                let values: Vec<String> = (0..fields.len())
                    .map(|field| cursor.fetch_by_index(field).into_owned())
                    .collect();
                rows.push(values);
            }
            (fields, rows)
        })?;

        if fields.is_empty() {
            println!(
                "ok, {} row(s) affected, last insert id {}",
                engine.affected_rows(id)?,
                engine.insert_id(id)?
            );
        } else {
            println!("{}", fields.join("\t"));
            for row in &rows {
                println!("{}", row.join("\t"));
            }
            println!("({} row(s))", rows.len());
        }

        if engine.seek_result(id, -1).is_err() {
            return Ok(());
        }
        println!();
    }
}

fn backend_kind(name: &str) -> BackendKind {
    match name {
        "sqlite" => BackendKind::SQLITE,
        "postgres" | "postgresql" => BackendKind::POSTGRES,
        other => {
            eprintln!("Unknown backend: {}", other);
            std::process::exit(2);
        }
    }
}

fn read_statements(command: &Commands) -> Vec<String> {
    match command {
        Commands::Query { sql } => vec![sql.clone()],
        Commands::Script { file } => {
            let content = match std::fs::read_to_string(file) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error reading {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            };
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with("--"))
                .map(String::from)
                .collect()
        }
    }
}

fn run(engine: &Engine, db: HandlerId, statements: Vec<String>, flags: StatementFlags, host: &mut PrintHost) {
    let mut inline = Vec::new();
    for sql in statements {
        let request = QueryRequest::new(OWNER, db, sql).flags(flags).callback(RESULT_CALLBACK, "r");
        match engine.submit(request, host) {
            Ok(id) if !flags.contains(StatementFlags::THREADED) => inline.push(id),
            Ok(_) => {}
            Err(e) => {
                host.failures += 1;
                eprintln!("Error submitting statement: {}", e);
            }
        }
    }

    if flags.contains(StatementFlags::THREADED) {
        if let Err(e) = engine.wait(db) {
            eprintln!("Error waiting for worker: {}", e);
        }
        engine.process_tick(host);
    }
    for id in inline {
        if let Err(e) = engine.free_result(id) {
            eprintln!("Error freeing statement {}: {}", id, e);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match EngineConfig::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };
    let levels = match init_logging(&config.logging) {
        Ok(levels) => levels,
        Err(e) => {
            eprintln!("Error setting up logging: {}", e);
            std::process::exit(1);
        }
    };

    let mut host = PrintHost {
        error_handler: config.callbacks.error_handler.clone(),
        failures: 0,
    };
    let engine = Engine::new(config).with_log_levels(levels);

    let params = ConnectParams {
        host: cli.connection.host.clone(),
        user: cli.connection.user.clone(),
        password: cli.connection.password.clone(),
        database: cli.connection.database.clone(),
        port: cli.connection.port,
    };
    let db = match engine.connect(OWNER, backend_kind(&cli.connection.backend), &params) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error connecting: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(handler_id = %db, "connected");

    let mut flags = StatementFlags::NONE;
    if cli.threaded {
        flags = flags | StatementFlags::THREADED;
    }
    if cli.cached {
        flags = flags | StatementFlags::CACHED;
    }

    let statements = read_statements(&cli.command);
    run(&engine, db, statements, flags, &mut host);
    engine.shutdown();

    if host.failures > 0 {
        std::process::exit(1);
    }
}
