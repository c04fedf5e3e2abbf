use anyhow::Result;
use clap::Parser;
use colored::*;
use log::{debug, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

use tabeval::app_eprintln;
use tabeval::*;

use backend::cdp::CdpBackend;
use backend::{Backend, BackendError};
use cli::{Cli, Command};
use compiler::compile_and_evaluate;
use config::Config;
use nrepl::NreplServer;
use protocol::repl::render_value;
use protocol::{JsonRpcProtocol, Protocol, ReplProtocol};
use resilience::{connect_with_retry, RetryPolicy};
use session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    output::init_logger(if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    debug!("Starting tabeval");

    let mut config = Config::load(cli.config.as_deref()).await?;
    if let Some(host) = cli.host.clone() {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    let config = Arc::new(config);
    let command = cli.command.clone().unwrap_or(Command::Repl);

    let backend = match connect(&config).await {
        Ok(backend) => backend,
        Err(e) => {
            app_eprintln!(
                "{}",
                format!("Could not connect to browser at {}:{}:", config.host, config.port).red()
            );
            app_eprintln!("{}", e);
            app_eprintln!(
                "Start the browser with --remote-debugging-port={} or set TABEVAL_HOST / TABEVAL_PORT",
                config.port
            );
            std::process::exit(1);
        }
    };

    let code = match command {
        Command::Repl => {
            print_banner(backend.as_ref(), &config).await;
            let protocol = Arc::new(ReplProtocol::new(config.default_language.clone()));
            run_session(protocol, backend.clone(), config.clone()).await
        }
        Command::Rpc => {
            run_session(Arc::new(JsonRpcProtocol::new()), backend.clone(), config.clone()).await
        }
        Command::Nrepl {
            listen,
            no_port_file,
        } => run_nrepl(backend.clone(), &config, listen, no_port_file).await?,
        Command::Eval { code, lang } => {
            let language = lang.unwrap_or_else(|| config.default_language.clone());
            match compile_and_evaluate(backend.as_ref(), &language, &code).await {
                Ok(value) => {
                    let rendered = render_value(value.as_ref());
                    if !rendered.is_empty() {
                        println!("{}", rendered);
                    }
                    0
                }
                Err(e) => {
                    app_eprintln!("{}", format!("Error: {}", e).red());
                    1
                }
            }
        }
    };

    if let Err(e) = backend.disconnect().await {
        warn!("Failed to disconnect from browser: {}", e);
    }

    // A pending stdin read would otherwise hold the runtime open.
    std::process::exit(code);
}

async fn connect(config: &Config) -> Result<Arc<dyn Backend>, BackendError> {
    let policy = RetryPolicy::from_config(config);
    let timeout = config.connect_timeout();
    let backend = connect_with_retry(&policy, |host, port| async move {
        CdpBackend::connect(&host, port, timeout).await
    })
    .await?;
    Ok(Arc::new(backend))
}

async fn print_banner(backend: &dyn Backend, config: &Config) {
    app_eprintln!(
        "{} {} connected to {}:{}",
        "tabeval".cyan().bold(),
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port
    );
    if let Some(page) = backend.current_page().await {
        app_eprintln!("Tab: {} ({})", page.title.bold(), page.url.dimmed());
    }
    app_eprintln!("Type {} for commands, {} to leave.", ".help".yellow(), ".exit".yellow());
}

async fn run_session(
    protocol: Arc<dyn Protocol>,
    backend: Arc<dyn Backend>,
    config: Arc<Config>,
) -> i32 {
    let session = Session::new(protocol, backend, config);
    let summary = session.run_stdio().await;
    debug!(
        "{} session ended after {} line(s), {} request(s)",
        session.protocol_name(),
        summary.lines,
        summary.dispatched
    );
    0
}

async fn run_nrepl(
    backend: Arc<dyn Backend>,
    config: &Config,
    listen: Option<u16>,
    no_port_file: bool,
) -> Result<i32> {
    let port = listen.unwrap_or(config.nrepl.port);
    let host = &config.nrepl.host;
    let addr = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let port_file = (!no_port_file).then(|| PathBuf::from(&config.nrepl.port_file));

    let language = config.default_language.clone();
    let server = NreplServer::bind(&addr, backend, language, port_file).await?;
    let local = server.local_addr()?;
    app_eprintln!(
        "nREPL server started on port {} on host {}",
        local.port().to_string().green(),
        local.ip()
    );
    if let Some(path) = server.port_file() {
        debug!("Port written to {}", path.display());
    }

    server.run_until_ctrl_c().await?;
    Ok(0)
}
