use clap::{Parser, Subcommand};

/// tabeval - evaluate code in a live browser tab over REPL, JSON-RPC or nREPL
#[derive(Parser, Debug)]
#[clap(name = "tabeval")]
#[clap(about = "Evaluate code in a live browser tab", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Remote debugging host (overrides config and TABEVAL_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Remote debugging port (overrides config and TABEVAL_PORT)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Interactive line REPL (default)
    Repl,

    /// JSON-RPC 2.0 over stdin/stdout, one message per line
    Rpc,

    /// nREPL server for editor clients
    Nrepl {
        /// Port to listen on (0 picks a free one)
        #[arg(long = "listen", value_name = "PORT")]
        listen: Option<u16>,

        /// Do not write the port discovery file
        #[arg(long)]
        no_port_file: bool,
    },

    /// Evaluate one snippet and print the result
    Eval {
        code: String,

        /// Source language (defaults to the configured language)
        #[arg(short, long)]
        lang: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_no_subcommand() {
        let cli = Cli::parse_from(["tabeval"]);
        assert!(cli.command.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::parse_from(["tabeval", "rpc", "--host", "10.0.0.2", "--port", "9333"]);
        assert_eq!(cli.command, Some(Command::Rpc));
        assert_eq!(cli.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(cli.port, Some(9333));
    }

    #[test]
    fn nrepl_listen_port_is_separate_from_browser_port() {
        let cli = Cli::parse_from(["tabeval", "-p", "9222", "nrepl", "--listen", "7888"]);
        assert_eq!(cli.port, Some(9222));
        assert_eq!(
            cli.command,
            Some(Command::Nrepl {
                listen: Some(7888),
                no_port_file: false
            })
        );
    }

    #[test]
    fn eval_takes_code_and_language() {
        let cli = Cli::parse_from(["tabeval", "eval", "document.title", "--lang", "js"]);
        assert_eq!(
            cli.command,
            Some(Command::Eval {
                code: "document.title".to_string(),
                lang: Some("js".to_string())
            })
        );
    }
}
