use crate::protocol::error_codes::{INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::protocol::{LocalContext, Parsed, Protocol, ProtocolError, Request};
use log::debug;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

const HELP_HINT: &str = "Type .help for available commands";

/// Commands handled inside the adapter. `parse` skips these.
const LOCAL_COMMANDS: &[(&str, &str)] = &[
    ("help", "Show this help"),
    ("exit", "Leave the REPL"),
    ("quit", "Leave the REPL"),
    ("methods", "List registered session methods"),
    ("lang", "Show or set the evaluation language (.lang js)"),
    ("last", "Show the last injected script reference"),
];

struct DispatchCommand {
    name: &'static str,
    aliases: &'static [&'static str],
    usage: &'static str,
    build: fn(&ReplProtocol, &str) -> Result<Request, ProtocolError>,
}

const DISPATCH_COMMANDS: &[DispatchCommand] = &[
    DispatchCommand {
        name: "tabs",
        aliases: &["ls"],
        usage: ".tabs              List open tabs",
        build: build_tabs,
    },
    DispatchCommand {
        name: "tab",
        aliases: &["select"],
        usage: ".tab <index|text>  Select a tab by index or title/URL match",
        build: build_select_tab,
    },
    DispatchCommand {
        name: "inject",
        aliases: &["load"],
        usage: ".inject <script>   Inject a script alias or URL into the tab",
        build: build_inject,
    },
    DispatchCommand {
        name: "reload",
        aliases: &[],
        usage: ".reload            Reload the current tab",
        build: build_reload,
    },
    DispatchCommand {
        name: "status",
        aliases: &[],
        usage: ".status            Show browser connection status",
        build: build_status,
    },
];

fn build_tabs(_: &ReplProtocol, _: &str) -> Result<Request, ProtocolError> {
    Ok(Request::new("tabs"))
}

fn build_reload(_: &ReplProtocol, _: &str) -> Result<Request, ProtocolError> {
    Ok(Request::new("reload"))
}

fn build_status(_: &ReplProtocol, _: &str) -> Result<Request, ProtocolError> {
    Ok(Request::new("status"))
}

fn build_select_tab(_: &ReplProtocol, remainder: &str) -> Result<Request, ProtocolError> {
    if remainder.is_empty() {
        return Err(ProtocolError::new(INVALID_PARAMS, "Usage: .tab <index|text>"));
    }
    Ok(Request::new("select_tab").with_param("pattern", remainder))
}

fn build_inject(repl: &ReplProtocol, remainder: &str) -> Result<Request, ProtocolError> {
    if remainder.is_empty() {
        return Err(ProtocolError::new(INVALID_PARAMS, "Usage: .inject <script>"));
    }
    repl.set_last_injected(remainder);
    Ok(Request::new("inject").with_param("script", remainder))
}

/// Split `.name rest of line` into a lowercase command name and its remainder.
fn split_command(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('.')?;
    let (name, remainder) = match body.find(char::is_whitespace) {
        Some(pos) => (&body[..pos], body[pos..].trim()),
        None => (body, ""),
    };
    Some((name.to_lowercase(), remainder))
}

/// Render a value the way the REPL prints it.
///
/// `{ "formatted": "..." }` objects are printed verbatim, strings are quoted,
/// structures are pretty-printed and an undefined value prints nothing.
pub fn render_value(value: Option<&Value>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    if let Some(formatted) = value.get("formatted").and_then(Value::as_str) {
        return formatted.to_string();
    }
    match value {
        Value::String(_) | Value::Null | Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
    }
}

/// Interactive line protocol: dot-commands plus bare expressions.
pub struct ReplProtocol {
    default_language: Mutex<String>,
    last_injected: Mutex<Option<String>>,
}

impl ReplProtocol {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: Mutex::new(default_language.into()),
            last_injected: Mutex::new(None),
        }
    }

    /// The script reference most recently passed to `.inject`.
    pub fn last_injected(&self) -> Option<String> {
        self.last_injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_injected(&self, reference: &str) {
        *self
            .last_injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reference.to_string());
    }

    pub fn default_language(&self) -> String {
        self.default_language
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_default_language(&self, language: &str) {
        *self
            .default_language
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = language.to_string();
    }

    fn help_text(&self) -> String {
        let mut lines = vec!["Commands:".to_string()];
        for command in DISPATCH_COMMANDS {
            let mut line = format!("  {}", command.usage);
            if !command.aliases.is_empty() {
                let aliases: Vec<String> =
                    command.aliases.iter().map(|a| format!(".{}", a)).collect();
                line.push_str(&format!(" (alias: {})", aliases.join(", ")));
            }
            lines.push(line);
        }
        for (name, description) in LOCAL_COMMANDS {
            lines.push(format!("  .{:<18} {}", name, description));
        }
        lines.push("Anything else is evaluated in the selected tab.".to_string());
        lines.join("\n")
    }

    fn run_local(&self, name: &str, remainder: &str, ctx: &LocalContext<'_>) -> String {
        match name {
            "help" => self.help_text(),
            "exit" | "quit" => {
                ctx.request_stop();
                "Bye.".to_string()
            }
            "methods" => ctx.methods().join("\n"),
            "lang" => {
                if remainder.is_empty() {
                    format!("Language: {}", self.default_language())
                } else {
                    let language = remainder.to_lowercase();
                    self.set_default_language(&language);
                    format!("Language set to {}", language)
                }
            }
            "last" => self
                .last_injected()
                .unwrap_or_else(|| "No script injected yet".to_string()),
            _ => String::new(),
        }
    }
}

impl Protocol for ReplProtocol {
    fn name(&self) -> &'static str {
        "repl"
    }

    fn parse(&self, raw: &str) -> Parsed {
        let input = raw.trim();
        if input.is_empty() {
            return Parsed::Skip;
        }

        let Some((name, remainder)) = split_command(input) else {
            return Parsed::Request(
                Request::new("eval")
                    .with_param("code", input)
                    .with_param("lang", self.default_language()),
            );
        };

        if LOCAL_COMMANDS.iter().any(|(local, _)| *local == name) {
            return Parsed::Skip;
        }

        let command = DISPATCH_COMMANDS
            .iter()
            .find(|command| command.name == name || command.aliases.contains(&name.as_str()));

        match command {
            Some(command) => {
                debug!("REPL command .{} -> {}", name, command.name);
                match (command.build)(self, remainder) {
                    Ok(request) => Parsed::Request(request),
                    Err(err) => Parsed::Error(err),
                }
            }
            None => Parsed::Error(ProtocolError::new(
                METHOD_NOT_FOUND,
                format!("Unknown command: .{}. {}", name, HELP_HINT),
            )),
        }
    }

    fn format_result(&self, _request: &Request, value: Option<&Value>) -> String {
        render_value(value)
    }

    fn format_error(&self, _id: Option<&Value>, _code: i32, message: &str) -> String {
        format!("Error: {}", message)
    }

    fn handle_local(&self, raw: &str, ctx: &LocalContext<'_>) -> Option<String> {
        let (name, remainder) = split_command(raw.trim())?;
        if !LOCAL_COMMANDS.iter().any(|(local, _)| *local == name) {
            return None;
        }
        Some(self.run_local(&name, remainder, ctx))
    }
}
