//! REPL – the interactive `rmbridge` shell.
//!
//! Supported slash-commands:
//!   /help                 – show this list
//!   /connect              – start the bridge and connect to a device
//!   /disconnect           – disconnect and stop the bridge
//!   /status               – bridge, link and camera state
//!   /keys                 – list the key catalog
//!   /get <Key>            – read a key
//!   /set <Key> <json>     – write a key
//!   /action <Key> [json]  – perform an action key
//!   /find                 – probe the network without connecting
//!   /quit | /exit         – stop everything and exit

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use rmbridge_finder::Finder;
use rmbridge_runtime::{Client, ClientConfig};
use rmbridge_types::{Key, Value, ValueShape, keys};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Connect,
    Disconnect,
    Status,
    Keys,
    Get(Key),
    Set(Key, serde_json::Value),
    Action(Key, Option<serde_json::Value>),
    Find,
    Quit,
}

/// Parse one input line.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match name {
        "/help" => Command::Help,
        "/connect" => Command::Connect,
        "/disconnect" => Command::Disconnect,
        "/status" => Command::Status,
        "/keys" => Command::Keys,
        "/find" => Command::Find,
        "/quit" | "/exit" => Command::Quit,
        "/get" => Command::Get(key_arg(rest)?),
        "/set" => {
            let (key, json) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /set <Key> <json>".to_string())?;
            Command::Set(key_arg(key)?, json_arg(json)?)
        }
        "/action" => match rest.split_once(char::is_whitespace) {
            Some((key, json)) => Command::Action(key_arg(key)?, Some(json_arg(json)?)),
            None => Command::Action(key_arg(rest)?, None),
        },
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(command)
}

fn key_arg(raw: &str) -> Result<Key, String> {
    if raw.is_empty() {
        return Err("missing key name (see /keys)".to_string());
    }
    Key::from_name(raw).ok_or_else(|| format!("unknown key '{raw}' (see /keys)"))
}

fn json_arg(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw.trim()).map_err(|e| format!("invalid JSON '{}': {e}", raw.trim()))
}

/// Loose conversion used for action payloads, whose shape the catalog does
/// not describe.
fn loose_value(json: serde_json::Value) -> Result<Value, String> {
    use serde_json::Value as J;
    match json {
        J::Null => Ok(Value::Null),
        J::Bool(b) => Ok(Value::Bool(b)),
        J::Number(n) => match n.as_u64() {
            Some(u) => Ok(Value::Uint(u)),
            None => n.as_f64().map(Value::Float).ok_or_else(|| format!("unsupported number {n}")),
        },
        J::String(s) => Ok(Value::String(s)),
        J::Object(map) => Ok(Value::Record(map)),
        J::Array(_) => Err("arrays are not supported as payloads".to_string()),
    }
}

fn access_flags(key: &Key) -> String {
    [
        (key.is_readable(), 'R'),
        (key.is_writable(), 'W'),
        (key.is_actionable(), 'A'),
        (key.is_subscribable(), 'S'),
    ]
    .iter()
    .map(|(set, c)| if *set { *c } else { '-' })
    .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

pub struct Session {
    config: ClientConfig,
    client: Option<Client>,
    runtime: Runtime,
}

impl Session {
    pub fn new(config: ClientConfig, client: Option<Client>, runtime: Runtime) -> Self {
        Self {
            config,
            client,
            runtime,
        }
    }

    fn client(&self) -> Option<&Client> {
        if self.client.is_none() {
            println!(
                "{} native bridge library not loaded; set {} and restart.",
                "Unavailable:".red(),
                "RMBRIDGE_LIBRARY_PATH".bold()
            );
        }
        self.client.as_ref()
    }

    fn connected_client(&self) -> Option<&Client> {
        let client = self.client()?;
        if !self.runtime.block_on(client.is_started()) {
            println!("{} run {} first.", "Not connected:".red(), "/connect".bold());
            return None;
        }
        Some(client)
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Help => cmd_help(),
            Command::Connect => self.cmd_connect(),
            Command::Disconnect => self.cmd_disconnect(),
            Command::Status => self.cmd_status(),
            Command::Keys => cmd_keys(),
            Command::Get(key) => self.cmd_get(key),
            Command::Set(key, json) => self.cmd_set(key, json),
            Command::Action(key, json) => self.cmd_action(key, json),
            Command::Find => self.cmd_find(),
            Command::Quit => {}
        }
    }

    fn cmd_connect(&self) {
        let Some(client) = self.client() else { return };
        println!(
            "  Searching for a device (up to {}s) …",
            self.config.discovery_timeout_secs
        );
        match self.runtime.block_on(client.start()) {
            Ok(()) => {
                let device = client
                    .connection()
                    .beacon()
                    .map(|b| b.source_ip().to_string())
                    .unwrap_or_default();
                println!("{} {}", "✓ Connected to".green(), device.bold());
            }
            Err(e) => println!("{}: {}", "Connect failed".red(), e),
        }
    }

    fn cmd_disconnect(&self) {
        let Some(client) = self.client() else { return };
        match self.runtime.block_on(client.stop()) {
            Ok(()) => println!("{}", "✓ Disconnected".green()),
            Err(e) => println!("{}: {}", "Disconnect failed".red(), e),
        }
    }

    fn cmd_status(&self) {
        println!("{}", "Status".bold().underline());
        let Some(client) = self.client.as_ref() else {
            println!("  Library     : {}", "not loaded".red());
            return;
        };
        let bridge = client.bridge();
        let connection = client.connection();
        let camera = client.camera();

        let on_off = |b: bool| if b { "yes".green() } else { "no".yellow() };
        println!("  Bridge      : {}", on_off(bridge.is_started()));
        println!("  Link        : {:?} (up: {})", connection.state(), on_off(connection.connected()));
        if let Some(beacon) = connection.beacon() {
            println!(
                "  Device      : {} app {} pairing {} seen {}",
                beacon.source_ip().to_string().bold(),
                beacon.app_id(),
                beacon.is_pairing(),
                beacon.seen_at().format("%H:%M:%S")
            );
        }
        println!("  Recording   : {}", on_off(camera.is_recording_video()));
        if camera.is_recording_video() {
            println!("  Elapsed     : {}s", camera.recording_time().as_secs());
        }
        println!("  Pending RPC : {}", bridge.pending_requests());
    }

    fn cmd_get(&self, key: Key) {
        let Some(client) = self.connected_client() else { return };
        match client.bridge().get_key_value_sync(key, false) {
            Ok(value) => println!("  {} = {}", key.name().bold(), value.to_string().yellow()),
            Err(e) => println!("{}: {}", "Get failed".red(), e),
        }
    }

    fn cmd_set(&self, key: Key, json: serde_json::Value) {
        let Some(client) = self.connected_client() else { return };
        let value = match Value::decode(key.shape(), json) {
            Ok(v) => v,
            Err(e) => {
                println!("{}: {}", "Bad value".red(), e);
                return;
            }
        };
        match client.bridge().set_key_value_sync(key, value) {
            Ok(()) => println!("{} {}", "✓ Set".green(), key.name().bold()),
            Err(e) => println!("{}: {}", "Set failed".red(), e),
        }
    }

    fn cmd_action(&self, key: Key, json: Option<serde_json::Value>) {
        let Some(client) = self.connected_client() else { return };
        let payload = match json.map(loose_value).transpose() {
            Ok(p) => p,
            Err(e) => {
                println!("{}: {}", "Bad payload".red(), e);
                return;
            }
        };
        match client.bridge().perform_action_sync(key, payload) {
            Ok(()) => println!("{} {}", "✓ Performed".green(), key.name().bold()),
            Err(e) => println!("{}: {}", "Action failed".red(), e),
        }
    }

    fn cmd_find(&self) {
        let finder = Finder::new(self.config.finder_config());
        let timeout = Duration::from_secs(self.config.discovery_timeout_secs);
        println!("  Probing {} …", finder.config().probe_target.to_string().dimmed());
        match self.runtime.block_on(finder.find(timeout)) {
            Ok(beacon) => println!(
                "  {} {} (announced {}, app {}, mac {})",
                "Found".green(),
                beacon.source_ip().to_string().bold(),
                beacon.announced_ip(),
                beacon.app_id(),
                beacon
                    .mac()
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":")
            ),
            Err(e) => println!("{}: {}", "Find failed".red(), e),
        }
    }

    fn shutdown(&self) {
        let Some(client) = self.client.as_ref() else { return };
        if self.runtime.block_on(client.is_started())
            && let Err(e) = self.runtime.block_on(client.stop())
        {
            warn!(error = %e, "shutdown did not complete cleanly");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Run the shell until `/quit`, end of input, or `shutdown` is set.
pub fn run(session: Session, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };

    while !shutdown.load(Ordering::SeqCst) {
        let line = match editor.readline("rmbridge> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        match parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => session.execute(command),
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e,
                "/help".bold()
            ),
        }
    }

    session.shutdown();
    println!("{}", "Goodbye.".green());
}

fn cmd_help() {
    println!();
    println!("{}", "rmbridge Commands".bold().underline());
    println!("  {}            – start the bridge and connect", "/connect".bold().cyan());
    println!("  {}         – disconnect and stop the bridge", "/disconnect".bold().cyan());
    println!("  {}             – bridge, link and camera state", "/status".bold().cyan());
    println!("  {}               – list the key catalog", "/keys".bold().cyan());
    println!("  {}          – read a key", "/get <Key>".bold().cyan());
    println!("  {}   – write a key", "/set <Key> <json>".bold().cyan());
    println!("  {} – perform an action", "/action <Key> [json]".bold().cyan());
    println!("  {}               – probe the network only", "/find".bold().cyan());
    println!("  {}        – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_keys() {
    println!("{}", "Keys".bold().underline());
    for key in keys::all() {
        let shape = match key.shape() {
            ValueShape::Void => String::new(),
            shape => format!("{shape:?}"),
        };
        println!(
            "  {:<40} {}  {:#010x}  {}",
            key.name(),
            access_flags(key).cyan(),
            key.sub_type(),
            shape.dimmed()
        );
    }
}
