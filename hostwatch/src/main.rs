//! Entry point for the headless hostwatch client. Resolves the endpoints,
//! runs the store and prints every state change.

use std::env;
use std::io::{self, Write};

use anyhow::{bail, Context};
use hostwatch::profiles::{
    load_profiles, save_profiles, ProfileEntry, ProfileRequest, ResolveProfile,
};
use hostwatch::{ConnectionType, MonitorConfig, MonitorState, MonitorStore};
use tracing::{info, warn};

const USAGE: &str = "[--profile NAME|-P NAME] [--save] [--http] [--ws URL] [--json] [--dry-run] [http://HOST:PORT/api/monitor]";

struct ParsedArgs {
    url: Option<String>,
    ws: Option<String>,
    profile: Option<String>,
    save: bool,
    http: bool,
    json: bool,
    dry_run: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "hostwatch".into());
    let mut parsed = ParsedArgs {
        url: None,
        ws: None,
        profile: None,
        save: false,
        http: false,
        json: false,
        dry_run: false,
    };

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(format!("Usage: {prog} {USAGE}")),
            "--profile" | "-P" => parsed.profile = it.next(),
            "--ws" => parsed.ws = it.next(),
            "--save" => parsed.save = true,
            "--http" => parsed.http = true,
            "--json" => parsed.json = true,
            "--dry-run" => parsed.dry_run = true,
            _ if arg.starts_with("--profile=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        parsed.profile = Some(v.to_string());
                    }
                }
            }
            _ if arg.starts_with("--ws=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        parsed.ws = Some(v.to_string());
                    }
                }
            }
            _ if arg.starts_with('-') => {
                return Err(format!("Unknown flag {arg}. Usage: {prog} {USAGE}"));
            }
            _ => {
                if parsed.url.is_none() {
                    parsed.url = Some(arg);
                } else {
                    return Err(format!("Unexpected argument. Usage: {prog} {USAGE}"));
                }
            }
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let parsed = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(());
        }
    };

    let mut cfg = MonitorConfig::from_env().context("invalid HOSTWATCH_* configuration")?;
    let profiles_file = load_profiles();
    let req = ProfileRequest {
        profile_name: parsed.profile.clone(),
        api_base_url: parsed.url.clone(),
        ws_base_url: parsed.ws.clone(),
        transport: parsed.http.then_some(ConnectionType::Http),
    };

    let entry = match req.resolve(&profiles_file) {
        ResolveProfile::Direct(entry) => {
            if let Some(name) = parsed.profile.as_ref() {
                remember_profile(name, &entry, parsed.save);
            }
            Some(entry)
        }
        ResolveProfile::Loaded(entry) => Some(entry),
        ResolveProfile::PromptSelect(names) => match prompt_select(&names) {
            Some(name) => profiles_file.profiles.get(&name).cloned(),
            None => return Ok(()),
        },
        ResolveProfile::Missing(name) => {
            bail!("profile '{name}' does not exist; pass an API URL to create it")
        }
        ResolveProfile::None => None,
    };

    if let Some(entry) = &entry {
        entry.apply_to(&mut cfg)?;
    }
    if let Some(ws) = &parsed.ws {
        cfg.ws_base_url = ws.clone();
    }
    if parsed.http {
        cfg.initial_transport = ConnectionType::Http;
    }
    cfg.validate()?;

    if parsed.dry_run {
        println!("api: {}", cfg.api_base_url);
        println!("ws: {}", cfg.ws_base_url);
        println!("health: {}", cfg.health_url());
        println!("transport: {}", cfg.initial_transport);
        return Ok(());
    }

    run(cfg, parsed.json).await
}

// New profiles are saved right away; changing an existing one needs --save
// or a confirmation.
fn remember_profile(name: &str, entry: &ProfileEntry, save: bool) {
    let mut profiles = load_profiles();
    let write = match profiles.profiles.get(name) {
        None => true,
        Some(existing) if existing == entry => false,
        Some(_) => save || prompt_yes_no(&format!("Overwrite existing profile '{name}'? [y/N]: ")),
    };
    if !write {
        return;
    }
    profiles.profiles.insert(name.to_string(), entry.clone());
    if let Err(e) = save_profiles(&profiles) {
        warn!(profile = name, error = %e, "failed to save profile");
    }
}

async fn run(cfg: MonitorConfig, json: bool) -> anyhow::Result<()> {
    let store = MonitorStore::new(cfg)?;
    let mut rx = store.subscribe();
    store.initialize_connection().await;

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = rx.borrow_and_update().clone();
                print_state(&state, json)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                store.disconnect();
                break;
            }
        }
    }
    Ok(())
}

fn print_state(state: &MonitorState, json: bool) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer(&mut out, state)?;
        writeln!(out)?;
        return Ok(());
    }

    let conn = &state.connection;
    let status = match (conn.connected, conn.loading) {
        (true, _) => "connected",
        (false, true) => "connecting",
        (false, false) => "disconnected",
    };
    let data = &state.data;
    let host = data.system.as_ref().map_or("-", |s| s.hostname.as_str());
    let pct = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.1}%"));
    let (up, down) = data
        .network
        .as_ref()
        .map(|n| (n.upload_speed.unwrap_or(0.0), n.download_speed.unwrap_or(0.0)))
        .unwrap_or_default();

    write!(
        out,
        "[{}] {status} host={host} cpu={} mem={} disk={} net=up {up:.1}/down {down:.1} procs={}",
        conn.connection_type,
        pct(data.cpu.as_ref().map(|c| c.usage)),
        pct(data.memory.as_ref().map(|m| m.percent)),
        pct(data.disk.as_ref().map(|d| d.percent)),
        data.processes.as_ref().map_or(0, Vec::len),
    )?;
    if let Some(err) = &conn.error {
        write!(out, " error={err}")?;
    }
    let failing: Vec<String> = state
        .module_errors
        .iter()
        .filter(|(_, e)| e.is_some())
        .map(|(m, _)| m.to_string())
        .collect();
    if !failing.is_empty() {
        write!(out, " failing={}", failing.join(","))?;
    }
    writeln!(out)?;
    Ok(())
}

fn prompt_select(names: &[String]) -> Option<String> {
    eprintln!("Select profile:");
    for (i, n) in names.iter().enumerate() {
        eprintln!("  {}. {}", i + 1, n);
    }
    eprint!("Enter number (or blank to abort): ");
    let _ = io::stderr().flush();
    let mut line = String::new();
    io::stdin().read_line(&mut line).ok()?;
    let idx = line.trim().parse::<usize>().ok()?;
    names.get(idx.checked_sub(1)?).cloned()
}

fn prompt_yes_no(prompt: &str) -> bool {
    eprint!("{prompt}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_ok() {
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    } else {
        false
    }
}
