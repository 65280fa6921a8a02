//! CallerPro CLI: place a live voice call from the terminal.
//!
//! Usage:
//!   cargo run -p callerpro-cli -- [--template customer-support] [--voice Zephyr] [--text-only]
//!
//! While the call is up: `m` + Enter toggles mute, `q` + Enter hangs up.
//! Requires GEMINI_API_KEY (or API_KEY). Settings come from
//! CALLERPRO_CONFIG (default config/callerpro.toml) and CALLERPRO__* env vars.

use anyhow::{bail, Context};
use callerpro_voice::{
    available_voices, voice_alias, CallSettings, ControllerOptions, LiveSocketConnector,
    ResponseModality, Role, SessionState, Template, ToolAuditRecord, TranscriptLog,
    VoiceSessionController,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

struct CliArgs {
    template: Option<Template>,
    voice: Option<String>,
    text_only: bool,
    no_mic: bool,
}

fn print_usage() {
    eprintln!("CallerPro: live voice calls");
    eprintln!("  --template NAME   customer-support | personal-assistant | navigation-system");
    eprintln!("  --voice NAME      Prebuilt voice (see --list-voices)");
    eprintln!("  --text-only       Ask for text replies and skip audio devices");
    eprintln!("  --no-mic          Listen only; do not open the microphone");
    eprintln!("  --list-voices     Print the voice catalog and exit");
    eprintln!();
    eprintln!("Requires GEMINI_API_KEY (or API_KEY).");
}

/// `Ok(None)` means the invocation was fully handled (help, voice list).
fn parse_args() -> anyhow::Result<Option<CliArgs>> {
    let mut parsed = CliArgs {
        template: None,
        voice: None,
        text_only: false,
        no_mic: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--template" => {
                let name = args.next().context("--template needs a value")?;
                parsed.template = Some(name.parse()?);
            }
            "--voice" => parsed.voice = Some(args.next().context("--voice needs a value")?),
            "--text-only" => parsed.text_only = true,
            "--no-mic" => parsed.no_mic = true,
            "--list-voices" => {
                for voice in available_voices() {
                    println!("{:<16} {}", voice, voice_alias(voice).unwrap_or(""));
                }
                return Ok(None);
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other => {
                print_usage();
                bail!("unknown argument: {}", other);
            }
        }
    }
    Ok(Some(parsed))
}

fn speaker_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Agent => "agent",
        Role::System => "system",
    }
}

/// Print turns that can no longer change, starting at `printed`.
fn print_settled(log: &TranscriptLog, printed: &mut usize) {
    let turns = log.turns();
    while *printed < turns.len() {
        let turn = &turns[*printed];
        let is_tail = *printed + 1 == turns.len();
        if is_tail && !turn.is_final {
            break;
        }
        println!("[{}] {}", speaker_label(turn.role), turn.text);
        *printed += 1;
    }
}

fn print_audit(record: &ToolAuditRecord) {
    match record {
        ToolAuditRecord::Requested { invocation, .. } => {
            println!("  ↳ tool {} ({}) args={}", invocation.name, invocation.id, invocation.args);
        }
        ToolAuditRecord::Resolved {
            result,
            outcome,
            elapsed,
            ..
        } => {
            println!(
                "  ↳ tool {} ({}) {:?} in {:?}: {}",
                result.name, result.id, outcome, elapsed, result.response
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let mut settings = CallSettings::load().context("loading call settings")?;
    if let Some(template) = args.template {
        settings.set_template(template);
    }
    if let Some(voice) = args.voice {
        settings.voice = voice;
    }
    if args.text_only {
        settings.modality = ResponseModality::Text;
    }

    let options = ControllerOptions {
        microphone: !args.text_only && !args.no_mic,
        speaker: !args.text_only,
    };

    let connector = LiveSocketConnector::from_env(settings.endpoint.clone())?;
    info!(template = settings.template.as_str(), voice = %settings.voice, "Placing call");

    let mut controller = VoiceSessionController::new(settings, Arc::new(connector), options);
    let mut audit = controller
        .take_audit_receiver()
        .context("audit trail already taken")?;
    let mut transcript = controller.transcript();

    controller.connect().await.context("connecting")?;
    let mut state = controller.subscribe_state();
    if let Some(device_error) = controller.last_device_error() {
        eprintln!("⚠️  audio device unavailable, continuing without it: {}", device_error);
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line() => match line?.as_deref().map(str::trim) {
                Some("m") => {
                    let muted = controller.toggle_mute();
                    println!("{}", if muted { "🔇 muted" } else { "🎤 unmuted" });
                }
                Some("q") | None => break,
                Some(_) => println!("{}  (m = mute, q = hang up)", controller.call_clock()),
            },
            changed = transcript.changed() => {
                if changed.is_err() {
                    break;
                }
                let log = transcript.borrow_and_update().clone();
                print_settled(&log, &mut printed);
            }
            Some(record) = audit.recv() => print_audit(&record),
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    SessionState::Open => println!("📞 connected (m: mute, q: hang up)"),
                    SessionState::Closed | SessionState::Errored => {
                        if let Some(cause) = controller.last_error() {
                            eprintln!("call ended with error: {}", cause);
                        }
                        break;
                    }
                    SessionState::Idle | SessionState::Connecting => {}
                }
            }
        }
    }

    let duration = controller.call_clock();
    controller.shutdown();

    let log = transcript.borrow().clone();
    println!();
    println!("Call duration {}", duration);
    if !log.is_empty() {
        println!();
        println!("{}", log.to_markdown());
    }
    Ok(())
}
