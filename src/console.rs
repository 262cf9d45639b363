use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use url::Url;

use crate::api::MemoryEntry;
use crate::message::{Attachment, AttachmentKind, ChatMessage};
use crate::settings::{ChatSettings, ChatSettingsPatch};
use crate::store::{ChatStore, StoreError};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "flac", "m4a", "aac"];

fn kind_icon(kind: AttachmentKind) -> &'static str {
    match kind {
        AttachmentKind::Image => "🖼️",
        AttachmentKind::Audio => "🎵",
        AttachmentKind::File => "📄",
    }
}

pub fn attachment_kind_for(path: &Path) -> AttachmentKind {
    let ext = path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        AttachmentKind::Image
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        AttachmentKind::Audio
    } else {
        AttachmentKind::File
    }
}

pub fn attachment_from_path(path: &Path) -> anyhow::Result<Attachment> {
    let abs = path.canonicalize().map_err(|e| anyhow::anyhow!("cannot attach {}: {}", path.display(), e))?;
    if !abs.is_file() {
        anyhow::bail!("cannot attach {}: not a file", path.display());
    }
    let url = Url::from_file_path(&abs).map_err(|_| anyhow::anyhow!("cannot build a file URL for {}", abs.display()))?;
    Ok(Attachment::new(attachment_kind_for(&abs), url.to_string()))
}

pub fn render_message(msg: &ChatMessage) -> String {
    let mut header = vec![format!("[{}]", msg.role.label())];
    if let Some(ts) = DateTime::from_timestamp_millis(msg.metadata.timestamp) {
        header.push(ts.with_timezone(&Local).format("%H:%M:%S").to_string());
    }
    if !msg.metadata.model.is_empty() {
        header.push(msg.metadata.model.clone());
    }
    if let Some(tokens) = msg.metadata.tokens {
        header.push(format!("{} tokens", tokens));
    }

    let mut out = header.join(" · ");
    for a in msg.attachments.iter().flatten() {
        out.push_str(&format!("\n  {} {}", kind_icon(a.kind), a.file_name()));
    }
    out.push('\n');
    out.push_str(&msg.content);
    if let Some(tools) = msg.metadata.tools_used.as_ref().filter(|t| !t.is_empty()) {
        out.push_str(&format!("\nTools used: {}", tools.join(", ")));
    }
    out
}

pub fn render_settings(settings: &ChatSettings) -> String {
    format!(
        "provider={}\nmodel={}\ntemperature={}\nmaxTokens={}\nstreamingEnabled={}",
        settings.provider, settings.model, settings.temperature, settings.max_tokens, settings.streaming_enabled
    )
}

/// Input line plus pending attachments, cleared on every successful submit.
#[derive(Debug, Default)]
pub struct Composer {
    attachments: Vec<Attachment>,
}

impl Composer {
    pub fn new() -> Self { Self::default() }

    pub fn attach(&mut self, attachment: Attachment) { self.attachments.push(attachment); }

    pub fn detach(&mut self, index: usize) -> Option<Attachment> {
        (index < self.attachments.len()).then(|| self.attachments.remove(index))
    }

    pub fn attachments(&self) -> &[Attachment] { &self.attachments }

    /// Returns the trimmed text and attachments to send, or `None` when there
    /// is nothing to send or a turn is already running.
    pub fn submit(&mut self, input: &str, busy: bool) -> Option<(String, Vec<Attachment>)> {
        let text = input.trim();
        if text.is_empty() || busy {
            return None;
        }
        Some((text.to_string(), std::mem::take(&mut self.attachments)))
    }
}

/// How a console turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Interrupted,
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
pub async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Sends one message and prints the reply to `out` as it arrives.
///
/// If `interrupt` resolves first the turn is dropped, which returns the store
/// to idle; the user message stays in the log.
pub async fn send_and_print<W: Write>(
    store: &ChatStore,
    text: String,
    attachments: Vec<Attachment>,
    out: &mut W,
    interrupt: impl Future<Output = ()>,
) -> anyhow::Result<TurnOutcome> {
    let mut rx = store.subscribe();
    let before = store.snapshot().messages.len();
    let mut printed = 0usize;

    let turn = store.send_message(text, attachments);
    tokio::pin!(turn);
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            biased;
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let delta = {
                    let s = rx.borrow_and_update();
                    s.streaming_message.get(printed..).map(str::to_string).unwrap_or_default()
                };
                if !delta.is_empty() {
                    if printed == 0 {
                        write!(out, "[Assistant] ")?;
                    }
                    printed += delta.len();
                    write!(out, "{}", delta)?;
                    out.flush()?;
                }
            }
            _ = &mut interrupt => {
                if printed > 0 {
                    writeln!(out)?;
                }
                tracing::info!("turn interrupted");
                return Ok(TurnOutcome::Interrupted);
            }
            res = &mut turn => {
                match res {
                    Ok(()) => break,
                    Err(StoreError::Busy) => anyhow::bail!("{}", StoreError::Busy),
                }
            }
        }
    }

    let state = store.snapshot();
    if let Some(err) = &state.error {
        if printed > 0 {
            writeln!(out)?;
        }
        anyhow::bail!("{}", err);
    }
    if let Some(reply) = state.messages.get(before + 1) {
        if printed > 0 {
            // the last chunks may land after the final watch update was seen
            let rest = reply.content.get(printed..).unwrap_or_default();
            writeln!(out, "{}", rest)?;
        } else {
            writeln!(out, "{}", render_message(reply))?;
        }
    }
    Ok(TurnOutcome::Completed)
}

const HELP: &str = "\
Type a message and press Enter to send it. Ctrl-C stops a reply.
  /attach <path>     attach a file to the next message
  /detach <n>        drop pending attachment n
  /models            list available models
  /providers         list providers
  /health            check the API
  /timeline          show stored memories
  /settings          show settings
  /set key=value     change a setting
  /history           print the conversation
  /clear             forget the conversation
  /quit              leave";

pub async fn run_repl(store: &ChatStore) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    repl(store, stdin, &mut std::io::stdout(), interrupted).await
}

/// Reads lines from `input` until end of input, `/quit`, or an interrupt at
/// the prompt. An interrupt during a reply only abandons that reply.
pub async fn repl<R, W, I, F>(store: &ChatStore, input: R, out: &mut W, mut interrupt: I) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
    I: FnMut() -> F,
    F: Future<Output = ()>,
{
    store.load_models().await;
    writeln!(out, "Connected. /help for commands.")?;
    let mut composer = Composer::new();
    let mut lines = input.lines();

    loop {
        write!(out, "> ")?;
        out.flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = interrupt() => None,
        };
        let Some(line) = line else { break };

        if let Some(command) = line.trim().strip_prefix('/') {
            match handle_command(store, &mut composer, command, out).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => eprintln!("error: {}", e),
            }
            continue;
        }

        let busy = store.snapshot().is_busy();
        let Some((text, attachments)) = composer.submit(&line, busy) else { continue };
        match send_and_print(store, text, attachments, out, interrupt()).await {
            Ok(TurnOutcome::Completed) => {}
            Ok(TurnOutcome::Interrupted) => writeln!(out, "interrupted")?,
            Err(e) => eprintln!("error: {}", e),
        }
    }
    Ok(())
}

/// Runs a slash command. Returns `true` when the session should end.
async fn handle_command<W: Write>(
    store: &ChatStore,
    composer: &mut Composer,
    command: &str,
    out: &mut W,
) -> anyhow::Result<bool> {
    let (name, arg) = command.split_once(' ').map(|(n, a)| (n, a.trim())).unwrap_or((command, ""));
    match name {
        "quit" | "exit" => return Ok(true),
        "help" => writeln!(out, "{}", HELP)?,
        "attach" => {
            let attachment = attachment_from_path(Path::new(arg))?;
            writeln!(out, "{} {}", kind_icon(attachment.kind), attachment.file_name())?;
            composer.attach(attachment);
        }
        "detach" => {
            let index: usize = arg.parse().map_err(|_| anyhow::anyhow!("usage: /detach <n>"))?;
            match index.checked_sub(1).and_then(|i| composer.detach(i)) {
                Some(a) => writeln!(out, "removed {}", a.file_name())?,
                None => anyhow::bail!("no attachment {}", index),
            }
        }
        "models" => {
            store.load_models().await;
            print_models(store, out)?;
        }
        "providers" => print_providers(store, out).await?,
        "health" => print_health(store, out).await?,
        "timeline" => print_timeline(store, out).await?,
        "settings" => writeln!(out, "{}", render_settings(&store.snapshot().settings))?,
        "set" => {
            let patch = ChatSettingsPatch::from_assignments(arg.split_whitespace())?;
            if patch.is_empty() {
                anyhow::bail!("usage: /set key=value");
            }
            store.update_settings(patch).await;
            writeln!(out, "{}", render_settings(&store.snapshot().settings))?;
        }
        "history" => print_history(store, out)?,
        "clear" => {
            store.clear_messages().await;
            writeln!(out, "conversation cleared")?;
        }
        other => anyhow::bail!("unknown command /{} (try /help)", other),
    }
    Ok(false)
}

pub fn print_history<W: Write>(store: &ChatStore, out: &mut W) -> std::io::Result<()> {
    for msg in store.snapshot().messages {
        writeln!(out, "{}\n", render_message(&msg))?;
    }
    Ok(())
}

pub fn print_models<W: Write>(store: &ChatStore, out: &mut W) -> std::io::Result<()> {
    let state = store.snapshot();
    if state.available_models.is_empty() {
        writeln!(out, "no models available")?;
    }
    for m in &state.available_models {
        let marker = if m.id == state.settings.model { "*" } else { " " };
        writeln!(out, "{} {} ({}, {})", marker, m.id, m.name, m.provider)?;
    }
    Ok(())
}

pub async fn print_providers<W: Write>(store: &ChatStore, out: &mut W) -> anyhow::Result<()> {
    for (name, p) in store.transport().get_providers().await? {
        let status = if p.available { "available" } else { "unavailable" };
        let mut line = format!("{}: {}", name, status);
        if let Some(models) = p.models.filter(|m| !m.is_empty()) {
            line.push_str(&format!(" [{}]", models.join(", ")));
        }
        if let Some(err) = p.error {
            line.push_str(&format!(" ({})", err));
        }
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

pub async fn print_health<W: Write>(store: &ChatStore, out: &mut W) -> anyhow::Result<()> {
    let health = store.transport().health_check().await?;
    writeln!(out, "{} (version {})", health.status, health.version)?;
    Ok(())
}

/// Fetches and prints the memory timeline. A failed fetch is shown in place
/// of the list rather than returned.
pub async fn print_timeline<W: Write>(store: &ChatStore, out: &mut W) -> anyhow::Result<()> {
    writeln!(out, "Loading memories...")?;
    out.flush()?;
    match store.transport().get_timeline().await {
        Ok(entries) => writeln!(out, "{}", render_timeline(&entries))?,
        Err(e) => {
            tracing::error!(error = %e, "failed to load timeline");
            writeln!(out, "Failed to load timeline")?;
        }
    }
    Ok(())
}

pub fn render_timeline(entries: &[MemoryEntry]) -> String {
    if entries.is_empty() {
        return "No memories yet".to_string();
    }
    let mut out = String::from("Memory Timeline");
    for m in entries {
        out.push_str(&format!("\n\n{}\n{}", memory_date(&m.created_at), m.content));
        if !m.metadata.is_empty() {
            out.push_str(&format!("\n{}", serde_json::to_string(&m.metadata).unwrap_or_default()));
        }
    }
    out
}

/// Calendar date of a memory. Offset timestamps are shown in local time,
/// naive ones as sent; anything unparseable is echoed back.
fn memory_date(created_at: &str) -> String {
    if let Ok(ts) = DateTime::parse_from_rfc3339(created_at) {
        return ts.with_timezone(&Local).format("%Y-%m-%d").to_string();
    }
    match NaiveDateTime::parse_from_str(created_at, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(ts) => ts.format("%Y-%m-%d").to_string(),
        Err(_) => created_at.to_string(),
    }
}
