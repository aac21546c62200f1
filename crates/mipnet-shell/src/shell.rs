//! Interactive prompt.
//!
//! Stdin is read on its own thread and Ctrl-C is turned into an event, so
//! both arrive on one channel and are handled between commands. A running
//! scenario is never interrupted halfway; the interrupt is acted on once
//! it returns.

use std::io::{self, BufRead, Write};
use std::thread;

use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver};
use mipnet_sim::{CommandOutcome, CommandRegistry, Session, Substrate};
use tracing::{info, warn};

const PROMPT: &str = "mipnet> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Line(String),
    Eof,
    Interrupt,
}

pub fn run<S: Substrate>(
    session: &mut Session<S>,
    registry: &mut CommandRegistry<S>,
) -> anyhow::Result<()> {
    let (tx, rx) = unbounded();

    let interrupt_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(ShellEvent::Interrupt);
    })
    .context("failed to install Ctrl-C handler")?;

    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(ShellEvent::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            let _ = tx.send(ShellEvent::Eof);
        })
        .context("failed to spawn stdin reader")?;

    println!("{}", registry.help());
    drive(session, registry, &rx, &mut io::stdout().lock())
}

/// Handle events until an exit command, end of input or an interrupt, then
/// tear the session down.
pub fn drive<S: Substrate>(
    session: &mut Session<S>,
    registry: &mut CommandRegistry<S>,
    events: &Receiver<ShellEvent>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;

        let line = match events.recv() {
            Ok(ShellEvent::Line(line)) => line,
            Ok(ShellEvent::Eof) | Err(_) => {
                writeln!(out)?;
                "EOF".to_string()
            }
            Ok(ShellEvent::Interrupt) => {
                writeln!(out)?;
                info!("interrupted");
                break;
            }
        };

        match registry.dispatch(session, &line) {
            Ok(CommandOutcome::Continue(msg)) => {
                if !msg.is_empty() {
                    writeln!(out, "{msg}")?;
                }
            }
            Ok(CommandOutcome::Exit(msg)) => {
                writeln!(out, "{msg}")?;
                break;
            }
            Err(e) => writeln!(out, "error: {e}")?,
        }
    }

    if let Some(report) = session.shutdown() {
        writeln!(
            out,
            "killed {} processes ({} failed)",
            report.total(),
            report.failed.len()
        )?;
    }
    Ok(())
}
