use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use console::style;
use futures::executor::block_on;
use pbdebug::{
    session::{LaunchArgs, Notification, OutputCategory, Session},
    transport::TransportKind,
};

/// A headless runner for PureBasic programs under the debugger. Compiles
/// the given source, runs it with the debugger attached, and streams Debug
/// output and stop events to the console.
///
/// To use it, point it at a source file:
///
///     $ pbdbg demo.pb
///
/// With --stop-on-entry the program halts at its first line and the call
/// stack is printed before it continues.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The PureBasic source file to run.
    program: PathBuf,

    /// Path of the PureBasic compiler. Defaults to probing $PUREBASIC_HOME
    /// and $PATH.
    #[arg(long, value_name = "PATH")]
    compiler: Option<PathBuf>,

    /// Halt at the program entry point and print the call stack.
    #[arg(long)]
    stop_on_entry: bool,

    /// Debugger channel to offer the debuggee.
    #[arg(long, value_name = "KIND", default_value = "default")]
    transport: String,

    /// Port for the network transport (0 picks an ephemeral port).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Show raw compiler output on errors.
    #[arg(long)]
    trace: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let transport = match args.transport.as_str() {
        "default" => TransportKind::default(),
        "fifo" => TransportKind::Fifo,
        "pipes" => TransportKind::NamedPipes,
        "network" => TransportKind::Network,
        other => bail!("unknown transport {other:?} (fifo, pipes, network)"),
    };

    let mut session = Session::new();
    let notifications = session.notifications().expect("fresh session");
    session.initialize();

    session
        .launch(LaunchArgs {
            compiler: args.compiler.clone(),
            stop_on_entry: args.stop_on_entry,
            transport,
            debug_port: Some(args.port),
            trace: args.trace,
            ..LaunchArgs::new(args.program.clone())
        })
        .context("launch failed")?;

    block_on(session.configuration_done()).context("starting the debuggee failed")?;

    for notification in notifications {
        match notification {
            Notification::Stopped { reason, .. } => {
                eprintln!("{} {reason}", style("stopped:").yellow().bold());

                for frame in block_on(session.stack_trace())? {
                    let at = match &frame.path {
                        Some(path) => format!("{}:{}", path.display(), frame.line),
                        None => format!("line {}", frame.line),
                    };
                    eprintln!("  #{} {} ({at})", frame.id, style(&frame.name).cyan());
                }

                session.resume()?;
            }
            Notification::Output { category, text } => match category {
                OutputCategory::Stderr => {
                    eprint!("{}", style(text).red());
                }
                OutputCategory::Console => eprint!("{}", style(text).dim()),
                OutputCategory::Stdout => print!("{text}"),
            },
            Notification::Terminated => break,
            Notification::Initialized | Notification::Continued => {}
        }
    }

    Ok(())
}
