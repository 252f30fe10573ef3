use anyhow::{anyhow, bail, Context};
use clap::Parser;
use rdbg::config::Config;
use rdbg::controller::{InProcessLauncher, Launcher, ProcessLauncher, SessionFrontend};
use rdbg::remoting::ChannelKind;
use rdbg::server::{BreakEvent, BreakEventHandle, StartInfo, TargetEvent, TargetEventKind};
use rdbg::session::DebuggerSession;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Program to debug
    program: String,

    /// Program arguments
    #[arg(last = true)]
    arguments: Vec<String>,

    /// Working directory of the program
    #[clap(long)]
    cwd: Option<String>,

    /// Set a breakpoint at FILE:LINE (maybe more than one)
    #[clap(short, long = "break", value_name = "FILE:LINE")]
    breakpoints: Vec<String>,

    /// Set a breakpoint at a function entry (maybe more than one)
    #[clap(long = "break-fn", value_name = "FUNCTION")]
    function_breakpoints: Vec<String>,

    /// Expression printed at every stop (maybe more than one)
    #[clap(short, long)]
    eval: Vec<String>,

    /// Toolchain installation prefix
    #[clap(long, env = "RDBG_RUNTIME_PREFIX")]
    runtime_prefix: Option<String>,

    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<String>,

    /// Remoting channel kind: tcp or unix
    #[clap(long)]
    channel: Option<ChannelKind>,

    /// Run the debugger server inside this process
    #[clap(long)]
    in_process: bool,

    /// Turn off debugger logs
    #[clap(short, long)]
    quiet: bool,
}

/// Prints program output as it comes and hands target events to the main loop.
struct Printer {
    events: Mutex<Sender<TargetEvent>>,
}

impl SessionFrontend for Printer {
    fn on_target_event(&self, event: &TargetEvent) {
        _ = self.events.lock().unwrap().send(event.clone());
    }

    fn on_target_output(&self, is_stderr: bool, line: &str) {
        if is_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn on_debugger_output(&self, _is_stderr: bool, line: &str) {
        eprintln!("[rdbg] {line}");
    }

    fn on_breakpoint_update(&self, _: BreakEventHandle, _: i32, last_trace: Option<&str>) {
        if let Some(trace) = last_trace {
            println!("trace: {trace}");
        }
    }
}

fn parse_location(location: &str) -> anyhow::Result<BreakEvent> {
    let Some((file, line)) = location.rsplit_once(':') else {
        bail!("invalid breakpoint location `{location}`, expected FILE:LINE");
    };
    let line = line
        .parse()
        .with_context(|| format!("invalid line number in `{location}`"))?;
    Ok(BreakEvent::breakpoint(file, line))
}

fn report_stop(session: &DebuggerSession, event: &TargetEvent, watches: &[String]) -> anyhow::Result<()> {
    match event.break_event_id {
        Some(id) => println!("stopped: {} {id}", event.kind),
        None => println!("stopped: {}", event.kind),
    }

    let pid = event.process_id.ok_or_else(|| anyhow!("stop event without a process"))?;
    let tid = event.thread_id.ok_or_else(|| anyhow!("stop event without a thread"))?;
    let backtrace = session.get_backtrace(pid, tid)?;
    let options = &session.options().evaluation_options;

    for (num, frame) in backtrace.get_stack_frames(0, usize::MAX)?.iter().enumerate() {
        let location = match (&frame.file, frame.line) {
            (Some(file), Some(line)) => format!(" at {file}:{line}"),
            _ => String::new(),
        };
        println!("#{num} {:#016X} {}{location}", frame.address, frame.label);
    }

    if let Some(this) = backtrace.get_this_reference(0, options)? {
        println!("  this = {}", this.value);
    }
    for var in backtrace
        .get_parameters(0, options)?
        .into_iter()
        .chain(backtrace.get_local_variables(0, options)?)
    {
        println!("  {} {} = {}", var.type_name, var.name, var.value);
    }
    for watch in backtrace.get_expression_values(0, watches, options)? {
        println!("  {} = {}", watch.name, watch.value);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rdbg::log::init();
    if args.quiet {
        rdbg::log::disable();
    }

    let mut config = Config::from_file(args.config.as_deref());
    if let Some(channel) = args.channel {
        config.controller.channel = channel;
    }
    let launcher: Arc<dyn Launcher> = if args.in_process {
        Arc::new(InProcessLauncher)
    } else {
        Arc::new(ProcessLauncher)
    };
    let (tx, rx) = channel();
    let printer = Arc::new(Printer {
        events: Mutex::new(tx),
    });
    let session = DebuggerSession::new(&config, launcher, printer);

    for location in &args.breakpoints {
        session.insert_break_event(parse_location(location)?)?;
    }
    for function in &args.function_breakpoints {
        session.insert_break_event(BreakEvent::function(function))?;
    }

    let mut start_info = StartInfo::new(&args.program);
    start_info.arguments = args.arguments.clone();
    start_info.working_dir = args.cwd.clone();
    start_info.runtime_prefix = args.runtime_prefix.clone();
    session
        .run(&start_info)
        .with_context(|| format!("run {}", args.program))?;

    let exit_code = loop {
        let event = rx.recv().context("debugger session is gone")?;
        match event.kind {
            TargetEventKind::TargetExited => {
                if let Some(message) = &event.message {
                    eprintln!("{message}");
                }
                break event.exit_code;
            }
            TargetEventKind::ThreadStarted | TargetEventKind::ThreadStopped => continue,
            _ => {
                if let Err(e) = report_stop(&session, &event, &args.eval) {
                    eprintln!("{e:#}");
                }
                session.r#continue()?;
            }
        }
    };

    session.exit()?;
    match exit_code {
        Some(code) => println!("program exited with code {code}"),
        None => println!("program terminated"),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rdbg::server::BreakEventKind;

    #[test]
    fn test_parse_location() {
        let event = parse_location("src/Program.cs:12").unwrap();
        assert_eq!(
            event.kind,
            BreakEventKind::Breakpoint {
                file: "src/Program.cs".to_string(),
                line: 12
            }
        );
        assert!(parse_location("Program.cs").is_err());
        assert!(parse_location("Program.cs:x").is_err());
    }
}
