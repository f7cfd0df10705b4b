// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task manager client. The conversation syntax follows an FTP-style
//! control connection: three-digit response codes with `-` continuation
//! marks, rendered according to the output style in effect.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use isol_manager::client;
use isol_manager::client::Response;
use isol_manager::SERVER_SOCKET_NAME;
use std::collections::VecDeque;
use std::ffi::CString;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

const START_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_DELAY: Duration = Duration::from_millis(200);

/// isolctl: drive a running task isolation manager.
///
/// Commands may be abbreviated to any unambiguous prefix.
#[derive(Debug, Parser)]
#[clap(infer_subcommands = true)]
struct Opts {
    /// Path of the manager's control socket.
    #[clap(long, default_value = SERVER_SOCKET_NAME)]
    socket: PathBuf,

    /// Response verbosity; repeat for codes and continuation marks.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start the manager application detached, then wait for its
    /// control socket to come up.
    #[clap(visible_alias = "start")]
    Boot {
        /// Reopen the application's stdio onto this console device.
        #[clap(long)]
        console_uart: Option<PathBuf>,

        /// Program to execute, with its arguments.
        #[clap(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Request termination of all workers.
    #[clap(visible_alias = "kill", visible_alias = "shut")]
    Halt,

    /// Remove a resource from the running manager.
    #[clap(visible_alias = "rm", visible_alias = "unplug", visible_alias = "remove")]
    Del,

    /// Add a resource to the running manager.
    #[clap(visible_alias = "plug")]
    Add,

    /// Show manager information.
    #[clap(visible_alias = "show")]
    Info,

    /// Interactive session on the control connection.
    Interactive,
}

/// Output styles, matching the session renderer:
/// 0 message only, 1 with code and continuation mark, 2 like 1 with the
/// prefix in bold for terminals, 3 silent.
fn output_style(cmd: &Cmd, verbose: u8) -> u8 {
    match cmd {
        Cmd::Interactive => {
            if isatty(1) {
                2
            } else {
                1
            }
        }
        _ => match verbose {
            0 => {
                if matches!(cmd, Cmd::Info) {
                    0
                } else {
                    3
                }
            }
            1 => 0,
            _ => 1,
        },
    }
}

fn isatty(fd: libc::c_int) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

fn render(resp: &Response, style: u8) {
    if style == 3 {
        return;
    }
    for line in &resp.lines {
        match (style, line.code) {
            (0, _) | (_, None) => println!("{}", line.text),
            (1, Some(code)) => {
                println!("{:03}{}{}", code, if line.cont { '-' } else { ' ' }, line.text)
            }
            (_, Some(code)) => println!(
                "\x1b[1m{:03}{}\x1b[0m{}",
                code,
                if line.cont { '-' } else { ' ' },
                line.text
            ),
        }
    }
}

/// Run the conversation: responses in, queued or interactive commands
/// out, until the server ends the session. Returns the process exit
/// code: 0 when the final response code is 2xx.
fn session(stream: UnixStream, mut queue: VecDeque<&str>, interactive: bool, style: u8) -> Result<i32> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut last_code = None;
    let prompt = interactive && isatty(0);

    loop {
        let resp = match client::read_response(&mut reader) {
            Ok(resp) => resp,
            Err(_) => break,
        };
        render(&resp, style);
        last_code = resp.code;
        if matches!(resp.code, Some(221) | Some(421)) {
            break;
        }

        if let Some(line) = queue.pop_front() {
            writeln!(writer, "{line}")?;
        } else if interactive {
            if prompt {
                print!("\x1b[1m> \x1b[0m");
                std::io::stdout().flush()?;
            }
            let mut line = String::new();
            if std::io::stdin().lock().read_line(&mut line)? == 0 {
                break;
            }
            writer.write_all(line.as_bytes())?;
            if !line.ends_with('\n') {
                writer.write_all(b"\n")?;
            }
        } else {
            break;
        }
    }

    Ok(match last_code {
        Some(code) if (200..300).contains(&code) => 0,
        _ => 1,
    })
}

/// Fork the application into its own detached session, close inherited
/// descriptors, optionally reopen stdio onto the console device, exec,
/// and poll for the manager's control socket.
fn boot_application(
    socket: &Path,
    command: &[String],
    console_uart: Option<&Path>,
) -> Result<UnixStream> {
    let meta = std::fs::metadata(&command[0]).context("Can't access executable file")?;
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        bail!("File is not executable.");
    }

    let prog = CString::new(command[0].as_bytes()).context("program path contains NUL")?;
    let args: Vec<CString> = command
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<std::result::Result<_, _>>()
        .context("argument contains NUL")?;
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    let uart = console_uart
        .map(|p| CString::new(p.as_os_str().as_bytes()))
        .transpose()
        .context("console path contains NUL")?;

    unsafe {
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
        libc::signal(libc::SIGTSTP, libc::SIG_IGN);

        let pid = libc::fork();
        if pid < 0 {
            bail!("fork failed: {}", std::io::Error::last_os_error());
        }
        if pid > 0 {
            let mut status = 0;
            libc::waitpid(pid, &mut status, 0);
            libc::signal(libc::SIGTTOU, libc::SIG_DFL);
            libc::signal(libc::SIGTTIN, libc::SIG_DFL);
            libc::signal(libc::SIGTSTP, libc::SIG_DFL);
            if status != 0 {
                bail!("Can't start task.");
            }
            // Wait for the server to come up.
            let start = Instant::now();
            loop {
                match client::connect(socket) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        if start.elapsed() >= START_TIMEOUT {
                            return Err(e);
                        }
                        std::thread::sleep(CONNECT_DELAY);
                    }
                }
            }
        }

        // Child: detach from the session, drop inherited descriptors.
        if libc::setpgid(0, 0) != 0 {
            libc::_exit(1);
        }
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        let pid = libc::fork();
        if pid < 0 {
            libc::_exit(1);
        }
        if pid > 0 {
            libc::_exit(0);
        }

        if uart.is_some() {
            for fd in 0..3 {
                libc::close(fd);
            }
        }
        for fd in 3..1024 {
            libc::close(fd);
        }
        if let Some(uart) = &uart {
            libc::open(uart.as_ptr(), libc::O_RDWR | libc::O_APPEND);
            if libc::dup(0) < 0 {
                libc::_exit(1);
            }
            if libc::dup(0) < 0 {
                libc::_exit(1);
            }
        }
        libc::execv(prog.as_ptr(), argv.as_ptr());
        libc::_exit(1);
    }
}

fn run(opts: &Opts) -> Result<i32> {
    let connected = client::connect(&opts.socket);
    let stream = match (&opts.command, connected) {
        (Cmd::Boot { .. }, Ok(_)) => {
            bail!("Can't start task, it is already running.");
        }
        (
            Cmd::Boot {
                command,
                console_uart,
            },
            Err(_),
        ) => boot_application(&opts.socket, command, console_uart.as_deref())
            .context("Can't start task")?,
        (_, Ok(stream)) => stream,
        (_, Err(_)) => bail!("Task is not running."),
    };

    let queue: VecDeque<&str> = match &opts.command {
        Cmd::Info => VecDeque::from(["info", "quit"]),
        Cmd::Boot { .. } => VecDeque::from(["quit"]),
        Cmd::Del => VecDeque::from(["del", "quit"]),
        Cmd::Add => VecDeque::from(["add", "quit"]),
        Cmd::Halt => VecDeque::from(["terminate"]),
        Cmd::Interactive => VecDeque::new(),
    };
    let interactive = matches!(opts.command, Cmd::Interactive);
    let style = output_style(&opts.command, opts.verbose);

    session(stream, queue, interactive, style)
}

fn main() {
    let opts = Opts::parse();
    match run(&opts) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
