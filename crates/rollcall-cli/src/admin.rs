//! Interactive admin panel over a line-oriented reader.

use anyhow::{Context, Result};
use rollcall_core::{AdminSession, AttendanceLog};
use std::io::{BufRead, Write};
use std::path::Path;

const HELP: &str = "\
commands:
  login [PASSWORD]   authenticate (prompts when no password is given)
  logout             drop admin rights
  status             show login state and record count
  clear-today        delete today's attendance records
  clear-all          delete every attendance record
  export [PATH]      write the table as CSV to PATH, or print a data URI
  help               show this text
  quit               leave the admin panel";

/// Read commands until `quit` or end of input. Authentication never
/// outlives this call.
///
/// The table at `log_path` is reopened for every command that touches it, so
/// marks written by a concurrent `detect` run are seen and never clobbered.
pub fn run<R: BufRead, W: Write>(
    mut input: R,
    out: &mut W,
    session: &mut AdminSession,
    log_path: &Path,
) -> Result<()> {
    writeln!(out, "rollcall admin panel; type 'help' for commands")?;

    loop {
        write!(out, "admin> ")?;
        out.flush()?;
        let Some(line) = read_line(&mut input)? else {
            writeln!(out)?;
            break;
        };

        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let arg = words.next();

        let outcome: Result<String> = match command {
            "login" => {
                let password = match arg {
                    Some(p) => Some(p.to_string()),
                    None => {
                        write!(out, "password: ")?;
                        out.flush()?;
                        read_line(&mut input)?
                    }
                };
                match password {
                    Some(p) => session
                        .login(p.trim())
                        .map(|()| "logged in".to_string())
                        .map_err(Into::into),
                    None => break,
                }
            }
            "logout" => {
                session.logout();
                Ok("logged out".to_string())
            }
            "status" => open_log(log_path).map(|log| {
                format!(
                    "{}; {} attendance record(s)",
                    if session.is_authenticated() { "logged in" } else { "not logged in" },
                    log.len()
                )
            }),
            "clear-today" => open_log(log_path).and_then(|mut log| {
                let now = chrono::Local::now().naive_local();
                session
                    .clear_today(&mut log, now)
                    .map(|n| format!("removed {n} record(s) dated {}", now.date()))
                    .map_err(Into::into)
            }),
            "clear-all" => open_log(log_path).and_then(|mut log| {
                session
                    .clear_all(&mut log)
                    .map(|()| "attendance log cleared".to_string())
                    .map_err(Into::into)
            }),
            "export" => open_log(log_path).and_then(|log| export(session, &log, arg.map(Path::new))),
            "help" => Ok(HELP.to_string()),
            "quit" | "exit" => break,
            other => Ok(format!("unknown command '{other}'; type 'help' for commands")),
        };

        match outcome {
            Ok(message) => writeln!(out, "{message}")?,
            Err(e) => writeln!(out, "error: {e:#}")?,
        }
    }

    session.logout();
    Ok(())
}

fn open_log(path: &Path) -> Result<AttendanceLog> {
    AttendanceLog::open(path).with_context(|| format!("opening attendance log {}", path.display()))
}

fn export(session: &AdminSession, log: &AttendanceLog, path: Option<&Path>) -> Result<String> {
    let blob = session.export(log)?;
    let Some(path) = path else {
        return Ok(blob.data_uri());
    };
    let csv = blob.decode().context("decoding export")?;
    std::fs::write(path, csv).with_context(|| format!("writing {}", path.display()))?;
    Ok(format!("exported {} record(s) to {}", log.len(), path.display()))
}

fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
