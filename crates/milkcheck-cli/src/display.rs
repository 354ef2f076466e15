//! ANSI console rendering of engine events.
//!
//! The renderer keeps a rewritable progress line listing the services
//! whose actions are in flight, and prints one status line per resolved
//! service with the status right-aligned and colored. Verbosity gates how
//! much of the action layer shows through.

use std::io::{Write, stderr, stdout};
use std::sync::{Arc, Mutex};

use crossterm::style::{Color, Stylize};
use crossterm::tty::IsTty;

use milkcheck_core::entity::Status;
use milkcheck_core::view::{ActionSnapshot, EntitySnapshot, UserView};

/// On very wide terminals, do not push the status column too far away.
const MAX_TERM_WIDTH: usize = 120;

/// Width of the widest status label (`TOO_MANY_ERRORS`).
const STATUS_WIDTH: usize = 15;

/// Terminal probing.
pub struct Terminal;

impl Terminal {
    pub fn width() -> usize {
        crossterm::terminal::size()
            .map(|(w, _)| w as usize)
            .unwrap_or(80)
    }

    pub fn is_tty() -> bool {
        stdout().is_tty() && stderr().is_tty()
    }
}

/// Low-level formatted printing with a rewritable progress line.
pub struct ConsoleDisplay {
    term_width: usize,
    progress_width: usize,
    color: bool,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self::with_settings(Terminal::width(), Terminal::is_tty())
    }

    pub fn with_settings(width: usize, color: bool) -> Self {
        Self {
            term_width: width.min(MAX_TERM_WIDTH),
            progress_width: 0,
            color,
        }
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.with(color).to_string()
        } else {
            text.to_owned()
        }
    }

    /// Erase the progress line and print `line` on its own row.
    fn reprint(&mut self, line: &str) {
        let width = self.progress_width.min(self.term_width);
        let mut err = stderr();
        let _ = write!(err, "\r{}\r{line}\n", " ".repeat(width));
        let _ = err.flush();
        self.progress_width = line.len();
    }

    /// Rewrite the progress line with the currently running services.
    pub fn print_running(&mut self, running: &[String]) {
        if running.is_empty() {
            return;
        }
        let line = format!("[{}]", running.join(","));
        let width = self.progress_width.min(self.term_width);
        let mut out = stdout();
        let _ = write!(out, "\r{}\r{line}\r", " ".repeat(width));
        let _ = out.flush();
        self.progress_width = line.len();
    }

    /// One status row: name left, bracketed colored status right.
    pub fn format_status_line(&self, name: &str, status: Status) -> String {
        let (label, color) = match status {
            Status::Done => ("OK".to_owned(), Color::Green),
            Status::Warning => (status.to_string(), Color::Yellow),
            _ => (status.to_string(), Color::Red),
        };
        let status_width = STATUS_WIDTH;
        let padded = format!("{label:^status_width$}");
        let name_width = self.term_width.saturating_sub(STATUS_WIDTH + 4);
        format!(
            "{name:<name_width$}  [{}]",
            self.paint(&padded, color)
        )
    }

    pub fn print_status(&mut self, name: &str, status: Status) {
        let line = self.format_status_line(name, status);
        self.reprint(&line);
    }

    /// Echo the command an action is about to run.
    pub fn print_action_command(&mut self, action: &ActionSnapshot) {
        let target = action.target.clone().unwrap_or_else(|| "localhost".to_owned());
        let line = format!(
            "{} {} {} {}\n > {}",
            self.paint(&action.name, Color::Magenta),
            action.service,
            self.paint("on", Color::Magenta),
            target,
            self.paint(action.command.as_deref().unwrap_or("-"), Color::Cyan),
        );
        self.reprint(&line);
    }

    /// Grouped per-node output and exit codes of a finished action.
    pub fn print_action_results(&mut self, action: &ActionSnapshot) {
        let mut line = format!(
            "{} {} ran in {:.2} s",
            self.paint(&action.name, Color::Magenta),
            action.service,
            action.duration.unwrap_or(0.0),
        );
        if let Some(report) = &action.report {
            for (output, nodes) in &report.outputs {
                let nodes = nodes.to_string();
                for text in output.lines() {
                    line.push_str(&format!(
                        "\n > {}: {text}",
                        self.paint(&nodes, Color::Cyan)
                    ));
                }
            }
            for (rc, nodes) in &report.retcodes {
                let rc_color = if *rc == 0 { Color::Green } else { Color::Red };
                line.push_str(&format!(
                    "\n > {} exit code {}",
                    self.paint(&nodes.to_string(), Color::Cyan),
                    self.paint(&rc.to_string(), rc_color)
                ));
            }
            if report.timed_out {
                line.push_str(&format!("\n > {}", self.paint("timed out", Color::Red)));
            }
        }
        self.reprint(&line);
    }

    /// Note that an action is sitting behind its delay timer.
    pub fn print_delayed(&mut self, action: &ActionSnapshot) {
        let line = format!(
            "{} {} {} {} s",
            self.paint(&action.name, Color::Magenta),
            action.service,
            self.paint("will fire in", Color::Magenta),
            action.delay.as_secs_f64(),
        );
        self.reprint(&line);
    }
}

impl Default for ConsoleDisplay {
    fn default() -> Self {
        Self::new()
    }
}

/// Services that ended badly, collected for the final summary.
#[derive(Debug, Default)]
pub struct Summary {
    pub failed: Vec<(String, Status)>,
    pub warned: Vec<String>,
}

/// Observer wiring engine events onto the console at a verbosity level.
///
/// Level 1 prints per-service status rows, level 2 adds action commands,
/// delay notices and failed-action output, level 3 prints every action's
/// output.
pub struct ConsoleView {
    verbosity: u8,
    display: ConsoleDisplay,
    summary: Arc<Mutex<Summary>>,
}

impl ConsoleView {
    pub fn new(verbosity: u8) -> (Self, Arc<Mutex<Summary>>) {
        let summary = Arc::new(Mutex::new(Summary::default()));
        (
            Self {
                verbosity,
                display: ConsoleDisplay::new(),
                summary: Arc::clone(&summary),
            },
            summary,
        )
    }
}

impl UserView for ConsoleView {
    fn ev_started(&mut self, entity: &EntitySnapshot) {
        if let EntitySnapshot::Action(action) = entity {
            if self.verbosity >= 2 {
                self.display.print_action_command(action);
            }
        }
    }

    fn ev_complete(&mut self, entity: &EntitySnapshot) {
        if let EntitySnapshot::Action(action) = entity {
            let failed = action.status.is_failed();
            if self.verbosity >= 3 || (failed && self.verbosity >= 2) {
                self.display.print_action_results(action);
            }
        }
    }

    fn ev_status_changed(&mut self, entity: &EntitySnapshot) {
        let EntitySnapshot::Service(service) = entity else {
            return;
        };
        if !service.status.is_terminal() {
            return;
        }
        if service.status.is_failed() {
            let mut summary = self.summary.lock().unwrap();
            summary.failed.push((service.name.clone(), service.status));
        } else if service.status == Status::Warning {
            self.summary.lock().unwrap().warned.push(service.name.clone());
        }
        if self.verbosity >= 1 && !service.simulate {
            self.display.print_status(&service.name, service.status);
        }
    }

    fn ev_delayed(&mut self, action: &ActionSnapshot) {
        if self.verbosity >= 2 {
            self.display.print_delayed(action);
        }
    }

    fn ev_running(&mut self, running: &[String]) {
        if self.verbosity >= 1 {
            self.display.print_running(running);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use milkcheck_core::runner::WorkerReport;
    use std::time::Duration;

    fn plain(width: usize) -> ConsoleDisplay {
        ConsoleDisplay::with_settings(width, false)
    }

    fn snapshot(status: Status) -> ActionSnapshot {
        ActionSnapshot {
            name: "start".to_owned(),
            service: "nfs".to_owned(),
            status,
            command: Some("service nfs start".to_owned()),
            target: Some("node[1-2]".to_owned()),
            delay: Duration::from_secs(3),
            duration: Some(1.5),
            report: Some(WorkerReport::local(0, "started\n")),
        }
    }

    #[test]
    fn status_line_right_aligns_the_status() {
        let display = plain(80);
        let line = display.format_status_line("nfs", Status::Done);
        assert!(line.starts_with("nfs"));
        assert!(line.ends_with("]"));
        assert!(line.contains("OK"));
    }

    #[test]
    fn failed_status_keeps_its_name() {
        let display = plain(80);
        let line = display.format_status_line("nfs", Status::TooManyErrors);
        assert!(line.contains("TOO_MANY_ERRORS"));
    }

    #[test]
    fn very_wide_terminal_is_clamped() {
        let display = plain(500);
        let line = display.format_status_line("nfs", Status::Done);
        assert!(line.len() <= MAX_TERM_WIDTH + 4, "line: {}", line.len());
    }

    #[test]
    fn view_collects_summary_without_verbosity() {
        let (mut view, summary) = ConsoleView::new(0);
        view.ev_status_changed(&EntitySnapshot::Service(
            milkcheck_core::view::ServiceSnapshot {
                name: "nfs".to_owned(),
                status: Status::TooManyErrors,
                simulate: false,
            },
        ));
        view.ev_status_changed(&EntitySnapshot::Service(
            milkcheck_core::view::ServiceSnapshot {
                name: "mon".to_owned(),
                status: Status::Warning,
                simulate: false,
            },
        ));
        let summary = summary.lock().unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.warned, vec!["mon"]);
    }

    #[test]
    fn action_events_respect_verbosity() {
        // Verbosity 0: the view stays quiet; this only checks we do not
        // panic formatting snapshots at every level.
        for verbosity in 0..=3 {
            let (mut view, _summary) = ConsoleView::new(verbosity);
            let action = snapshot(Status::Done);
            view.ev_started(&EntitySnapshot::Action(action.clone()));
            view.ev_delayed(&action);
            view.ev_complete(&EntitySnapshot::Action(action));
        }
    }
}
