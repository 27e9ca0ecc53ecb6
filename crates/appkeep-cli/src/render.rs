use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use appkeep_core::{InventoryEntry, ProgressEvent};
use appkeep_installer::ScannedApplication;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

/// Progress display for one install or uninstall.
pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    percent: u8,
    last_message: Option<String>,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn eprint_status(self, status: &str, message: &str) {
        eprintln!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!("{}", colorize(section_style(), &line));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn eprint_lines(self, lines: &[String]) {
        for line in lines {
            eprintln!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str) -> TerminalProgress {
        let progress_bar = (self.style == OutputStyle::Rich).then(|| {
            let progress_bar = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<28} [{bar:20.cyan/blue}] {pos:>3}% {elapsed_precise}",
            ) {
                progress_bar.set_style(
                    style
                        .tick_chars(progress_tick_chars(label))
                        .progress_chars("=>-"),
                );
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            progress_bar
        });

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            percent: 0,
            last_message: None,
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    pub(crate) fn update(&mut self, percent: u8, message: &str) {
        self.percent = percent.min(100).max(self.percent);
        let changed = self.last_message.as_deref() != Some(message);
        if changed {
            self.last_message = Some(message.to_string());
        }

        match &self.progress_bar {
            Some(progress_bar) => {
                progress_bar.set_position(u64::from(self.percent));
                if changed {
                    progress_bar.set_message(message.to_string());
                }
            }
            None if changed => println!("{}", render_status_line(self.style, "step", message)),
            None => {}
        }
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            100,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty()),
    )
}

pub(crate) fn resolve_output_style(stdout_is_terminal: bool, no_color: bool) -> OutputStyle {
    if stdout_is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        "step" => "[..]",
        _ => "[--]",
    }
}

/// Lines describing an operation's terminal event: the outcome, then any
/// degradations it carried.
pub(crate) fn format_terminal_lines(style: OutputStyle, event: &ProgressEvent) -> Vec<String> {
    match event {
        ProgressEvent::Completed { message, details } => {
            let details = details.as_ref();
            let degraded = details
                .and_then(|value| value.get("degraded"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let mut lines = vec![render_status_line(
                style,
                if degraded { "warn" } else { "ok" },
                message,
            )];

            let placeholder_reason = details
                .filter(|value| value.get("placeholder").and_then(Value::as_bool) == Some(true))
                .and_then(|value| value.get("reason"))
                .and_then(Value::as_str);
            if let Some(reason) = placeholder_reason {
                lines.push(render_status_line(
                    style,
                    "warn",
                    &format!("placeholder installed: {reason}"),
                ));
            }

            let notes = details
                .and_then(|value| value.get("notes"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str);
            for note in notes {
                lines.push(render_status_line(style, "warn", note));
            }
            lines
        }
        ProgressEvent::Error {
            message,
            kind,
            details,
        } => {
            let mut lines = vec![render_status_line(style, "err", &format!("{message} ({kind})"))];
            if let Some(details) = details {
                lines.push(format!("  {details}"));
            }
            lines
        }
        ProgressEvent::Progress { message, .. } => vec![render_status_line(style, "step", message)],
    }
}

pub(crate) fn format_scan_lines(apps: &[ScannedApplication], style: OutputStyle) -> Vec<String> {
    if apps.is_empty() {
        return vec!["No applications found".to_string()];
    }
    apps.iter()
        .map(|app| {
            application_line(
                style,
                &app.name,
                &app.version,
                &app.path.display().to_string(),
                app.is_system_app,
            )
        })
        .collect()
}

pub(crate) fn format_inventory_lines(
    entries: &[InventoryEntry],
    identity: &str,
    style: OutputStyle,
) -> Vec<String> {
    if entries.is_empty() {
        return vec![format!("No applications recorded for {identity}")];
    }
    entries
        .iter()
        .map(|entry| {
            application_line(
                style,
                &entry.name,
                &entry.version,
                &entry.path,
                entry.is_system_app,
            )
        })
        .collect()
}

fn application_line(
    style: OutputStyle,
    name: &str,
    version: &str,
    path: &str,
    is_system_app: bool,
) -> String {
    let name = match style {
        OutputStyle::Plain => name.to_string(),
        OutputStyle::Rich => colorize(name_style(), name),
    };
    let marker = if is_system_app { " (system)" } else { "" };
    format!("{name} {version} {path}{marker}")
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "uninstall" => "\\|/- ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn name_style() -> Style {
    Style::new().effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

pub(crate) fn render_progress_line(
    style: OutputStyle,
    label: &str,
    percent: u8,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let percent = percent.min(100);
    let filled = usize::from(percent) * width / 100;
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}%{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        suffix
    ))
}
