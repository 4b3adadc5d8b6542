use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use esky_finder::{DownloadPhase, DownloadStatus};
use esky_installer::{CleanupReport, InstalledVersion};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => format!("{status}: {message}"),
        OutputStyle::Rich => format!(
            "{} {message}",
            colorize(status_style(status), &format!("{status:>7}"))
        ),
    }
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "ok" | "active" | "installed" => AnsiColor::BrightGreen,
        "warn" | "locked" | "skipped" | "removable" => AnsiColor::BrightYellow,
        "error" | "failed" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightCyan,
    };
    Style::new()
        .fg_color(Some(color.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn format_version_lines(style: OutputStyle, versions: &[InstalledVersion]) -> Vec<String> {
    versions
        .iter()
        .map(|installed| {
            render_status_line(
                style,
                installed.status.as_str(),
                &format!("{} ({})", installed.name, installed.path.display()),
            )
        })
        .collect()
}

pub(crate) fn format_cleanup_lines(style: OutputStyle, report: &CleanupReport) -> Vec<String> {
    let mut lines = Vec::new();
    for version in &report.removed {
        lines.push(render_status_line(style, "ok", &format!("removed {version}")));
    }
    for (version, reason) in &report.skipped {
        lines.push(render_status_line(
            style,
            "skipped",
            &format!("kept {version} ({})", reason.as_str()),
        ));
    }
    for (version, reason) in &report.failed {
        lines.push(render_status_line(
            style,
            "failed",
            &format!("could not remove {version}: {reason}"),
        ));
    }
    for scratch in &report.recovered_transactions {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("rolled back interrupted transaction {}", scratch.display()),
        ));
    }
    if lines.is_empty() {
        lines.push(render_status_line(style, "ok", "nothing to clean up"));
    }
    lines
}

/// Renders fetch progress: a byte bar on terminals, one line per phase
/// change otherwise.
pub(crate) struct FetchProgress {
    style: OutputStyle,
    bar: Option<ProgressBar>,
    last: Option<(String, DownloadPhase)>,
}

impl FetchProgress {
    pub(crate) fn new(style: OutputStyle) -> Self {
        Self {
            style,
            bar: None,
            last: None,
        }
    }

    pub(crate) fn update(&mut self, status: &DownloadStatus) {
        let key = (status.file.clone(), status.phase);
        let changed = self.last.as_ref() != Some(&key);
        self.last = Some(key);

        if self.style == OutputStyle::Plain {
            if changed {
                println!("{}", progress_line(status));
            }
            return;
        }

        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<28} [{bar:20.cyan/blue}] {bytes:>10}/{total_bytes:10}",
            ) {
                bar.set_style(style.progress_chars("=>-"));
            }
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        if let Some(total) = status.total {
            bar.set_length(total.max(1));
        }
        bar.set_position(status.fetched);
        bar.set_message(format!("{} {}", status.phase.as_str(), status.file));
        if changed && status.phase != DownloadPhase::Downloading {
            bar.println(progress_line(status));
        }
    }

    pub(crate) fn finish(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

pub(crate) fn progress_line(status: &DownloadStatus) -> String {
    match status.total {
        Some(total) => format!(
            "{} {} ({}/{})",
            status.phase.as_str(),
            status.file,
            HumanBytes(status.fetched),
            HumanBytes(total)
        ),
        None => format!(
            "{} {} ({})",
            status.phase.as_str(),
            status.file,
            HumanBytes(status.fetched)
        ),
    }
}
