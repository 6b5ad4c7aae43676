use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use appmux_appd::HomeLayout;
use appmux_registry::VersionRegistry;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    output_style_for(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    )
}

fn output_style_for(is_terminal: bool, no_color: bool) -> OutputStyle {
    if is_terminal && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = format!("[{}]", status.to_ascii_uppercase());
            format!("{} {message}", colorize(status_style(status), &badge))
        }
    }
}

/// One line per registered version, oldest first.
pub(crate) fn format_version_lines(
    registry: &VersionRegistry,
    layout: &HomeLayout,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = Vec::with_capacity(registry.len() + 1);
    if style == OutputStyle::Rich {
        lines.push(colorize(section_style(), "== app versions =="));
    }

    for descriptor in registry.iter() {
        let label = descriptor.binary().label().to_string();
        let activation = match descriptor.activation_height() {
            Some(height) => format!("height {height}"),
            None => "genesis".to_string(),
        };
        let extracted = layout.extraction_stamp_path(&label).exists();
        let state = if extracted { "extracted" } else { "pending" };

        match style {
            OutputStyle::Plain => lines.push(format!(
                "v{} label={label} abci={} activation={activation} binary={} state={state}",
                descriptor.app_version(),
                descriptor.abci_version(),
                descriptor.binary().binary_name(),
            )),
            OutputStyle::Rich => lines.push(format!(
                "{} {label:<12} abci {}  from {activation:<16} {}",
                colorize(version_style(), &format!("v{:<3}", descriptor.app_version())),
                descriptor.abci_version(),
                colorize(state_style(extracted), state),
            )),
        }
    }
    lines
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn version_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn state_style(extracted: bool) -> Style {
    let color = if extracted {
        AnsiColor::Green
    } else {
        AnsiColor::BrightBlack
    };
    Style::new().fg_color(Some(color.into()))
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "ok" => AnsiColor::Green,
        "warn" => AnsiColor::Yellow,
        "error" => AnsiColor::Red,
        _ => AnsiColor::BrightBlue,
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}
