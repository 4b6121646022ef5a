//! Command handlers. Each takes the wired service, does the work, and
//! returns the reply text for the invoking room. Adapter-specific command
//! parsing (slash commands, mentions) lives with the adapter; this layer is
//! platform-neutral.

use crate::delivery::DeliveryStatus;
use crate::error::{ConfigError, PipelineError};
use crate::model::OutputFormat;
use crate::report::BrowserInstaller;
use crate::scheduler::Scheduler;
use crate::Service;
use tracing::error;

/// Sub-actions of the settings command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsAction {
    Enable,
    Disable,
    Status,
    Reload,
    Test,
}

impl SettingsAction {
    pub fn parse(s: &str) -> Option<SettingsAction> {
        match s.to_ascii_lowercase().as_str() {
            "enable" => Some(SettingsAction::Enable),
            "disable" => Some(SettingsAction::Disable),
            "status" => Some(SettingsAction::Status),
            "reload" => Some(SettingsAction::Reload),
            "test" => Some(SettingsAction::Test),
            _ => None,
        }
    }
}

/// On-demand analysis of the last `days` of history.
pub async fn analyze(service: &Service, room_id: &str, days: Option<i64>) -> String {
    match service.run_analysis(room_id, days).await {
        Ok(DeliveryStatus::Sent) => "Report delivered.".to_string(),
        Ok(DeliveryStatus::Queued) => {
            "Report is on its way; the server is being slow, retrying in the background."
                .to_string()
        }
        Err(e) => reply_for_failure(room_id, &e),
    }
}

/// Profile of the invoking member, built from their own recent messages.
pub async fn personal_report(
    service: &Service,
    room_id: &str,
    sender_id: &str,
    days: Option<i64>,
) -> String {
    match service.run_personal_report(room_id, sender_id, days).await {
        Ok(report) => report,
        Err(e) => {
            if let Some(PipelineError::InsufficientData { .. }) = e.downcast_ref() {
                return "You have no messages in the analysis window yet.".to_string();
            }
            reply_for_failure(room_id, &e)
        }
    }
}

/// Generates and posts a poll built from recent history.
pub async fn dialogue_poll(
    service: &Service,
    room_id: &str,
    days: Option<i64>,
    guidance: Option<String>,
) -> String {
    match service.run_dialogue_poll(room_id, days, guidance).await {
        Ok(()) => "Poll posted, go vote!".to_string(),
        Err(e) => reply_for_failure(room_id, &e),
    }
}

pub async fn settings(
    service: &Service,
    scheduler: &Scheduler,
    room_id: &str,
    action: SettingsAction,
) -> String {
    match action {
        SettingsAction::Enable => match service.store.enable(room_id).await {
            Ok(()) => {
                scheduler.reload();
                "Daily analysis enabled for this room.".to_string()
            }
            Err(e) => persist_failure(&e),
        },
        SettingsAction::Disable => match service.store.disable(room_id).await {
            Ok(()) => {
                scheduler.reload();
                "Daily analysis disabled for this room.".to_string()
            }
            Err(e) => persist_failure(&e),
        },
        SettingsAction::Status => status_text(service, scheduler, room_id),
        SettingsAction::Reload => match service.store.reload().await {
            Ok(()) => {
                scheduler.reload();
                "Room table reloaded from disk.".to_string()
            }
            Err(e) => persist_failure(&e),
        },
        SettingsAction::Test => {
            scheduler.run_once(room_id).await;
            "Test run finished; check the room for the report.".to_string()
        }
    }
}

fn status_text(service: &Service, scheduler: &Scheduler, room_id: &str) -> String {
    let allowed = service.store.is_allowed(room_id);
    let armed = scheduler.armed_rooms().contains(&room_id.to_string());
    let overrides = service.store.overrides_for(room_id);
    let format = overrides
        .output_format
        .unwrap_or_else(|| service.settings.output.format.clone());
    let template = overrides
        .template_id
        .unwrap_or_else(|| service.settings.output.template.clone());
    format!(
        "Room status:\n\
         - access: {}\n\
         - daily analysis: {} (at {})\n\
         - output format: {format}\n\
         - template: {template}",
        if allowed { "allowed" } else { "blocked" },
        if armed { "armed" } else { "off" },
        service.settings.auto_analysis.time,
    )
}

/// Changes the room's output format. Unknown formats leave the store
/// untouched.
pub async fn set_format(
    service: &Service,
    room_id: &str,
    input: &str,
) -> Result<String, ConfigError> {
    let Some(format) = OutputFormat::parse(input) else {
        return Err(ConfigError::invalid(
            "format",
            format!("{input:?} (expected image, text or pdf)"),
        ));
    };
    service.store.set_format(room_id, &format.to_string()).await?;
    Ok(format!("Output format set to {format}."))
}

pub fn list_templates(service: &Service) -> String {
    let mut reply = "Available templates:".to_string();
    for (i, id) in service.renderer.templates().list().iter().enumerate() {
        reply.push_str(&format!("\n{}. {}", i + 1, id));
    }
    reply
}

/// Changes the room's template, by name or 1-based list index. Unknown
/// templates leave the store untouched.
pub async fn set_template(
    service: &Service,
    room_id: &str,
    input: &str,
) -> Result<String, ConfigError> {
    let known = service.renderer.templates().list();
    let chosen = match input.parse::<usize>() {
        Ok(index) if (1..=known.len()).contains(&index) => known[index - 1].clone(),
        Ok(_) => {
            return Err(ConfigError::invalid(
                "template",
                format!("index {input} out of range (1..={})", known.len()),
            ))
        }
        Err(_) if known.iter().any(|id| id == input) => input.to_string(),
        Err(_) => {
            return Err(ConfigError::invalid(
                "template",
                format!("{input:?} is not a known template"),
            ))
        }
    };
    service.store.set_template(room_id, &chosen).await?;
    Ok(format!("Template set to {chosen}."))
}

/// Fetches a headless browser for image/pdf rendering.
pub async fn install_pdf(service: &Service, installer: Option<&dyn BrowserInstaller>) -> String {
    if service.renderer.has_html_renderer() {
        return "A renderer is already configured; nothing to install.".to_string();
    }
    let Some(installer) = installer else {
        return "No installer available on this platform. Install Chromium yourself and set \
                output.pdf.browser_path in the config."
            .to_string();
    };
    match installer.install().await {
        Ok(path) => format!(
            "Browser installed at {}. Set output.pdf.browser_path to it and restart the service.",
            path.display()
        ),
        Err(e) => format!("Install failed: {e}"),
    }
}

fn reply_for_failure(room_id: &str, e: &anyhow::Error) -> String {
    if let Some(PipelineError::InsufficientData { got, needed }) = e.downcast_ref() {
        return format!(
            "Not enough chat to analyze yet: {got} usable messages, {needed} required."
        );
    }
    error!(room = room_id, error = %e, "command failed");
    format!("Analysis failed: {e}")
}

fn persist_failure(e: &ConfigError) -> String {
    error!(error = %e, "room table update failed");
    format!("Could not save the change: {e}")
}
