use shared::domain::{Entity, EntityPayload, ErrorKind, Session};

/// Full text rendering of a snapshot, one entry per output line.
pub fn render(session: &Session) -> Vec<String> {
    let mut lines = Vec::new();
    match &session.id {
        Some(id) => lines.push(format!("[{}] session {id}", session.phase)),
        None => lines.push(format!("[{}] no session, type /start role <role>", session.phase)),
    }
    if let Some(welcome) = &session.welcome {
        lines.push(format!("assistant: {welcome}"));
    }
    for (index, entity) in session.entities.iter().enumerate() {
        render_entity(index, entity, &mut lines);
    }
    if session.dirty {
        let pending = session.entities.iter().filter(|e| e.is_pending()).count();
        lines.push(format!(
            "unsaved: {pending} pending, {} removed (use /save)",
            session.removed.len()
        ));
    }
    if let Some(error) = &session.error {
        lines.push(format!("error ({}): {}", error_label(error.kind), error.message));
    }
    lines
}

/// Lines of `next` from the first one that differs from `prev`.
pub fn changed_lines<'a>(prev: &[String], next: &'a [String]) -> &'a [String] {
    let unchanged = prev
        .iter()
        .zip(next)
        .take_while(|(before, after)| before == after)
        .count();
    &next[unchanged..]
}

fn render_entity(index: usize, entity: &Entity, lines: &mut Vec<String>) {
    let marker = if entity.is_pending() { " (pending)" } else { "" };
    match &entity.payload {
        EntityPayload::Exchange {
            prompt,
            reply,
            actions,
        } => {
            if let Some(prompt) = prompt {
                lines.push(format!("#{index} you: {prompt}{marker}"));
            }
            if let Some(reply) = reply {
                lines.push(format!("#{index} assistant: {reply}"));
            }
            if !actions.is_empty() {
                lines.push(format!("#{index}   suggested: {}", actions.join(" | ")));
            }
        }
        EntityPayload::FileUpload {
            filename,
            reply,
            result,
        } => {
            let summary = match result {
                Some(result) => format!("{} records", result.record_count),
                None => "uploading".to_string(),
            };
            lines.push(format!("#{index} file {filename}: {summary}{marker}"));
            for warning in result.iter().flat_map(|r| &r.warnings) {
                lines.push(format!("#{index}   warning: {warning}"));
            }
            if let Some(reply) = reply {
                lines.push(format!("#{index} assistant: {reply}"));
            }
        }
        EntityPayload::ScheduleProposal { proposal } => {
            lines.push(format!("#{index} proposal: {proposal}"));
            lines.push(format!("#{index}   /confirm to accept, /decline to revise"));
        }
        EntityPayload::Progress { progress } => {
            let mut line = format!(
                "#{index} creating {}: {}/{} ({}%)",
                progress.stage,
                progress.completed,
                progress.total,
                progress.percent()
            );
            if let Some(detail) = &progress.detail {
                line.push_str(&format!(" {detail}"));
            }
            lines.push(line);
        }
        EntityPayload::Record { record, fields } => {
            let fields = fields
                .iter()
                .map(|(key, value)| match value {
                    serde_json::Value::String(text) => format!("{key}={text}"),
                    other => format!("{key}={other}"),
                })
                .collect::<Vec<_>>()
                .join(" ");
            let marker = if entity.is_pending() { " [unsaved]" } else { "" };
            lines.push(format!("#{index} {} {fields}{marker}", record.as_str()));
        }
        EntityPayload::Notice { message } => lines.push(format!("#{index} ! {message}")),
    }
}

fn error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Network => "network",
        ErrorKind::Server => "server",
        ErrorKind::Timeout => "timeout",
        ErrorKind::ServerReported => "session failed",
        ErrorKind::Protocol => "unexpected response",
    }
}
