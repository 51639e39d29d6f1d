use std::fmt::Write;

use super::{ContextBundle, Profile};

/// Longest excerpt of a past message carried into the prompt.
const EXCERPT_CHARS: usize = 200;

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn optional(label: &str, value: &Option<String>) -> String {
    match value.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => format!(" | {}: {}", label, text),
        _ => String::new(),
    }
}

fn section(out: &mut String, heading: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}:", heading);
    for line in lines {
        let _ = writeln!(out, "- {}", line);
    }
    out.push('\n');
}

fn profile_lines(profile: &Profile) -> Vec<String> {
    let mut lines = Vec::new();
    match profile {
        Profile::Student {
            school,
            grade_level,
            career_interests,
            career_pathways,
        } => {
            if let Some(school) = school {
                lines.push(format!("School: {}", school));
            }
            if let Some(grade) = grade_level {
                lines.push(format!("Grade level: {}", grade));
            }
            if !career_interests.is_empty() {
                lines.push(format!("Career interests: {}", career_interests.join(", ")));
            }
            if !career_pathways.is_empty() {
                lines.push(format!("Career pathways: {}", career_pathways.join(", ")));
            }
        }
        Profile::Counselor {
            school,
            specializations,
        } => {
            if let Some(school) = school {
                lines.push(format!("School: {}", school));
            }
            if !specializations.is_empty() {
                lines.push(format!("Specializations: {}", specializations.join(", ")));
            }
        }
        Profile::Company {
            company_name,
            industry,
            description,
        } => {
            lines.push(format!("Company: {}", company_name));
            if let Some(industry) = industry {
                lines.push(format!("Industry: {}", industry));
            }
            if let Some(description) = description {
                lines.push(format!("About: {}", truncate(description, EXCERPT_CHARS)));
            }
        }
    }
    lines
}

/// Render a bundle as plain text for the system instruction.
///
/// Sections always appear in the same order and empty ones are left out,
/// so equal bundles render to equal text.
pub fn render_prompt(bundle: &ContextBundle) -> String {
    let mut out = String::new();

    let user = &bundle.user;
    let _ = writeln!(out, "USER: {} ({})", user.name, user.role.label());
    out.push('\n');

    if let Some(profile) = &bundle.profile {
        section(&mut out, "PROFILE", &profile_lines(profile));
    }

    let applications: Vec<String> = bundle
        .job_applications
        .iter()
        .map(|app| {
            format!(
                "{}{} | status: {} | applied: {}",
                app.job_title,
                optional("company", &app.company_name),
                app.status,
                app.applied_at
            )
        })
        .collect();
    section(&mut out, "JOB APPLICATIONS", &applications);

    let meetings: Vec<String> = bundle
        .meetings
        .iter()
        .map(|meeting| {
            format!(
                "{} with {} at {} ({})",
                meeting.title, meeting.counterpart_name, meeting.scheduled_at, meeting.status
            )
        })
        .collect();
    section(&mut out, "UPCOMING MEETINGS", &meetings);

    let jobs: Vec<String> = bundle
        .jobs
        .iter()
        .map(|job| {
            let mut line = job.title.clone();
            line.push_str(&optional("company", &job.company_name));
            line.push_str(&optional("location", &job.location));
            line.push_str(&optional("type", &job.job_type));
            line.push_str(&optional("deadline", &job.deadline));
            if let Some(summary) = job.summary.as_deref().filter(|s| !s.trim().is_empty()) {
                line.push_str(&format!(" | {}", truncate(summary, EXCERPT_CHARS)));
            }
            line
        })
        .collect();
    section(&mut out, "RELEVANT JOBS", &jobs);

    let events: Vec<String> = bundle
        .events
        .iter()
        .map(|event| {
            format!(
                "{} on {}{}",
                event.title,
                event.event_date,
                optional("location", &event.location)
            )
        })
        .collect();
    section(&mut out, "UPCOMING EVENTS", &events);

    let news: Vec<String> = bundle
        .news
        .iter()
        .map(|item| {
            let mut line = format!("{} ({})", item.title, item.published_at);
            if let Some(summary) = item.summary.as_deref().filter(|s| !s.trim().is_empty()) {
                line.push_str(&format!(": {}", truncate(summary, EXCERPT_CHARS)));
            }
            line
        })
        .collect();
    section(&mut out, "LATEST NEWS", &news);

    let conversations: Vec<String> = bundle
        .recent_conversations
        .iter()
        .map(|conversation| {
            let mut line = format!("\"{}\" (last active {})", conversation.title, conversation.updated_at);
            for message in &conversation.messages {
                let speaker = if message.is_user { "User" } else { "Assistant" };
                let _ = write!(
                    line,
                    "\n    {}: {}",
                    speaker,
                    truncate(&message.content, EXCERPT_CHARS)
                );
            }
            line
        })
        .collect();
    section(&mut out, "RECENT CONVERSATIONS", &conversations);

    out.trim_end().to_string()
}
