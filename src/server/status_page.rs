//! Minimal HTML view of a job, refreshed by the browser until it settles.

use crate::jobs::{Job, JobStatus};

/// Seconds between reloads while a job is still queued or processing.
pub const REFRESH_INTERVAL_SECS: u32 = 3;

fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn page(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         {}<title>{}</title>\n</head>\n<body>\n{}</body>\n</html>\n",
        head_extra,
        escape_html(title),
        body
    )
}

pub fn render_status_page(job: &Job) -> String {
    let refresh = if job.status.is_terminal() {
        String::new()
    } else {
        format!(
            "<meta http-equiv=\"refresh\" content=\"{}\">\n",
            REFRESH_INTERVAL_SECS
        )
    };

    let mut body = format!(
        "<h1>Mastering job</h1>\n<p>Track: {}</p>\n\
         <p>Status: <strong>{}</strong></p>\n<p>Requested method: {}</p>\n",
        escape_html(&job.input_ref.original_name),
        job.status,
        job.method_requested.as_str(),
    );

    match job.status {
        JobStatus::Queued => body.push_str("<p>Waiting for a free worker...</p>\n"),
        JobStatus::Processing => body.push_str("<p>Mastering in progress...</p>\n"),
        JobStatus::Completed => {
            if let Some(method_used) = job.method_used {
                body.push_str(&format!("<p>Method used: {}</p>\n", method_used));
            }
            body.push_str(&format!(
                "<p><a href=\"/download/{}\">Download mastered {}</a></p>\n",
                escape_html(&job.id),
                job.export_format.extension()
            ));
        }
        JobStatus::Failed => {
            let error = job.error.as_deref().unwrap_or("processing failed");
            body.push_str(&format!("<p>Error: {}</p>\n", escape_html(error)));
        }
    }

    if !job.attempts.is_empty() {
        body.push_str("<h2>Attempted methods</h2>\n<ol>\n");
        for attempt in &job.attempts {
            let outcome = match (&attempt.error, attempt.succeeded) {
                (_, true) => "ok".to_string(),
                (Some(error), false) => escape_html(error),
                (None, false) => "failed".to_string(),
            };
            body.push_str(&format!(
                "<li>{} ({} ms): {}</li>\n",
                attempt.tier, attempt.elapsed_ms, outcome
            ));
        }
        body.push_str("</ol>\n");
    }

    page("Mastering job", &refresh, &body)
}

pub fn render_not_found(job_id: &str) -> String {
    page(
        "Job not found",
        "",
        &format!(
            "<h1>Job not found</h1>\n<p>No job with id {} exists. It may have expired.</p>\n",
            escape_html(job_id)
        ),
    )
}
