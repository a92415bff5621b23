use core::fmt;

use fastrace::Span;

use crate::common::SpanAttribute;

/// Attaches the error of a failed result to `span`.
pub fn record_error<T, E>(span: &Span, result: &Result<T, E>)
where
    E: fmt::Display,
{
    if let Err(e) = result {
        span.add_property(|| (SpanAttribute::EXCEPTION_MESSAGE, e.to_string()));
    }
}

/// Describes a launch on its span so that traces can be grouped by task and domain.
pub fn record_launch(span: &Span, task_id: i64, launch_domain: Option<&str>, concurrent: bool) {
    span.add_properties(|| {
        [
            (SpanAttribute::TASK_ID, task_id.to_string()),
            (
                SpanAttribute::LAUNCH_DOMAIN,
                launch_domain.unwrap_or("single").to_string(),
            ),
            (SpanAttribute::LAUNCH_CONCURRENT, concurrent.to_string()),
        ]
    });
}
