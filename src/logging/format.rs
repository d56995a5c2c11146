//! Plain text log format.
//!
//! `LEVEL APP target: message (outer > inner{field=value})`

use crate::APP_NAME;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

pub(crate) struct LookupLogFormat;

impl<S, N> FormatEvent<S, N> for LookupLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{:<5} {} {}: ",
            metadata.level(),
            APP_NAME.as_str(),
            metadata.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        let mut in_scope = false;
        if let Some(scope) = ctx.event_scope() {
            // Outermost span first.
            for span in scope.from_root() {
                write!(writer, "{}{}", if in_scope { " > " } else { " (" }, span.name())?;
                in_scope = true;

                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
        }

        if in_scope {
            write!(writer, ")")?;
        }

        writeln!(writer)
    }
}
