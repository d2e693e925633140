//! Human-readable renderings of contexts for diagnostics.

use object::{ContextLink, ObjectMemory, Oop, Value};

/// Frames printed before a trace is cut short.
const MAX_FRAMES: usize = 64;

/// `Class>>selector`, or `[] in Class>>selector` for block code.
pub fn method_label(memory: &ObjectMemory, code: Oop) -> String {
    let Ok(code) = memory.code(code) else {
        return "<not a method>".to_string();
    };
    let holder = match code.holder {
        Value::Ref(class) if memory.class_body(class).is_ok() => memory.class_name(class).to_string(),
        _ => "?".to_string(),
    };
    let selector = memory.string_of(code.selector).unwrap_or("doit");
    let prefix = if code.is_block() { "[] in " } else { "" };
    format!("{prefix}{holder}>>{selector}")
}

/// One line for `ctx`: identity, method label, receiver and arguments.
pub fn describe_context(memory: &ObjectMemory, ctx: Oop) -> String {
    let Ok(body) = memory.context(ctx) else {
        return format!("{ctx:?} <not a context>");
    };
    let num_args = memory.code(body.code).map(|c| c.header.num_args as usize).unwrap_or(0);
    let args: Vec<String> = body
        .stack
        .iter()
        .take(num_args)
        .map(|v| memory.describe(*v))
        .collect();
    let state = if body.pc.is_none() { " (returned)" } else { "" };
    format!(
        "{ctx:?} {} receiver: {} args: [{}]{state}",
        method_label(memory, body.code),
        memory.describe(body.receiver),
        args.join(", ")
    )
}

/// The sender chain starting at `ctx`, innermost first. Links to
/// activations that never left the native stack end the trace.
pub fn stack_trace(memory: &ObjectMemory, ctx: Oop) -> Vec<String> {
    let mut lines = Vec::new();
    let mut seen = Vec::new();
    let mut current = Some(ctx);
    while let Some(ctx) = current {
        if lines.len() == MAX_FRAMES {
            lines.push("...".to_string());
            break;
        }
        if seen.contains(&ctx) {
            lines.push(format!("{ctx:?} <cycle>"));
            break;
        }
        seen.push(ctx);
        lines.push(describe_context(memory, ctx));
        current = match memory.context(ctx).map(|body| body.sender) {
            Ok(ContextLink::Context(sender)) => Some(sender),
            Ok(ContextLink::Frame(marker)) => {
                lines.push(format!("<native activation {}>", marker.id()));
                None
            }
            _ => None,
        };
    }
    lines
}
